//! OAuth-style session handling shared by provider clients.
//!
//! [`OAuthSession`] owns the connection-level state: base URL, credentials,
//! transport, the client-side header map and the optional open transport
//! session. [`SessionProvider`] is the contract a concrete provider fulfils
//! (`login`, `logout`, `is_connected`, `is_session_expired`); in return it
//! gets `get`/`post` with 401 handling, bounded to a single relogin and retry
//! per request.
//!
//! Sessions are scoped: [`with_session`] logs in, runs the work, and always
//! logs out and closes the transport session afterwards.

pub mod headers;

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::http::{join_url, HttpRequest, HttpResponse, Payload, RequestBody, Transport};
use crate::types::{ClientError, ClientResult, Credentials};

/// Relogin-and-retry budget for a single request hitting 401.
pub const MAX_REAUTH_ATTEMPTS: u32 = 1;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request relative to the session's base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(path: impl Into<String>, body: RequestBody) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_params(mut self, params: &[(&str, &str)]) -> Self {
        self.query
            .extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// An open transport session: the default headers every request carries.
#[derive(Debug, Clone)]
pub struct HttpSession {
    headers: HeaderMap,
    requests_sent: u64,
}

impl HttpSession {
    fn open(headers: HeaderMap) -> Self {
        Self {
            headers,
            requests_sent: 0,
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }
}

/// Connection-level state shared by every provider.
pub struct OAuthSession {
    base_url: Url,
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    headers: HeaderMap,
    http: Option<HttpSession>,
}

impl OAuthSession {
    pub fn new(base_url: &str, credentials: Credentials, transport: Arc<dyn Transport>) -> ClientResult<Self> {
        Ok(Self {
            base_url: Url::parse(base_url)?,
            credentials,
            transport,
            headers: HeaderMap::new(),
            http: None,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Client-side headers (what the next `refresh` will push to the
    /// transport session).
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn set_headers(&mut self, headers: HeaderMap) {
        self.headers = headers;
    }

    pub fn http_session(&self) -> Option<&HttpSession> {
        self.http.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.http.is_some()
    }

    /// Open a fresh transport session seeded with the current headers.
    pub fn open(&mut self) {
        if self.http.is_some() {
            debug!("Replacing an already open transport session");
        }
        self.http = Some(HttpSession::open(self.headers.clone()));
    }

    /// Push the client headers into the open transport session.
    pub fn refresh(&mut self) {
        if let Some(http) = self.http.as_mut() {
            http.headers = self.headers.clone();
        }
    }

    pub fn close(&mut self) {
        if let Some(http) = self.http.take() {
            debug!(requests = http.requests_sent, "Transport session closed");
        }
    }

    /// Send one request through the open session. No status handling.
    pub async fn send(&mut self, request: &ApiRequest) -> ClientResult<HttpResponse> {
        let http = self.http.as_mut().ok_or(ClientError::NoSession)?;

        let mut headers = http.headers.clone();
        if request.body.is_form() {
            headers.remove(CONTENT_TYPE);
        }

        let outgoing = HttpRequest {
            method: request.method.clone(),
            url: join_url(&self.base_url, &request.path)?,
            headers,
            query: request.query.clone(),
            body: request.body.clone(),
        };
        http.requests_sent += 1;

        self.transport.execute(outgoing).await
    }
}

/// Turn a non-2xx response into a request failure.
pub fn ensure_success(response: HttpResponse) -> ClientResult<HttpResponse> {
    if response.status.is_success() {
        Ok(response)
    } else {
        Err(ClientError::request(response.status, response.body))
    }
}

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// Contract between the shared session machinery and a concrete provider.
#[async_trait]
pub trait SessionProvider: Send {
    fn session(&self) -> &OAuthSession;

    fn session_mut(&mut self) -> &mut OAuthSession;

    /// Whether the provider currently holds a usable login.
    fn is_connected(&self) -> bool;

    /// Whether a response with `status` means the login lapsed and a
    /// relogin-and-retry is worth trying.
    fn is_session_expired(&self, status: StatusCode) -> bool;

    async fn login(&mut self) -> ClientResult<()>;

    async fn logout(&mut self) -> ClientResult<()>;

    /// Logout then login. A failed logout does not prevent the login.
    async fn relogin(&mut self) -> ClientResult<()> {
        if let Err(e) = self.logout().await {
            debug!(error = %e, "Logout during relogin failed, continuing");
        }
        self.login().await
    }

    /// Open the transport session and log in.
    async fn start_session(&mut self) -> ClientResult<()> {
        self.session_mut().open();
        self.login().await
    }

    fn refresh_session(&mut self) {
        self.session_mut().refresh();
    }

    /// Log out and close the transport session. The session is closed even
    /// when logout fails.
    async fn close_session(&mut self) -> ClientResult<()> {
        let result = self.logout().await;
        self.session_mut().close();
        result
    }

    /// Send `request`, relogging in at most [`MAX_REAUTH_ATTEMPTS`] times on
    /// an expired session, and return the successful raw response.
    async fn request_raw(&mut self, request: ApiRequest) -> ClientResult<HttpResponse> {
        let mut reauth_attempts = 0;
        loop {
            let response = self.session_mut().send(&request).await?;

            if response.status == StatusCode::UNAUTHORIZED
                && reauth_attempts < MAX_REAUTH_ATTEMPTS
                && self.is_session_expired(response.status)
            {
                reauth_attempts += 1;
                warn!(path = %request.path, "Session expired, re-authenticating");
                self.relogin().await?;
                continue;
            }

            return ensure_success(response);
        }
    }

    /// Like [`request_raw`](Self::request_raw), decoding the body.
    async fn request(&mut self, request: ApiRequest) -> ClientResult<Payload> {
        let response = self.request_raw(request).await?;
        Ok(response.payload())
    }

    async fn get(&mut self, path: &str, params: &[(&str, &str)]) -> ClientResult<Payload> {
        self.request(ApiRequest::get(path).with_params(params)).await
    }

    async fn post(&mut self, path: &str, params: &[(&str, &str)], body: RequestBody) -> ClientResult<Payload> {
        self.request(ApiRequest::post(path, body).with_params(params)).await
    }
}

/// Run `work` inside a session: start (open + login), run, close
/// (logout + close) on every exit path.
///
/// ```no_run
/// # use cotps_bot::session::with_session;
/// # use cotps_bot::platforms::cotps::CotpsClient;
/// # async fn demo(client: &mut CotpsClient) -> cotps_bot::types::ClientResult<()> {
/// let report = with_session(client, |c| Box::pin(c.make_transactions())).await?;
/// println!("{report}");
/// # Ok(())
/// # }
/// ```
pub async fn with_session<P, T, F>(provider: &mut P, work: F) -> ClientResult<T>
where
    P: SessionProvider + ?Sized,
    F: for<'a> FnOnce(&'a mut P) -> BoxFuture<'a, ClientResult<T>>,
{
    if let Err(e) = provider.start_session().await {
        if let Err(close_err) = provider.close_session().await {
            debug!(error = %close_err, "Close after failed start also failed");
        }
        return Err(e);
    }

    let outcome = work(&mut *provider).await;
    let closed = provider.close_session().await;

    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "Closing session after a failure also failed");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
