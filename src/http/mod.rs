//! HTTP transport layer.
//!
//! The [`Transport`] trait is the single seam between the client and the
//! network: it executes one fully-built [`HttpRequest`] and hands back the
//! status, headers and body text. [`ReqwestTransport`] is the production
//! implementation; tests substitute an in-memory service.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::types::{ClientError, ClientResult};

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// Body of an outgoing request.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded` key/value pairs.
    Form(Vec<(String, String)>),
    Json(Value),
}

impl RequestBody {
    pub fn form<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        RequestBody::Form(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    pub fn is_form(&self) -> bool {
        matches!(self, RequestBody::Form(_))
    }
}

/// A fully resolved request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

/// A response with its body already read as text.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Decode the body: JSON when it parses, raw text otherwise.
    pub fn payload(&self) -> Payload {
        Payload::from_body(&self.body)
    }
}

/// Decoded body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn from_body(body: &str) -> Self {
        match serde_json::from_str(body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Text(body.to_string()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Text(_) => None,
        }
    }

    /// Interpret a JSON payload as `T`. A text payload is an error.
    pub fn into_json<T: DeserializeOwned>(self) -> ClientResult<T> {
        match self {
            Payload::Json(value) => serde_json::from_value(value)
                .map_err(|e| ClientError::UnexpectedResponse(e.to_string())),
            Payload::Text(text) => Err(ClientError::UnexpectedResponse(format!(
                "expected JSON, got: {}",
                truncate(&text, 200)
            ))),
        }
    }

    pub fn into_value(self) -> ClientResult<Value> {
        self.into_json()
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Resolve `path` against `base` the way a browser resolves a link:
/// an absolute path replaces the base path, a relative one is appended
/// to the base's directory.
pub fn join_url(base: &Url, path: &str) -> ClientResult<Url> {
    Ok(base.join(path)?)
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Executes HTTP requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> ClientResult<HttpResponse>;
}

/// [`Transport`] backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration, user_agent: &str) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> ClientResult<HttpResponse> {
        debug!(method = %request.method, url = %request.url, "COTPS request");

        let mut builder = self
            .http
            .request(request.method, request.url)
            .headers(request.headers);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }

        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(pairs) => builder.form(&pairs),
            RequestBody::Json(value) => builder.json(&value),
        };

        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;

        debug!(status = status.as_u16(), bytes = body.len(), "COTPS response");

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
