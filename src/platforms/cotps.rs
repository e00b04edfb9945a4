//! COTPS integration.
//!
//! Auth: `POST {login}` with a form body (`mobile`, `password`, `type`).
//! The response carries the access token in its `authorization` header and
//! a session cookie in `Set-Cookie`; both go on every later request as
//! `authorization: Bearer {token}` and `Cookie: {cookie}`.
//!
//! The service has no logout endpoint, so logging out only forgets the
//! token and cookie locally.
//!
//! Workflow: while the balance is at or above the threshold, create an
//! order, submit (confirm) it, and re-read the balance.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, EndpointsConfig};
use crate::http::{ReqwestTransport, RequestBody, Transport};
use crate::session::headers::{build_session_headers, cookie_from_response, token_from_header};
use crate::session::{ApiRequest, OAuthSession, SessionProvider};
use crate::types::{
    BalanceSnapshot, ClientError, ClientResult, Credentials, OrderConfirmation, OrderCreation,
    OrderId, Token, TransactionReport,
};

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// COTPS platform client.
pub struct CotpsClient {
    session: OAuthSession,
    endpoints: EndpointsConfig,
    login_type: String,
    balance_threshold: Decimal,
    max_stalled_attempts: u32,
    token: Option<Token>,
    cookie: Option<String>,
    /// Orders confirmed by the current (or last) `make_transactions` run.
    run_orders: Vec<OrderId>,
}

impl CotpsClient {
    /// Create a client over an explicit transport.
    pub fn new(
        config: &AppConfig,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
    ) -> ClientResult<Self> {
        let mut session = OAuthSession::new(&config.service.base_url, credentials, transport)?;
        session.set_headers(build_session_headers(None, None)?);

        Ok(Self {
            session,
            endpoints: config.endpoints.clone(),
            login_type: config.service.login_type.clone(),
            balance_threshold: config.workflow.balance_threshold,
            max_stalled_attempts: config.workflow.max_stalled_attempts,
            token: None,
            cookie: None,
            run_orders: Vec::new(),
        })
    }

    /// Create a client talking to the network through reqwest.
    pub fn from_config(config: &AppConfig, credentials: Credentials) -> ClientResult<Self> {
        let transport = ReqwestTransport::new(
            config.service.request_timeout(),
            &config.service.user_agent(),
        )?;
        Self::new(config, credentials, Arc::new(transport))
    }

    pub fn token(&self) -> Option<&Token> {
        self.token.as_ref()
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    /// Hand over the orders confirmed by the last `make_transactions` run,
    /// including a run that failed part-way.
    pub fn take_run_orders(&mut self) -> Vec<OrderId> {
        std::mem::take(&mut self.run_orders)
    }

    // -- Auth state --------------------------------------------------------

    /// Forget token and cookie and rebuild the (now anonymous) headers.
    fn clear_auth(&mut self) -> ClientResult<()> {
        self.token = None;
        self.cookie = None;
        self.session.set_headers(build_session_headers(None, None)?);
        Ok(())
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::Disconnected)
        }
    }

    // -- Endpoints ---------------------------------------------------------

    /// Current account balance.
    pub async fn get_balance(&mut self) -> ClientResult<BalanceSnapshot> {
        self.ensure_connected()?;
        let path = self.endpoints.balance.clone();
        let value = self.get(&path, &[]).await?.into_value()?;
        BalanceSnapshot::from_value(value)
    }

    /// Ask the service to open a new order.
    pub async fn create_order(&mut self) -> ClientResult<OrderCreation> {
        self.ensure_connected()?;
        let path = self.endpoints.order_create.clone();
        self.get(&path, &[]).await?.into_json()
    }

    /// Submit (confirm) a previously created order.
    pub async fn confirm_order(&mut self, order_id: &OrderId) -> ClientResult<OrderConfirmation> {
        self.ensure_connected()?;
        let path = self.endpoints.order_submit.clone();
        self.get(&path, &[("orderId", order_id.as_str())])
            .await?
            .into_json()
    }

    /// Place and confirm orders until the balance drops below the threshold.
    ///
    /// A creation that does not report success with an order id is skipped
    /// and the balance re-read. Every iteration that leaves the balance no
    /// lower than before counts as stalled; after `max_stalled_attempts`
    /// stalled iterations in a row the run fails with
    /// [`ClientError::WorkflowStalled`]. Any drop in balance resets the count,
    /// so a long but progressing run is never cut short.
    ///
    /// Orders confirmed so far stay available through
    /// [`take_run_orders`](Self::take_run_orders) even when the run fails.
    pub async fn make_transactions(&mut self) -> ClientResult<TransactionReport> {
        self.ensure_connected()?;
        self.run_orders.clear();

        let start_balance = self.get_balance().await?;
        let mut balance = start_balance.clone();
        let mut attempts = 0u32;
        let mut stalled = 0u32;

        debug!(balance = %balance, threshold = %self.balance_threshold, "Starting order run");

        while balance.amount() >= self.balance_threshold {
            if stalled >= self.max_stalled_attempts {
                return Err(ClientError::WorkflowStalled {
                    attempts: stalled,
                    balance: balance.amount(),
                });
            }
            attempts += 1;

            let order = self.create_order().await?;
            match order.actionable_id() {
                Some(order_id) => {
                    let confirmation = self.confirm_order(&order_id).await?;
                    if !confirmation.success {
                        warn!(
                            order_id = %order_id,
                            msg = ?confirmation.msg,
                            "COTPS refused to confirm order"
                        );
                        return Err(ClientError::OrderNotConfirmed { order_id });
                    }
                    info!(order_id = %order_id, balance = %balance, "Order confirmed");
                    self.run_orders.push(order_id);
                }
                None => {
                    warn!(
                        attempt = attempts,
                        success = order.success,
                        msg = ?order.msg,
                        "Order creation not actionable, re-checking balance"
                    );
                }
            }

            let previous = balance.amount();
            balance = self.get_balance().await?;
            if balance.amount() < previous {
                stalled = 0;
            } else {
                stalled += 1;
            }
        }

        Ok(TransactionReport {
            start_balance,
            final_balance: balance,
            confirmed_orders: self.run_orders.clone(),
            attempts,
        })
    }
}

/// Token from a JSON login body (`token` or `data.token`).
fn token_from_body(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("token")
        .or_else(|| value.get("data").and_then(|d| d.get("token")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

/// A JSON login body that explicitly reports `success: false`.
fn login_rejection(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    if value.get("success").and_then(Value::as_bool) == Some(false) {
        let msg = value
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("login rejected");
        Some(msg.to_string())
    } else {
        None
    }
}

/// Keep phone numbers out of the logs: `13812345678` → `138****78`.
fn mask_username(username: &str) -> String {
    let chars: Vec<char> = username.chars().collect();
    if chars.len() <= 5 {
        return "****".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}****{tail}")
}

// ---------------------------------------------------------------------------
// SessionProvider implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionProvider for CotpsClient {
    fn session(&self) -> &OAuthSession {
        &self.session
    }

    fn session_mut(&mut self) -> &mut OAuthSession {
        &mut self.session
    }

    fn is_connected(&self) -> bool {
        self.session.headers().contains_key(AUTHORIZATION) && self.token.is_some()
    }

    /// A 401 while holding a token means COTPS dropped our session.
    fn is_session_expired(&self, status: StatusCode) -> bool {
        status == StatusCode::UNAUTHORIZED && self.token.is_some()
    }

    async fn login(&mut self) -> ClientResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.clear_auth()?;
        self.refresh_session();

        let username = self.session.credentials().username().to_string();
        let password = self.session.credentials().reveal_password()?;
        let form = RequestBody::form([
            ("mobile", username.clone()),
            ("password", password.expose_secret().to_string()),
            ("type", self.login_type.clone()),
        ]);

        info!(user = %mask_username(&username), "Authenticating with COTPS...");

        // Straight to the transport: a 401 here must not trigger a relogin.
        let request = ApiRequest::post(self.endpoints.login.clone(), form);
        let response = self.session.send(&request).await?;

        if !response.status.is_success() {
            return Err(ClientError::Authentication(format!(
                "login returned {}: {}",
                response.status.as_u16(),
                response.body
            )));
        }
        if let Some(msg) = login_rejection(&response.body) {
            return Err(ClientError::Authentication(msg));
        }

        let access = token_from_header(&response.headers)
            .or_else(|| token_from_body(&response.body))
            .ok_or_else(|| ClientError::Authentication("login response carried no token".into()))?;
        let token = Token::bearer(access);
        let cookie = cookie_from_response(&response.headers);

        let headers = build_session_headers(Some(&token), cookie.as_deref())?;
        self.token = Some(token);
        self.cookie = cookie;
        self.session.set_headers(headers);
        self.refresh_session();

        info!(
            user = %mask_username(&username),
            cookie = self.cookie.is_some(),
            "COTPS authentication successful"
        );
        Ok(())
    }

    async fn logout(&mut self) -> ClientResult<()> {
        if !self.is_connected() {
            return Ok(());
        }

        self.clear_auth()?;
        self.refresh_session();

        info!("Logged out of COTPS");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
