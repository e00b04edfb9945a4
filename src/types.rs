//! Shared types for the COTPS client.
//!
//! Credentials and tokens, the typed shapes of the COTPS responses the
//! workflow inspects, and the crate-wide error enum. Everything else in the
//! response bodies is passed through as raw JSON.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Result alias for everything that talks to the COTPS service.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Login credentials for one COTPS account.
///
/// The password is kept base64-encoded inside a [`SecretString`]. That keeps
/// it out of `Debug` output and casual memory dumps, but it is NOT
/// encryption: anything holding a `Credentials` can recover the plaintext.
/// Load credentials from the environment or a secret store, never from
/// source code.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    encoded_password: SecretString,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            encoded_password: SecretString::new(BASE64.encode(password.as_bytes())),
        }
    }

    /// Account login (the registered mobile number).
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Decode the stored password for a login request.
    pub(crate) fn reveal_password(&self) -> ClientResult<SecretString> {
        let bytes = BASE64
            .decode(self.encoded_password.expose_secret())
            .map_err(|e| ClientError::Credentials(format!("stored password is corrupt: {e}")))?;
        let plain = String::from_utf8(bytes)
            .map_err(|_| ClientError::Credentials("stored password is not UTF-8".into()))?;
        Ok(SecretString::new(plain))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

/// Access token issued by the login endpoint.
#[derive(Debug, Clone, Default)]
pub struct Token {
    pub access_token: Option<SecretString>,
    pub token_type: Option<String>,
    pub expires_in: Option<u64>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl Token {
    /// A bearer token as handed out by COTPS (no expiry information).
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(SecretString::new(access_token.into())),
            token_type: Some("Bearer".to_string()),
            expires_in: None,
            issued_at: Some(Utc::now()),
        }
    }

    /// Value for the `authorization` header, e.g. `Bearer abc123`.
    ///
    /// Returns `None` when no access token is held.
    pub fn authorization_value(&self) -> Option<String> {
        let access = self.access_token.as_ref()?;
        let kind = self.token_type.as_deref().unwrap_or("Bearer");
        Some(format!("{} {}", kind, access.expose_secret()))
    }
}

// ---------------------------------------------------------------------------
// Balance
// ---------------------------------------------------------------------------

/// Response of the balance endpoint: the raw document plus the parsed amount
/// at `userinfo.balance`.
///
/// A missing balance field reads as zero. A present but unparsable one is an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSnapshot {
    amount: Decimal,
    raw: Value,
}

impl BalanceSnapshot {
    pub fn from_value(raw: Value) -> ClientResult<Self> {
        let amount = match raw.get("userinfo").and_then(|u| u.get("balance")) {
            None | Some(Value::Null) => Decimal::ZERO,
            Some(Value::String(s)) => parse_amount(s)?,
            Some(Value::Number(n)) => parse_amount(&n.to_string())?,
            Some(other) => {
                return Err(ClientError::UnexpectedResponse(format!(
                    "balance is neither a string nor a number: {other}"
                )))
            }
        };
        Ok(Self { amount, raw })
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    /// The full JSON document returned by the service.
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

impl fmt::Display for BalanceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.amount)
    }
}

fn parse_amount(text: &str) -> ClientResult<Decimal> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Decimal::ZERO);
    }
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| ClientError::UnexpectedResponse(format!("unparsable balance: {text:?}")))
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Server-side order identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderId(String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response of `createOrder`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderCreation {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<OrderData>,
    #[serde(default)]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderData {
    /// Seen as both a string and a number in the wild.
    #[serde(rename = "orderId", default)]
    pub order_id: Option<Value>,
}

impl OrderCreation {
    /// The order id, if the creation succeeded and produced a non-empty one.
    pub fn actionable_id(&self) -> Option<OrderId> {
        if !self.success {
            return None;
        }
        let id = match self.data.as_ref()?.order_id.as_ref()? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        (!id.is_empty()).then(|| OrderId(id))
    }
}

/// Response of `submitOrder`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderConfirmation {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub msg: Option<String>,
}

/// Outcome of one `make_transactions` run.
#[derive(Debug, Clone)]
pub struct TransactionReport {
    pub start_balance: BalanceSnapshot,
    pub final_balance: BalanceSnapshot,
    pub confirmed_orders: Vec<OrderId>,
    /// Number of `createOrder` calls made, actionable or not.
    pub attempts: u32,
}

impl fmt::Display for TransactionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "balance {} -> {} ({} orders confirmed in {} attempts)",
            self.start_balance,
            self.final_balance,
            self.confirmed_orders.len(),
            self.attempts,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Everything that can go wrong between the client and the COTPS service.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("No active session: call start_session() or use with_session() first")]
    NoSession,

    #[error("Client is disconnected")]
    Disconnected,

    #[error("Request failed with status {status}: {body}")]
    Request { status: u16, body: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Could not confirm order {order_id}")]
    OrderNotConfirmed { order_id: OrderId },

    #[error("Balance still {balance:.2} after {attempts} order attempts without progress; giving up this cycle")]
    WorkflowStalled { attempts: u32, balance: Decimal },

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Invalid header value: {0}")]
    InvalidHeader(String),

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    /// Build a request failure from a non-2xx response.
    pub fn request(status: StatusCode, body: impl Into<String>) -> Self {
        ClientError::Request {
            status: status.as_u16(),
            body: body.into(),
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Request { status, .. } => Some(*status),
            ClientError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether the error is about missing or rejected authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ClientError::Authentication(_)
                | ClientError::Disconnected
                | ClientError::Request { status: 401, .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    // -- Credentials --

    #[test]
    fn test_credentials_reveal_roundtrip() {
        let creds = Credentials::new("5551234", "s3cr3t-pässword");
        assert_eq!(creds.username(), "5551234");
        assert_eq!(
            creds.reveal_password().unwrap().expose_secret(),
            "s3cr3t-pässword"
        );
    }

    #[test]
    fn test_credentials_stored_obscured() {
        let creds = Credentials::new("5551234", "hunter2");
        assert_ne!(creds.encoded_password.expose_secret(), "hunter2");
        assert_eq!(creds.encoded_password.expose_secret(), "aHVudGVyMg==");
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("5551234", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("5551234"));
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("aHVudGVyMg=="));
    }

    // -- Token --

    #[test]
    fn test_token_authorization_value() {
        let token = Token::bearer("abc123");
        assert_eq!(token.authorization_value().as_deref(), Some("Bearer abc123"));
    }

    #[test]
    fn test_empty_token_has_no_authorization() {
        assert_eq!(Token::default().authorization_value(), None);
    }

    // -- Balance --

    #[test]
    fn test_balance_from_string() {
        let snap = BalanceSnapshot::from_value(json!({"userinfo": {"balance": "12.50"}})).unwrap();
        assert_eq!(snap.amount(), dec!(12.50));
        assert_eq!(snap.to_string(), "12.50");
    }

    #[test]
    fn test_balance_from_number() {
        let snap = BalanceSnapshot::from_value(json!({"userinfo": {"balance": 3.0}})).unwrap();
        assert_eq!(snap.amount(), dec!(3.0));
    }

    #[test]
    fn test_balance_missing_reads_zero() {
        let snap = BalanceSnapshot::from_value(json!({"success": true})).unwrap();
        assert_eq!(snap.amount(), Decimal::ZERO);
    }

    #[test]
    fn test_balance_garbage_is_error() {
        let err = BalanceSnapshot::from_value(json!({"userinfo": {"balance": "lots"}})).unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedResponse(_)));
    }

    // -- Orders --

    #[test]
    fn test_order_creation_actionable() {
        let order: OrderCreation =
            serde_json::from_value(json!({"success": true, "data": {"orderId": "A-17"}})).unwrap();
        assert_eq!(order.actionable_id(), Some(OrderId::new("A-17")));
    }

    #[test]
    fn test_order_creation_numeric_id() {
        let order: OrderCreation =
            serde_json::from_value(json!({"success": true, "data": {"orderId": 991}})).unwrap();
        assert_eq!(order.actionable_id(), Some(OrderId::new("991")));
    }

    #[test]
    fn test_order_creation_not_actionable() {
        let failed: OrderCreation =
            serde_json::from_value(json!({"success": false, "data": {"orderId": "A-17"}})).unwrap();
        let empty: OrderCreation =
            serde_json::from_value(json!({"success": true, "data": {"orderId": ""}})).unwrap();
        let bare: OrderCreation = serde_json::from_value(json!({"success": true})).unwrap();
        assert_eq!(failed.actionable_id(), None);
        assert_eq!(empty.actionable_id(), None);
        assert_eq!(bare.actionable_id(), None);
    }

    // -- Errors --

    #[test]
    fn test_request_error_carries_status_and_body() {
        let err = ClientError::request(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.to_string(), "Request failed with status 500: boom");
        assert!(!err.is_auth_error());
    }

    #[test]
    fn test_auth_errors() {
        assert!(ClientError::Authentication("nope".into()).is_auth_error());
        assert!(ClientError::request(StatusCode::UNAUTHORIZED, "").is_auth_error());
        assert!(!ClientError::NoSession.is_auth_error());
    }

    #[test]
    fn test_order_not_confirmed_names_order() {
        let err = ClientError::OrderNotConfirmed {
            order_id: OrderId::new("X9"),
        };
        assert_eq!(err.to_string(), "Could not confirm order X9");
    }
}
