//! Session header construction.
//!
//! Headers are always rebuilt from the current token and cookie rather than
//! patched in place, so `authorization` is present exactly when a token is
//! held and `Cookie` exactly when a cookie is held.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, COOKIE, SET_COOKIE};

use crate::types::{ClientError, ClientResult, Token};

pub const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Build the session headers for the given auth state.
pub fn build_session_headers(token: Option<&Token>, cookie: Option<&str>) -> ClientResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    if let Some(value) = token.and_then(Token::authorization_value) {
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| ClientError::InvalidHeader("access token".into()))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));

    if let Some(cookie) = cookie.filter(|c| !c.is_empty()) {
        let mut value = HeaderValue::from_str(cookie)
            .map_err(|_| ClientError::InvalidHeader("session cookie".into()))?;
        value.set_sensitive(true);
        headers.insert(COOKIE, value);
    }

    Ok(headers)
}

/// Collapse every `Set-Cookie` header into a single `Cookie` value,
/// keeping only the `name=value` part of each.
pub fn cookie_from_response(headers: &HeaderMap) -> Option<String> {
    let pairs: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .map(str::trim)
        .filter(|pair| pair.contains('='))
        .collect();

    (!pairs.is_empty()).then(|| pairs.join("; "))
}

/// Extract the access token from an `authorization` response header,
/// tolerating a `Bearer ` prefix.
pub fn token_from_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match raw.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => raw,
    };
    (!token.is_empty()).then(|| token.to_string())
}
