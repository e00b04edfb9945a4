//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! field has a default matching the live COTPS deployment, so a partial (or
//! missing) file is fine. Secrets are referenced by env-var name in the
//! config and resolved at runtime via `std::env::var`.

use anyhow::{ensure, Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::types::Credentials;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub endpoints: EndpointsConfig,
    pub credentials: CredentialsConfig,
    pub workflow: WorkflowConfig,
    pub poller: PollerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    /// Value of the `type` field in the login form.
    pub login_type: String,
    pub version: String,
    /// Raises the default log level to debug.
    pub debug: bool,
    pub request_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.cotps.com:8443".to_string(),
            login_type: "mobile".to_string(),
            version: "0.1-alpha".to_string(),
            debug: true,
            request_timeout_secs: 30,
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn user_agent(&self) -> String {
        format!("cotps-bot/{} ({})", env!("CARGO_PKG_VERSION"), self.version)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointsConfig {
    pub login: String,
    pub balance: String,
    pub order_create: String,
    pub order_submit: String,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            login: "/api/mine/sso/user_login_check".to_string(),
            balance: "/api/mine/user/getDealInfo".to_string(),
            order_create: "/api/mine/user/createOrder".to_string(),
            order_submit: "/api/mine/user/submitOrder".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username_env: String,
    pub password_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            username_env: "COTPS_USERNAME".to_string(),
            password_env: "COTPS_PASSWORD".to_string(),
        }
    }
}

impl CredentialsConfig {
    /// Read the username and password from the configured env vars.
    pub fn resolve(&self) -> Result<Credentials> {
        let username = AppConfig::resolve_env(&self.username_env)?;
        let password = AppConfig::resolve_env(&self.password_env)?;
        Ok(Credentials::new(username, &password))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Orders are placed while the balance is at or above this amount.
    pub balance_threshold: Decimal,
    /// Consecutive order iterations without a balance drop before a run
    /// gives up.
    pub max_stalled_attempts: u32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            balance_threshold: dec!(5.0),
            max_stalled_attempts: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
    /// Stop after this many cycles (bootstrap included). Unbounded if unset.
    pub max_cycles: Option<u64>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_cycles: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            info!(path, "No config file found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make every request or run fail outright.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.service.request_timeout_secs > 0,
            "service.request_timeout_secs must be greater than 0"
        );
        ensure!(
            self.workflow.max_stalled_attempts > 0,
            "workflow.max_stalled_attempts must be greater than 0"
        );
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// Apply `COTPS_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in
    /// production, a map in tests).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("COTPS_BASE_URL") {
            self.service.base_url = url;
        }
        if let Some(login_type) = lookup("COTPS_LOGIN_TYPE") {
            self.service.login_type = login_type;
        }
        if let Some(debug) = lookup("COTPS_DEBUG") {
            self.service.debug = parse_flag(&debug)
                .with_context(|| format!("COTPS_DEBUG is not a boolean: {debug}"))?;
        }
        if let Some(secs) = lookup("COTPS_POLL_INTERVAL_SECS") {
            self.poller.interval_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("COTPS_POLL_INTERVAL_SECS is not a number: {secs}"))?;
        }
        self.validate()
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
