//! cotps-bot entry point.
//!
//! Loads configuration, initialises structured logging, resolves the
//! account credentials and runs the polling loop until Ctrl+C.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cotps_bot::config::AppConfig;
use cotps_bot::engine::{PollSummary, Poller, PollerSettings};
use cotps_bot::platforms::cotps::CotpsClient;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path =
        std::env::var("COTPS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut cfg = AppConfig::load_or_default(&config_path)?;
    cfg.apply_env_overrides()?;

    init_logging(&cfg);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api_version = %cfg.service.version,
        base_url = %cfg.service.base_url,
        interval_secs = cfg.poller.interval_secs,
        threshold = %cfg.workflow.balance_threshold,
        "cotps-bot starting up"
    );

    let credentials = cfg
        .credentials
        .resolve()
        .context("COTPS credentials are not configured")?;
    let client = CotpsClient::from_config(&cfg, credentials)
        .context("Failed to build COTPS client")?;

    // -- Shutdown wiring ---------------------------------------------------

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, finishing current cycle"),
            Err(e) => warn!(error = %e, "Could not listen for Ctrl+C"),
        }
        on_signal.cancel();
    });

    // -- Main loop ---------------------------------------------------------

    info!("Entering main loop. Press Ctrl+C to stop.");
    let mut poller = Poller::new(client, PollerSettings::from(&cfg.poller));
    let summary = poller.run(cancel).await;

    log_summary(&summary);
    Ok(())
}

fn log_summary(summary: &PollSummary) {
    info!(
        cycles = summary.cycles_run,
        failed = summary.cycles_failed,
        orders = summary.orders_confirmed,
        balance = ?summary.last_balance,
        "cotps-bot shut down cleanly."
    );
}

/// Initialise the `tracing` subscriber.
fn init_logging(cfg: &AppConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_level = if cfg.service.debug { "cotps_bot=debug" } else { "cotps_bot=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let json_logging = std::env::var("COTPS_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
