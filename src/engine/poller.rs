//! Poller: runs the order workflow on a fixed schedule.
//!
//! One bootstrap cycle runs immediately, then one per interval tick
//! (start-to-start, missed ticks delayed). Every cycle opens a session,
//! drains the balance into orders and closes the session again. A failing
//! cycle is logged and counted; the loop carries on with the next tick.
//!
//! Cancellation is only observed between cycles, so a cycle that has
//! started always reaches its logout.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::PollerConfig;
use crate::platforms::cotps::CotpsClient;
use crate::session::with_session;
use crate::types::TransactionReport;

/// `tokio::time::interval` panics on a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct PollerSettings {
    pub interval: Duration,
    /// Stop after this many cycles (bootstrap included).
    pub max_cycles: Option<u64>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self::from(&PollerConfig::default())
    }
}

impl From<&PollerConfig> for PollerSettings {
    fn from(cfg: &PollerConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs),
            max_cycles: cfg.max_cycles,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Outcome of one successful cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle_number: u64,
    pub start_balance: Decimal,
    pub final_balance: Decimal,
    pub orders_confirmed: usize,
    pub order_attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl CycleReport {
    fn from_transactions(cycle_number: u64, report: &TransactionReport) -> Self {
        Self {
            cycle_number,
            start_balance: report.start_balance.amount(),
            final_balance: report.final_balance.amount(),
            orders_confirmed: report.confirmed_orders.len(),
            order_attempts: report.attempts,
            timestamp: Utc::now(),
        }
    }
}

/// Totals over a whole poller run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSummary {
    pub cycles_run: u64,
    pub cycles_failed: u64,
    pub orders_confirmed: usize,
    /// Balance at the end of the most recent successful cycle.
    pub last_balance: Option<Decimal>,
    pub last_error: Option<String>,
}

impl PollSummary {
    fn record_success(&mut self, report: &CycleReport) {
        self.cycles_run += 1;
        self.orders_confirmed += report.orders_confirmed;
        self.last_balance = Some(report.final_balance);
    }

    /// A failed cycle may still have confirmed `orders_confirmed` orders
    /// before it stopped.
    fn record_failure(&mut self, err: &anyhow::Error, orders_confirmed: usize) {
        self.cycles_run += 1;
        self.cycles_failed += 1;
        self.orders_confirmed += orders_confirmed;
        self.last_error = Some(format!("{err:#}"));
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub struct Poller {
    client: CotpsClient,
    settings: PollerSettings,
    summary: PollSummary,
}

impl Poller {
    pub fn new(client: CotpsClient, settings: PollerSettings) -> Self {
        Self {
            client,
            settings,
            summary: PollSummary::default(),
        }
    }

    pub fn client(&self) -> &CotpsClient {
        &self.client
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    pub fn summary(&self) -> &PollSummary {
        &self.summary
    }

    /// Run one login → transactions → logout cycle and record its outcome.
    pub async fn run_once(&mut self) -> Result<CycleReport> {
        let outcome = self.execute_cycle().await;
        let confirmed = self.client.take_run_orders();
        match &outcome {
            Ok(report) => {
                log_cycle_report(report);
                self.summary.record_success(report);
            }
            Err(e) => {
                error!(
                    error = %format!("{e:#}"),
                    orders_confirmed = confirmed.len(),
                    "Cycle failed, continuing to next"
                );
                self.summary.record_failure(e, confirmed.len());
            }
        }
        outcome
    }

    async fn execute_cycle(&mut self) -> Result<CycleReport> {
        let cycle_number = self.summary.cycles_run + 1;
        info!(cycle = cycle_number, "Starting cycle");

        let transactions = with_session(&mut self.client, |c| Box::pin(c.make_transactions()))
            .await
            .with_context(|| format!("cycle {cycle_number} failed"))?;

        if cycle_number == 1 {
            info!(balance = %transactions.start_balance, "Starting balance");
        }

        Ok(CycleReport::from_transactions(cycle_number, &transactions))
    }

    /// Poll until cancelled or until `max_cycles` cycles have run.
    pub async fn run(&mut self, cancel: CancellationToken) -> PollSummary {
        if cancel.is_cancelled() {
            info!("Cancelled before the first cycle");
            return self.summary.clone();
        }
        if self.limit_reached() {
            info!(max_cycles = ?self.settings.max_cycles, "Cycle limit already reached");
            return self.summary.clone();
        }

        let period = self.settings.interval.max(MIN_INTERVAL);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_secs = period.as_secs_f64(),
            max_cycles = ?self.settings.max_cycles,
            "Entering poll loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received.");
                    break;
                }
                _ = interval.tick() => {}
            }

            // Failures are logged and counted by run_once.
            let _ = self.run_once().await;

            if self.limit_reached() {
                info!(cycles = self.summary.cycles_run, "Cycle limit reached");
                break;
            }
        }

        self.summary.clone()
    }

    fn limit_reached(&self) -> bool {
        self.settings
            .max_cycles
            .is_some_and(|max| self.summary.cycles_run >= max)
    }
}

fn log_cycle_report(report: &CycleReport) {
    info!(
        cycle = report.cycle_number,
        start_balance = %format!("{:.2}", report.start_balance),
        balance = %format!("{:.2}", report.final_balance),
        orders = report.orders_confirmed,
        attempts = report.order_attempts,
        "Cycle complete"
    );
}
