use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::dispatch::DispatchEngine;
use super::status::SendStatus;
use super::store::{OutboxStore, StoreResult};
use crate::metrics::Metrics;
use crate::utils::Clock;

// ============================================================================
// Retry Sweeper - Periodic driver for due messages
// ============================================================================
//
// Each run:
// 1. Claim up to `batch_size` due Pending messages (oldest first)
// 2. Dispatch them one after another through the engine
// 3. Log and count per-message store errors, keep going
//
// The first tick fires immediately, so messages left Pending by a previous
// process are picked up on startup.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between runs
    pub interval: Duration,
    /// Maximum messages claimed per run
    pub batch_size: usize,
    /// How long a claim stays exclusive if the claimant never releases it
    pub claim_lease: chrono::Duration,
    /// Claimant identity written on claimed messages
    pub worker_id: String,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 20,
            claim_lease: chrono::Duration::seconds(300),
            worker_id: format!("sweeper-{}", uuid::Uuid::new_v4()),
        }
    }
}

/// Tally of one sweeper run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub sent: usize,
    pub rescheduled: usize,
    pub failed: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, status: SendStatus) {
        match status {
            SendStatus::Sent => self.sent += 1,
            SendStatus::Quota | SendStatus::Retry => self.rescheduled += 1,
            SendStatus::Failed => self.failed += 1,
        }
    }
}

pub struct RetrySweeper {
    store: Arc<dyn OutboxStore>,
    engine: Arc<DispatchEngine>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
    metrics: Arc<Metrics>,
}

impl RetrySweeper {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        engine: Arc<DispatchEngine>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            engine,
            clock,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// One sweep. Only a failed claim is returned as an error.
    pub async fn run_once(&self) -> StoreResult<SweepReport> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_due_batch(
                now,
                self.config.batch_size,
                &self.config.worker_id,
                self.config.claim_lease,
            )
            .await?;

        let mut report = SweepReport {
            claimed: batch.len(),
            ..Default::default()
        };
        self.metrics.record_sweep(report.claimed);

        if batch.is_empty() {
            return Ok(report);
        }

        tracing::debug!(
            worker_id = %self.config.worker_id,
            claimed = batch.len(),
            "Sweeping due outbox messages"
        );

        for message in batch {
            let id = message.id();
            match self.engine.attempt_send(message).await {
                Ok(status) => report.record(status),
                Err(e) => {
                    tracing::error!(message_id = %id, error = %e, "Failed to dispatch outbox message");
                    self.metrics.record_sweep_error();
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            claimed = report.claimed,
            sent = report.sent,
            rescheduled = report.rescheduled,
            failed = report.failed,
            errors = report.errors,
            "🔄 Sweep complete"
        );

        Ok(report)
    }

    /// Sweep on every interval tick until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            interval_ms = self.config.interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            "🚀 Retry sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("🛑 Retry sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        tracing::error!(error = %e, "Sweep failed to claim due messages");
                        self.metrics.record_sweep_error();
                    }
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
