// Private module declaration
mod server;

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

use crate::outbox::SendStatus;

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for observability
// ============================================================================
//
// Provides metrics for:
// - Enqueue volume
// - Dispatch outcomes (Sent / Quota / Retry / Failed)
// - Provider round-trip latency
// - Attempt exhaustion
// - Retry sweeper runs and claimed batch sizes
// - Login throttle rejections
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

/// Central metrics registry for the entire application
pub struct Metrics {
    registry: Registry,

    // Outbox Metrics
    pub outbox_enqueued: IntCounter,
    pub outbox_dispatch: IntCounterVec,
    pub outbox_attempts_exhausted: IntCounter,

    // Provider Metrics
    pub provider_request_duration: HistogramVec,

    // Sweeper Metrics
    pub sweeper_runs: IntCounter,
    pub sweeper_claimed_messages: Histogram,
    pub sweeper_errors: IntCounter,

    // Throttle Metrics
    pub login_throttle_rejections: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Outbox Metrics
        let outbox_enqueued = IntCounter::new(
            "outbox_enqueued_total",
            "Total messages accepted into the outbox",
        )?;
        registry.register(Box::new(outbox_enqueued.clone()))?;

        let outbox_dispatch = IntCounterVec::new(
            Opts::new("outbox_dispatch_total", "Dispatch attempts by resulting status"),
            &["outcome"],
        )?;
        registry.register(Box::new(outbox_dispatch.clone()))?;

        let outbox_attempts_exhausted = IntCounter::new(
            "outbox_attempts_exhausted_total",
            "Messages failed because their attempt budget was spent",
        )?;
        registry.register(Box::new(outbox_attempts_exhausted.clone()))?;

        // Provider Metrics
        let provider_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "provider_request_duration_seconds",
                "Email provider call duration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(provider_request_duration.clone()))?;

        // Sweeper Metrics
        let sweeper_runs = IntCounter::new("sweeper_runs_total", "Total retry sweeper runs")?;
        registry.register(Box::new(sweeper_runs.clone()))?;

        let sweeper_claimed_messages = Histogram::with_opts(
            HistogramOpts::new(
                "sweeper_claimed_messages",
                "Messages claimed per sweeper run",
            )
            .buckets(vec![0.0, 1.0, 5.0, 10.0, 20.0, 50.0, 100.0]),
        )?;
        registry.register(Box::new(sweeper_claimed_messages.clone()))?;

        let sweeper_errors = IntCounter::new(
            "sweeper_errors_total",
            "Store errors raised while sweeping",
        )?;
        registry.register(Box::new(sweeper_errors.clone()))?;

        // Throttle Metrics
        let login_throttle_rejections = IntCounter::new(
            "login_throttle_rejections_total",
            "Login attempts rejected by the throttle",
        )?;
        registry.register(Box::new(login_throttle_rejections.clone()))?;

        Ok(Self {
            registry,
            outbox_enqueued,
            outbox_dispatch,
            outbox_attempts_exhausted,
            provider_request_duration,
            sweeper_runs,
            sweeper_claimed_messages,
            sweeper_errors,
            login_throttle_rejections,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_enqueued(&self) {
        self.outbox_enqueued.inc();
    }

    /// Helper to record the status a dispatch attempt ended in
    pub fn record_dispatch(&self, status: SendStatus) {
        self.outbox_dispatch
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// Helper to record one provider round-trip
    pub fn record_provider_call(&self, status: SendStatus, duration_secs: f64) {
        self.provider_request_duration
            .with_label_values(&[status.as_str()])
            .observe(duration_secs);
    }

    pub fn record_exhausted(&self) {
        self.outbox_attempts_exhausted.inc();
    }

    /// Helper to record a sweeper run and how much it claimed
    pub fn record_sweep(&self, claimed: usize) {
        self.sweeper_runs.inc();
        self.sweeper_claimed_messages.observe(claimed as f64);
    }

    pub fn record_sweep_error(&self) {
        self.sweeper_errors.inc();
    }

    pub fn record_throttle_rejection(&self) {
        self.login_throttle_rejections.inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}
