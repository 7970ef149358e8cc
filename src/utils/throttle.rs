use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use crate::utils::Clock;

// ============================================================================
// Login Throttle - Fixed-window attempt limiter keyed by string
// ============================================================================
//
// Keeps one window per key (usually "login:<email>" or a client address).
// The first attempt opens the window; once `max_attempts` have been counted
// inside it, further attempts are rejected until the window lapses.
//
// Windows are never removed on the hot path, so a periodic eviction sweep
// drops keys whose window has expired.
//
// ============================================================================

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Attempts allowed inside one window
    pub max_attempts: u32,
    /// Length of a window, measured from its first attempt
    pub window: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptWindow {
    count: u32,
    opened_at: DateTime<Utc>,
}

pub struct LoginThrottle {
    windows: Mutex<HashMap<String, AttemptWindow>>,
    config: ThrottleConfig,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<Metrics>>,
}

impl LoginThrottle {
    pub fn new(config: ThrottleConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            config,
            clock,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Count an attempt for `key` and report whether it may proceed.
    pub async fn is_allowed(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;

        let live = windows
            .get(key)
            .is_some_and(|window| !self.is_expired(window, now));
        if !live {
            windows.insert(
                key.to_string(),
                AttemptWindow {
                    count: 1,
                    opened_at: now,
                },
            );
            return true;
        }

        let Some(window) = windows.get_mut(key) else {
            return true;
        };

        if window.count >= self.config.max_attempts {
            tracing::warn!(
                key = %key,
                attempts = window.count,
                "Login attempt rejected by throttle"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_throttle_rejection();
            }
            return false;
        }

        window.count += 1;
        true
    }

    /// Forget everything recorded for `key` (e.g. after a successful login).
    pub async fn reset(&self, key: &str) {
        self.windows.lock().await.remove(key);
    }

    /// Drop all windows that have lapsed. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, window| !self.is_expired(window, now));
        before - windows.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }

    /// Run `evict_expired` every `interval` until `cancel` fires.
    pub fn spawn_eviction(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Login throttle eviction stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.evict_expired().await;
                        if evicted > 0 {
                            tracing::debug!(evicted = evicted, "Evicted expired throttle windows");
                        }
                    }
                }
            }
        })
    }

    fn is_expired(&self, window: &AttemptWindow, now: DateTime<Utc>) -> bool {
        now - window.opened_at > self.config.window
    }
}
