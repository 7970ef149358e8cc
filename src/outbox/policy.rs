use chrono::{DateTime, Duration, Utc};

// ============================================================================
// Delivery Policy - Attempt budget and backoff schedule
// ============================================================================
//
// Retry backoff grows linearly with the attempt count:
//   attempt 1 -> 1 x retry_delay, attempt 2 -> 2 x retry_delay, ...
// Quota backoff is flat regardless of attempts.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Attempts allowed before a message is failed without calling the provider
    pub max_attempts: u32,
    /// Base delay for transient failures
    pub retry_delay_seconds: i64,
    /// Flat delay after a quota / rate-limit response
    pub quota_delay_minutes: i64,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_seconds: 60,
            quota_delay_minutes: 60,
        }
    }
}

impl DeliveryPolicy {
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    pub fn retry_backoff(&self, attempts: u32) -> Duration {
        Duration::try_seconds(self.retry_delay_seconds.saturating_mul(i64::from(attempts)))
            .unwrap_or(Duration::MAX)
    }

    pub fn quota_backoff(&self) -> Duration {
        Duration::try_minutes(self.quota_delay_minutes).unwrap_or(Duration::MAX)
    }

    /// When a message retried after `attempts` attempts becomes due again
    pub fn next_retry_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        schedule(now, self.retry_backoff(attempts))
    }

    /// When a quota-limited message becomes due again
    pub fn next_quota_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        schedule(now, self.quota_backoff())
    }
}

fn schedule(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
