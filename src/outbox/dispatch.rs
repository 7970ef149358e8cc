use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use super::message::OutboxMessage;
use super::policy::DeliveryPolicy;
use super::status::{OutboxStatus, SendStatus};
use super::store::{OutboxStore, StoreResult};
use crate::metrics::Metrics;
use crate::provider::{EmailProvider, SendResult};
use crate::utils::Clock;

pub const ATTEMPTS_EXHAUSTED: &str = "maximum attempts reached";

// ============================================================================
// Dispatch Engine - One delivery attempt for one message
// ============================================================================
//
// Flow:
// 1. Terminal message      -> return its status, nothing written
// 2. Attempt budget spent  -> Failed, no provider call
// 3. Call provider once, count the attempt (including on success)
// 4. Fold the outcome into the record and persist it
//
// The gateway (first attempt) and the sweeper (every later attempt) both go
// through here, so all state transitions share one code path.
//
// ============================================================================

pub struct DispatchEngine {
    store: Arc<dyn OutboxStore>,
    provider: Arc<dyn EmailProvider>,
    clock: Arc<dyn Clock>,
    policy: DeliveryPolicy,
    metrics: Arc<Metrics>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        provider: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        policy: DeliveryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &DeliveryPolicy {
        &self.policy
    }

    /// Attempt delivery of `message` and persist the resulting state.
    pub async fn attempt_send(&self, mut message: OutboxMessage) -> StoreResult<SendStatus> {
        if message.status().is_terminal() {
            tracing::debug!(
                message_id = %message.id(),
                status = %message.status(),
                "Message already terminal, skipping dispatch"
            );
            return Ok(terminal_send_status(&message));
        }

        // Writes only land if nobody else advanced the record since it was read
        let read_attempts = message.attempts();

        if self.policy.is_exhausted(read_attempts) {
            let now = self.clock.now();
            message.mark_failed(ATTEMPTS_EXHAUSTED.to_string(), now);
            self.store.update(&message, read_attempts).await?;

            tracing::error!(
                message_id = %message.id(),
                attempts = message.attempts(),
                max_attempts = self.policy.max_attempts,
                "❌ Outbox message failed: maximum attempts reached"
            );
            self.metrics.record_exhausted();
            self.metrics.record_dispatch(SendStatus::Failed);
            return Ok(SendStatus::Failed);
        }

        let started = Instant::now();
        let result = self.provider.send(&message).await;
        self.metrics
            .record_provider_call(result.status, started.elapsed().as_secs_f64());

        let now = self.clock.now();
        let status = apply_outcome(&mut message, result, &self.policy, now);
        self.store.update(&message, read_attempts).await?;

        log_outcome(&message, status);
        self.metrics.record_dispatch(status);
        Ok(status)
    }
}

/// Fold one provider result into the message. Counts the attempt.
pub(crate) fn apply_outcome(
    message: &mut OutboxMessage,
    result: SendResult,
    policy: &DeliveryPolicy,
    now: DateTime<Utc>,
) -> SendStatus {
    message.record_attempt(now);

    let error = result
        .error
        .unwrap_or_else(|| format!("provider returned {}", result.status));

    match result.status {
        SendStatus::Sent => message.mark_sent(result.provider_message_id, now),
        SendStatus::Quota => message.reschedule(policy.next_quota_at(now), error, now),
        SendStatus::Retry => {
            let next = policy.next_retry_at(now, message.attempts());
            message.reschedule(next, error, now)
        }
        SendStatus::Failed => message.mark_failed(error, now),
    }

    result.status
}

fn terminal_send_status(message: &OutboxMessage) -> SendStatus {
    match message.status() {
        OutboxStatus::Sent => SendStatus::Sent,
        _ => SendStatus::Failed,
    }
}

fn log_outcome(message: &OutboxMessage, status: SendStatus) {
    match status {
        SendStatus::Sent => tracing::info!(
            message_id = %message.id(),
            attempts = message.attempts(),
            provider_message_id = message.provider_message_id().unwrap_or("-"),
            "✅ Email sent"
        ),
        SendStatus::Quota | SendStatus::Retry => tracing::warn!(
            message_id = %message.id(),
            attempts = message.attempts(),
            outcome = %status,
            next_attempt_at = %message.next_attempt_at(),
            error = message.last_error().unwrap_or_default(),
            "⚠️ Email not sent, rescheduled"
        ),
        SendStatus::Failed => tracing::error!(
            message_id = %message.id(),
            attempts = message.attempts(),
            error = message.last_error().unwrap_or_default(),
            "❌ Email permanently failed"
        ),
    }
}
