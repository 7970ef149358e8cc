use chrono::Duration;
use std::sync::Arc;
use uuid::Uuid;

use super::dispatch::DispatchEngine;
use super::message::OutboxMessage;
use super::status::SendStatus;
use super::store::{OutboxStore, StoreResult};
use crate::metrics::Metrics;
use crate::utils::Clock;

/// Entry point for collaborators that need to send an email.
///
/// The message is durably stored before any delivery is attempted, so a
/// crash after `insert` leaves it for the sweeper to pick up. For the inline
/// first attempt the record is stored already leased to the gateway, so no
/// sweeper dispatches it while that attempt is in flight.
pub struct EnqueueGateway {
    store: Arc<dyn OutboxStore>,
    engine: Arc<DispatchEngine>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    claimant: String,
    claim_lease: Duration,
}

impl EnqueueGateway {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        engine: Arc<DispatchEngine>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        claimant: impl Into<String>,
        claim_lease: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            clock,
            metrics,
            claimant: claimant.into(),
            claim_lease,
        }
    }

    /// Persist a message and make the first delivery attempt inline.
    ///
    /// Returns the outcome of that first attempt only. `Quota` and `Retry`
    /// mean the message stays queued for the sweeper.
    pub async fn enqueue_and_send(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> StoreResult<SendStatus> {
        let message = OutboxMessage::new(recipient, subject, body, self.clock.now());
        self.store
            .insert_claimed(&message, &self.claimant, self.claim_lease)
            .await?;
        self.enqueued(&message);

        self.engine.attempt_send(message).await
    }

    /// Persist a message without dispatching it; the sweeper delivers it.
    pub async fn enqueue(&self, recipient: &str, subject: &str, body: &str) -> StoreResult<Uuid> {
        let message = OutboxMessage::new(recipient, subject, body, self.clock.now());
        self.store.insert(&message).await?;
        self.enqueued(&message);

        Ok(message.id())
    }

    fn enqueued(&self, message: &OutboxMessage) {
        self.metrics.record_enqueued();
        tracing::debug!(
            message_id = %message.id(),
            recipient = %message.recipient(),
            "Email enqueued"
        );
    }
}
