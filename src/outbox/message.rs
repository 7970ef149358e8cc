use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::OutboxStatus;

// ============================================================================
// Outbox Message - The only persisted entity
// ============================================================================
//
// Content (recipient, subject, body) is fixed at creation. Delivery state is
// only changed through the transition methods below, which the dispatch
// engine drives; every transition refreshes `updated_at`.
//
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub(crate) id: Uuid,
    pub(crate) recipient: String,
    pub(crate) subject: String,
    pub(crate) body: String,
    pub(crate) status: OutboxStatus,
    pub(crate) attempts: u32,
    pub(crate) next_attempt_at: DateTime<Utc>,
    pub(crate) last_error: Option<String>,
    pub(crate) provider_message_id: Option<String>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) updated_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// A fresh Pending record, due immediately.
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            provider_message_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn status(&self) -> OutboxStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next_attempt_at(&self) -> DateTime<Utc> {
        self.next_attempt_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn provider_message_id(&self) -> Option<&str> {
        self.provider_message_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Pending and not scheduled past `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending && self.next_attempt_at <= now
    }

    // ------------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------------

    /// Count one completed provider call.
    pub(crate) fn record_attempt(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.updated_at = now;
    }

    pub(crate) fn mark_sent(&mut self, provider_message_id: Option<String>, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.provider_message_id = provider_message_id;
        self.last_error = None;
        self.updated_at = now;
    }

    /// Stay Pending, not to be tried again before `next_attempt_at`.
    pub(crate) fn reschedule(
        &mut self,
        next_attempt_at: DateTime<Utc>,
        error: String,
        now: DateTime<Utc>,
    ) {
        self.status = OutboxStatus::Pending;
        self.next_attempt_at = next_attempt_at;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    pub(crate) fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = OutboxStatus::Failed;
        self.last_error = Some(error);
        self.updated_at = now;
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
