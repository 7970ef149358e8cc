mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::message::OutboxMessage;

pub use memory::InMemoryOutboxStore;
pub use postgres::PgOutboxStore;

// ============================================================================
// Outbox Store - Durable persistence for outbox messages
// ============================================================================
//
// Two implementations:
// - PgOutboxStore: PostgreSQL, row-level locking for multi-worker claims
// - InMemoryOutboxStore: single process, used for local runs and tests
//
// Claim semantics:
// `claim_due_batch` hands out Pending messages whose next_attempt_at has
// passed, oldest first. Every returned message is leased to the claimant
// until `now + lease`; no other claimant receives it while the lease holds.
// A successful `update` releases the lease. `insert_claimed` stores a new
// message already leased, so the inline first attempt owns it from birth.
//
// Update semantics:
// `update` only applies when the stored record is still Pending and its
// attempts equal `expected_attempts` (the value the caller read). Any other
// writer that got there first turns this write into `StaleUpdate`.
//
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("outbox message {0} not found")]
    NotFound(Uuid),

    #[error("outbox message {0} was changed by another writer")]
    StaleUpdate(Uuid),

    #[error("outbox message {0} already exists")]
    Duplicate(Uuid),

    #[error("corrupt outbox row {id}: {reason}")]
    CorruptRow { id: Uuid, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// End of a lease starting at `now`
pub(crate) fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now.checked_add_signed(lease)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Number of records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new message.
    async fn insert(&self, message: &OutboxMessage) -> StoreResult<()>;

    /// Persist a new message leased to `claimant` until `created_at + lease`.
    async fn insert_claimed(
        &self,
        message: &OutboxMessage,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<()>;

    /// Overwrite the delivery state of an existing Pending message.
    ///
    /// Fails with `StaleUpdate` if the stored record is already Sent or Failed,
    /// or if its attempt count no longer equals `expected_attempts`.
    async fn update(&self, message: &OutboxMessage, expected_attempts: u32) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<OutboxMessage>;

    /// Lease up to `limit` due Pending messages to `claimant`, oldest first.
    async fn claim_due_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<Vec<OutboxMessage>>;

    async fn counts_by_status(&self) -> StoreResult<StatusCounts>;
}
