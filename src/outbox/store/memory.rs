use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{lease_until, OutboxStore, StatusCounts, StoreError, StoreResult};
use crate::outbox::message::OutboxMessage;
use crate::outbox::status::OutboxStatus;

#[derive(Debug, Clone)]
struct Claim {
    claimant: String,
    until: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    /// Insertion order, used by `messages()`
    seq: u64,
    message: OutboxMessage,
    claim: Option<Claim>,
}

#[derive(Default)]
struct Inner {
    rows: HashMap<Uuid, StoredMessage>,
    next_seq: u64,
}

/// Process-local outbox store. All operations take one lock, so a claim is
/// exclusive across every task sharing the store.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    inner: Mutex<Inner>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lease holder of `id`, if its lease is still running at `now`
    pub async fn claimant_of(&self, id: Uuid, now: DateTime<Utc>) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .rows
            .get(&id)
            .and_then(|row| row.claim.as_ref())
            .filter(|claim| claim.until > now)
            .map(|claim| claim.claimant.clone())
    }

    /// Every stored message in insertion order
    pub async fn messages(&self) -> Vec<OutboxMessage> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<&StoredMessage> = inner.rows.values().collect();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| row.message.clone()).collect()
    }

    async fn store(&self, message: &OutboxMessage, claim: Option<Claim>) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.rows.contains_key(&message.id()) {
            return Err(StoreError::Duplicate(message.id()));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.rows.insert(
            message.id(),
            StoredMessage {
                seq,
                message: message.clone(),
                claim,
            },
        );
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, message: &OutboxMessage) -> StoreResult<()> {
        self.store(message, None).await
    }

    async fn insert_claimed(
        &self,
        message: &OutboxMessage,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<()> {
        let claim = Claim {
            claimant: claimant.to_string(),
            until: lease_until(message.created_at(), lease),
        };
        self.store(message, Some(claim)).await
    }

    async fn update(&self, message: &OutboxMessage, expected_attempts: u32) -> StoreResult<()> {
        let mut inner = self.inner.lock().await;
        let row = inner
            .rows
            .get_mut(&message.id())
            .ok_or(StoreError::NotFound(message.id()))?;

        if row.message.status().is_terminal() || row.message.attempts() != expected_attempts {
            return Err(StoreError::StaleUpdate(message.id()));
        }

        row.message = message.clone();
        row.claim = None;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<OutboxMessage> {
        let inner = self.inner.lock().await;
        inner
            .rows
            .get(&id)
            .map(|row| row.message.clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn claim_due_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<Vec<OutboxMessage>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut inner = self.inner.lock().await;

        let mut due: Vec<(DateTime<Utc>, Uuid)> = inner
            .rows
            .values()
            .filter(|row| row.message.is_due(now))
            .filter(|row| row.claim.as_ref().map_or(true, |claim| claim.until <= now))
            .map(|row| (row.message.created_at(), row.message.id()))
            .collect();
        due.sort();
        due.truncate(limit);

        let until = lease_until(now, lease);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(row) = inner.rows.get_mut(&id) {
                row.claim = Some(Claim {
                    claimant: claimant.to_string(),
                    until,
                });
                claimed.push(row.message.clone());
            }
        }

        Ok(claimed)
    }

    async fn counts_by_status(&self) -> StoreResult<StatusCounts> {
        let inner = self.inner.lock().await;
        let mut counts = StatusCounts::default();
        for row in inner.rows.values() {
            match row.message.status() {
                OutboxStatus::Pending => counts.pending += 1,
                OutboxStatus::Sent => counts.sent += 1,
                OutboxStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}
