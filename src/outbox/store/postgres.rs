use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use uuid::Uuid;

use super::{lease_until, OutboxStore, StatusCounts, StoreError, StoreResult};
use crate::outbox::message::OutboxMessage;
use crate::outbox::status::OutboxStatus;

// ============================================================================
// PostgreSQL Outbox Store
// ============================================================================
//
// Table: email_outbox
//
// Multi-worker claims use a single UPDATE over a FOR UPDATE SKIP LOCKED
// sub-select, so concurrent sweepers never receive the same row while its
// lease (claimed_until) is in the future. Updates clear the lease columns
// and only match the attempts value the writer read.
//
// ============================================================================

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS email_outbox (
    id                  UUID PRIMARY KEY,
    recipient           TEXT NOT NULL,
    subject             TEXT NOT NULL,
    body                TEXT NOT NULL,
    status              TEXT NOT NULL,
    attempts            INTEGER NOT NULL DEFAULT 0,
    next_attempt_at     TIMESTAMPTZ NOT NULL,
    last_error          TEXT,
    provider_message_id TEXT,
    created_at          TIMESTAMPTZ NOT NULL,
    updated_at          TIMESTAMPTZ NOT NULL,
    claimed_by          TEXT,
    claimed_until       TIMESTAMPTZ
)
"#;

const CREATE_DUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS email_outbox_due_idx
    ON email_outbox (status, next_attempt_at, created_at)
"#;

const COLUMNS: &str = "id, recipient, subject, body, status, attempts, next_attempt_at, \
                       last_error, provider_message_id, created_at, updated_at";

/// Row shape as stored; converted into the domain type after validation
#[derive(Debug, FromRow)]
struct OutboxRow {
    id: Uuid,
    recipient: String,
    subject: String,
    body: String,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    provider_message_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OutboxRow> for OutboxMessage {
    type Error = StoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        let status: OutboxStatus = row.status.parse().map_err(|e| StoreError::CorruptRow {
            id: row.id,
            reason: format!("{}", e),
        })?;
        let attempts = u32::try_from(row.attempts).map_err(|_| StoreError::CorruptRow {
            id: row.id,
            reason: format!("negative attempts: {}", row.attempts),
        })?;

        Ok(OutboxMessage {
            id: row.id,
            recipient: row.recipient,
            subject: row.subject,
            body: row.body,
            status,
            attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            provider_message_id: row.provider_message_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the outbox table and its due-scan index if missing.
    pub async fn ensure_schema(&self) -> StoreResult<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_DUE_INDEX).execute(&self.pool).await?;
        tracing::debug!("email_outbox schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_row(
        &self,
        message: &OutboxMessage,
        claim: Option<(&str, DateTime<Utc>)>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO email_outbox
                (id, recipient, subject, body, status, attempts, next_attempt_at,
                 last_error, provider_message_id, created_at, updated_at,
                 claimed_by, claimed_until)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(message.id())
        .bind(message.recipient())
        .bind(message.subject())
        .bind(message.body())
        .bind(message.status().as_str())
        .bind(attempts_column(message.attempts()))
        .bind(message.next_attempt_at())
        .bind(message.last_error())
        .bind(message.provider_message_id())
        .bind(message.created_at())
        .bind(message.updated_at())
        .bind(claim.map(|(claimant, _)| claimant))
        .bind(claim.map(|(_, until)| until))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Duplicate(message.id())),
            Err(e) => Err(e.into()),
        }
    }
}

fn attempts_column(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

/// Claim order: oldest first, id breaks created_at ties
fn sort_oldest_first(messages: &mut [OutboxMessage]) {
    messages.sort_by_key(|m| (m.created_at(), m.id()));
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn insert(&self, message: &OutboxMessage) -> StoreResult<()> {
        self.insert_row(message, None).await
    }

    async fn insert_claimed(
        &self,
        message: &OutboxMessage,
        claimant: &str,
        lease: Duration,
    ) -> StoreResult<()> {
        let until = lease_until(message.created_at(), lease);
        self.insert_row(message, Some((claimant, until))).await
    }

    async fn update(&self, message: &OutboxMessage, expected_attempts: u32) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE email_outbox
            SET status = $2,
                attempts = $3,
                next_attempt_at = $4,
                last_error = $5,
                provider_message_id = $6,
                updated_at = $7,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1 AND status = 'PENDING' AND attempts = $8
            "#,
        )
        .bind(message.id())
        .bind(message.status().as_str())
        .bind(attempts_column(message.attempts()))
        .bind(message.next_attempt_at())
        .bind(message.last_error())
        .bind(message.provider_message_id())
        .bind(message.updated_at())
        .bind(attempts_column(expected_attempts))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        // Nothing matched: the row is gone, terminal, or written by someone else
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM email_outbox WHERE id = $1")
            .bind(message.id())
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            Some(_) => Err(StoreError::StaleUpdate(message.id())),
            None => Err(StoreError::NotFound(message.id())),
        }
    }

    async fn get(&self, id: Uuid) -> StoreResult<OutboxMessage> {
        let query = format!("SELECT {} FROM email_outbox WHERE id = $1", COLUMNS);
        let row: Option<OutboxRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::NotFound(id))?.try_into()
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

        let until = lease_until(now, lease);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let query = format!(
            r#"
            UPDATE email_outbox
            SET claimed_by = $3, claimed_until = $4
            WHERE id IN (
                SELECT id FROM email_outbox
                WHERE status = 'PENDING'
                  AND next_attempt_at <= $1
                  AND (claimed_until IS NULL OR claimed_until <= $1)
                ORDER BY created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            COLUMNS
        );

        let rows: Vec<OutboxRow> = sqlx::query_as(&query)
            .bind(now)
            .bind(limit)
            .bind(claimant)
            .bind(until)
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the sub-select order
        let mut messages = rows
            .into_iter()
            .map(OutboxMessage::try_from)
            .collect::<StoreResult<Vec<_>>>()?;
        sort_oldest_first(&mut messages);

        Ok(messages)
    }

    async fn counts_by_status(&self) -> StoreResult<StatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM email_outbox GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => counts.pending = count,
                Ok(OutboxStatus::Sent) => counts.sent = count,
                Ok(OutboxStatus::Failed) => counts.failed = count,
                Err(e) => tracing::warn!(error = %e, "Ignoring unknown status in counts"),
            }
        }
        Ok(counts)
    }
}

// ============================================================================
// Tests
// ============================================================================
//
// These need a reachable PostgreSQL instance:
//   DATABASE_URL=postgres://... cargo test -- --ignored
//
// ============================================================================
