//! Dead letter records: messages the pipeline gave up on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::Result;

/// Immutable envelope of a failed message
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: Uuid,

    /// Id of the notification the message pointed at
    pub message_id: Uuid,

    /// Queue the message was consumed from
    pub queue: String,

    /// Routing key the message originally carried
    pub routing_key: String,

    /// Original message bytes
    pub payload: Vec<u8>,

    pub first_error: String,

    pub last_error: String,

    pub attempts: i32,

    /// Failure classification, e.g. `conversion_failed`,
    /// `retries_exhausted`, `permanent`
    pub failure_kind: String,

    pub replayed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        message_id: Uuid,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        error: impl Into<String>,
        attempts: i32,
        failure_kind: impl Into<String>,
    ) -> Self {
        let error = error.into();
        Self {
            id: Uuid::new_v4(),
            message_id,
            queue: queue.into(),
            routing_key: routing_key.into(),
            payload,
            first_error: error.clone(),
            last_error: error,
            attempts,
            failure_kind: failure_kind.into(),
            replayed_at: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Record a dead letter. One row per message id: repeated failures
    /// of the same message update the last error and attempt count but
    /// keep the first error.
    async fn record(&self, letter: &DeadLetter) -> Result<DeadLetter>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>>;

    async fn list_by_queue(&self, queue: &str, limit: i64) -> Result<Vec<DeadLetter>>;

    /// Claim a letter for replay. Returns `false` when it was already
    /// replayed, which makes replay idempotent by message id.
    async fn claim_replay(&self, id: Uuid) -> Result<bool>;

    async fn purge_queue(&self, queue: &str) -> Result<u64>;
}

/// PostgreSQL implementation of `DeadLetterStore`
#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    db: PgPool,
}

impl PostgresDeadLetterStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> Result<DeadLetter> {
        let row = sqlx::query_as::<_, DeadLetter>(
            r#"
            INSERT INTO dead_letters
                (id, message_id, queue, routing_key, payload, first_error,
                 last_error, attempts, failure_kind, replayed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, NOW())
            ON CONFLICT (message_id) DO UPDATE SET
                last_error = EXCLUDED.last_error,
                attempts = EXCLUDED.attempts,
                failure_kind = EXCLUDED.failure_kind,
                replayed_at = NULL
            RETURNING *
            "#,
        )
        .bind(letter.id)
        .bind(letter.message_id)
        .bind(&letter.queue)
        .bind(&letter.routing_key)
        .bind(&letter.payload)
        .bind(&letter.first_error)
        .bind(&letter.last_error)
        .bind(letter.attempts)
        .bind(&letter.failure_kind)
        .fetch_one(&self.db)
        .await?;

        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetter>> {
        let row = sqlx::query_as::<_, DeadLetter>(
            "SELECT * FROM dead_letters WHERE id = $1 OR message_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(row)
    }

    async fn list_by_queue(&self, queue: &str, limit: i64) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT * FROM dead_letters
            WHERE queue = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(queue)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn claim_replay(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE dead_letters
            SET replayed_at = NOW()
            WHERE (id = $1 OR message_id = $1) AND replayed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn purge_queue(&self, queue: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE queue = $1")
            .bind(queue)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_keeps_first_error() {
        let letter = DeadLetter::new(
            Uuid::new_v4(),
            "notifications.email",
            "notification.email.send",
            b"{}".to_vec(),
            "connection refused",
            3,
            "retries_exhausted",
        );

        assert_eq!(letter.first_error, letter.last_error);
        assert!(letter.replayed_at.is_none());
        assert_eq!(letter.failure_kind, "retries_exhausted");
    }
}
