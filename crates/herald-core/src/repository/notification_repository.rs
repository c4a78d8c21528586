//! Notification repository: durable record of every notification and
//! the only writer of its state machine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::notification::{
    Notification, NotificationFilter, NotificationState, NotificationStats,
};
use crate::repository::Page;
use crate::{Error, Result};

/// Extra data applied alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// Bump the attempt counter as part of the transition
    pub increment_attempts: bool,

    /// Reset the attempt counter to zero (dead-letter replay)
    pub reset_attempts: bool,

    /// Record the error that caused this transition
    pub error: Option<String>,

    /// Record why delivery was suppressed
    pub suppressed_reason: Option<String>,

    /// Correlation id for the audit trail
    pub correlation_id: Option<String>,
}

impl TransitionContext {
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn suppressed(reason: impl Into<String>) -> Self {
        Self {
            suppressed_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            increment_attempts: true,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn replay() -> Self {
        Self {
            reset_attempts: true,
            ..Default::default()
        }
    }
}

/// Result of a conditional state transition. Callers branch on the
/// variant; only infrastructure failures surface as `Err`.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// CAS matched, row updated
    Applied(Notification),

    /// Another writer got there first
    Conflict { actual: NotificationState },

    /// No such notification
    NotFound,
}

impl TransitionOutcome {
    pub fn applied(self) -> Option<Notification> {
        match self {
            TransitionOutcome::Applied(n) => Some(n),
            _ => None,
        }
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a notification. Idempotent by id: a second insert with
    /// the same id leaves the stored row untouched and returns it.
    async fn insert(&self, notification: &Notification) -> Result<Notification>;

    async fn get(&self, id: Uuid) -> Result<Option<Notification>>;

    /// Conditional state transition (compare-and-set on `state`).
    async fn transition(
        &self,
        id: Uuid,
        from: NotificationState,
        to: NotificationState,
        ctx: TransitionContext,
    ) -> Result<TransitionOutcome>;

    async fn list_by_user(
        &self,
        user_id: Uuid,
        filter: &NotificationFilter,
        page: Page,
    ) -> Result<Vec<Notification>>;

    async fn count_by_user(&self, user_id: Uuid, filter: &NotificationFilter) -> Result<i64>;

    /// Idempotent: re-reading an already-read notification keeps the
    /// original `read_at`.
    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> Result<bool>;

    async fn bulk_mark_read(&self, ids: &[Uuid], user_id: Uuid) -> Result<u64>;

    async fn soft_delete(&self, id: Uuid, user_id: Uuid) -> Result<bool>;

    /// Move terminal notifications older than `cutoff` into the
    /// archive table. Returns the number of rows moved.
    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Same archival restricted to one user (admin-triggered).
    async fn archive_user_older_than(&self, user_id: Uuid, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Drop archived rows past the hard retention horizon.
    async fn delete_archived_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// One page of the archive export; restartable via the keyset
    /// cursor `(archived_at, id)` of the last row seen.
    async fn export_archived(
        &self,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ArchivedNotification>>;

    async fn stats(&self, user_id: Option<Uuid>) -> Result<NotificationStats>;
}

/// Row of the archive table
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ArchivedNotification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: crate::notification::NotificationKind,
    pub state: NotificationState,
    pub title: String,
    pub content: String,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub archived_at: DateTime<Utc>,
}

/// PostgreSQL implementation of `NotificationStore`
#[derive(Clone)]
pub struct PostgresNotificationStore {
    db: PgPool,
}

impl PostgresNotificationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl NotificationStore for PostgresNotificationStore {
    async fn insert(&self, notification: &Notification) -> Result<Notification> {
        let inserted = sqlx::query_as::<_, Notification>(
            r#"
            INSERT INTO notifications (
                id, user_id, kind, priority, title, content, template_id,
                variables, locale, channels, metadata, state, attempts,
                suppressed_reason, last_error, created_at, updated_at,
                sent_at, read_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, $15, $16, $17, $18, $19, $20)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(notification.id)
        .bind(notification.user_id)
        .bind(notification.kind)
        .bind(notification.priority)
        .bind(&notification.title)
        .bind(&notification.content)
        .bind(&notification.template_id)
        .bind(&notification.variables)
        .bind(&notification.locale)
        .bind(&notification.channels)
        .bind(&notification.metadata)
        .bind(notification.state)
        .bind(notification.attempts)
        .bind(&notification.suppressed_reason)
        .bind(&notification.last_error)
        .bind(notification.created_at)
        .bind(notification.updated_at)
        .bind(notification.sent_at)
        .bind(notification.read_at)
        .bind(notification.deleted_at)
        .fetch_optional(&self.db)
        .await?;

        match inserted {
            Some(row) => Ok(row),
            // Conflict path: the row already exists, return it as stored
            None => self
                .get(notification.id)
                .await?
                .ok_or_else(|| Error::not_found(format!("notification {}", notification.id))),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Notification>> {
        let row = sqlx::query_as::<_, Notification>("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(row)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: NotificationState,
        to: NotificationState,
        ctx: TransitionContext,
    ) -> Result<TransitionOutcome> {
        if !from.can_transition_to(to) {
            return Err(Error::Validation(format!(
                "Illegal state transition {} -> {}",
                from, to
            )));
        }

        let mut tx = self.db.begin().await?;

        let updated = sqlx::query_as::<_, Notification>(
            r#"
            UPDATE notifications
            SET state = $3,
                attempts = CASE WHEN $7 THEN 0 ELSE attempts + $4 END,
                sent_at = CASE WHEN $3 = 'sent' THEN NOW() ELSE sent_at END,
                last_error = COALESCE($5, last_error),
                suppressed_reason = COALESCE($6, suppressed_reason),
                updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(if ctx.increment_attempts { 1i32 } else { 0i32 })
        .bind(&ctx.error)
        .bind(&ctx.suppressed_reason)
        .bind(ctx.reset_attempts)
        .fetch_optional(&mut *tx)
        .await?;

        let updated = match updated {
            Some(row) => row,
            None => {
                tx.rollback().await?;

                let actual: Option<NotificationState> =
                    sqlx::query_scalar("SELECT state FROM notifications WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.db)
                        .await?;

                return Ok(match actual {
                    Some(actual) => TransitionOutcome::Conflict { actual },
                    None => TransitionOutcome::NotFound,
                });
            }
        };

        sqlx::query(
            r#"
            INSERT INTO audit_log
                (id, notification_id, from_state, to_state, error, correlation_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(&ctx.error)
        .bind(&ctx.correlation_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TransitionOutcome::Applied(updated))
    }

    async fn list_by_user(
        &self,
        user_id: Uuid,
        filter: &NotificationFilter,
        page: Page,
    ) -> Result<Vec<Notification>> {
        let rows = sqlx::query_as::<_, Notification>(
            r#"
            SELECT * FROM notifications
            WHERE user_id = $1
              AND deleted_at IS NULL
              AND state <> 'archived'
              AND ($2::boolean IS NULL OR ($2 = (read_at IS NOT NULL)))
              AND ($3::text IS NULL OR kind = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(filter.is_read)
        .bind(filter.kind.map(|k| k.category().to_string()))
        .bind(page.limit())
        .bind(page.offset())
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn count_by_user(&self, user_id: Uuid, filter: &NotificationFilter) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM notifications
            WHERE user_id = $1
              AND deleted_at IS NULL
              AND state <> 'archived'
              AND ($2::boolean IS NULL OR ($2 = (read_at IS NOT NULL)))
              AND ($3::text IS NULL OR kind = $3)
            "#,
        )
        .bind(user_id)
        .bind(filter.is_read)
        .bind(filter.kind.map(|k| k.category().to_string()))
        .fetch_one(&self.db)
        .await?;

        Ok(count)
    }

    async fn mark_read(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET read_at = COALESCE(read_at, NOW()), updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn bulk_mark_read(&self, ids: &[Uuid], user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET read_at = COALESCE(read_at, NOW()), updated_at = NOW()
            WHERE id = ANY($1) AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(ids)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn soft_delete(&self, id: Uuid, user_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET deleted_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn archive_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM notifications
                WHERE created_at < $1
                  AND state IN ('sent', 'dead', 'failed')
                RETURNING id, user_id, kind, state, title, content,
                          attempts, created_at, sent_at
            )
            INSERT INTO archived_notifications
                (id, user_id, kind, state, title, content, attempts,
                 created_at, sent_at, archived_at)
            SELECT id, user_id, kind, 'archived', title, content, attempts,
                   created_at, sent_at, NOW()
            FROM moved
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(cutoff)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn archive_user_older_than(&self, user_id: Uuid, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM notifications
                WHERE user_id = $2
                  AND created_at < $1
                  AND state IN ('sent', 'dead', 'failed')
                RETURNING id, user_id, kind, state, title, content,
                          attempts, created_at, sent_at
            )
            INSERT INTO archived_notifications
                (id, user_id, kind, state, title, content, attempts,
                 created_at, sent_at, archived_at)
            SELECT id, user_id, kind, 'archived', title, content, attempts,
                   created_at, sent_at, NOW()
            FROM moved
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(cutoff)
        .bind(user_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_archived_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM archived_notifications WHERE archived_at < $1")
            .bind(cutoff)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected())
    }

    async fn export_archived(
        &self,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: i64,
    ) -> Result<Vec<ArchivedNotification>> {
        let (after_ts, after_id) = match after {
            Some((ts, id)) => (Some(ts), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, ArchivedNotification>(
            r#"
            SELECT id, user_id, kind, state, title, content, attempts,
                   created_at, sent_at, archived_at
            FROM archived_notifications
            WHERE ($1::timestamptz IS NULL OR (archived_at, id) > ($1, $2))
            ORDER BY archived_at, id
            LIMIT $3
            "#,
        )
        .bind(after_ts)
        .bind(after_id)
        .bind(limit.clamp(1, 1000))
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn stats(&self, user_id: Option<Uuid>) -> Result<NotificationStats> {
        let row: (i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE state IN ('pending', 'queued', 'rendered', 'sending')),
                   COUNT(*) FILTER (WHERE state = 'sent'),
                   COUNT(*) FILTER (WHERE state = 'failed'),
                   COUNT(*) FILTER (WHERE state = 'dead'),
                   COUNT(*) FILTER (WHERE read_at IS NULL AND state = 'sent')
            FROM notifications
            WHERE deleted_at IS NULL
              AND ($1::uuid IS NULL OR user_id = $1)
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.db)
        .await?;

        Ok(NotificationStats {
            total: row.0,
            pending: row.1,
            sent: row.2,
            failed: row.3,
            dead: row.4,
            unread: row.5,
        })
    }
}
