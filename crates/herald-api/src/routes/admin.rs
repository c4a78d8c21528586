//! Admin operations: retention cleanup, stats, archive export, and
//! dead-letter administration.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use herald_core::notification::NotificationStats;
use herald_core::repository::notification_repository::ArchivedNotification;
use herald_core::scheduler::{CleanupResult, CleanupRun};
use herald_core::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::envelope::ApiResult;
use crate::state::AppState;

/// `POST /admin/cleanup/run`: synchronous, single-flight.
pub async fn cleanup_run(State(state): State<AppState>) -> ApiResult<Json<CleanupResult>> {
    match state.scheduler.run_cleanup().await? {
        CleanupRun::Completed(result) => Ok(Json(result)),
        CleanupRun::AlreadyRunning => {
            Err(Error::conflict("cleanup already running").into())
        }
    }
}

/// `POST /admin/cleanup/run-async`
pub async fn cleanup_run_async(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let scheduler: Arc<_> = state.scheduler.clone();
    tokio::spawn(async move {
        match scheduler.run_cleanup().await {
            Ok(CleanupRun::Completed(result)) => {
                tracing::info!(?result, "Async cleanup finished");
            }
            Ok(CleanupRun::AlreadyRunning) => {
                tracing::info!("Async cleanup skipped, already running");
            }
            Err(e) => tracing::error!(error = %e, "Async cleanup failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "started" })),
    ))
}

/// `POST /admin/cleanup/user/{id}`
pub async fn cleanup_user(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<CleanupResult>> {
    match state.scheduler.run_cleanup_for_user(user_id).await? {
        CleanupRun::Completed(result) => Ok(Json(result)),
        CleanupRun::AlreadyRunning => {
            Err(Error::conflict("cleanup already running").into())
        }
    }
}

/// `GET /admin/stats`
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<NotificationStats>> {
    Ok(Json(state.store.stats(None).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportQuery {
    pub after_ts: Option<DateTime<Utc>>,
    pub after_id: Option<Uuid>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPage {
    pub items: Vec<ArchivedNotification>,
    /// Cursor for the next page; absent when the export is done
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after_ts: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after_id: Option<Uuid>,
}

/// `GET /admin/export`: lazy, restartable archive export.
pub async fn export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Json<ExportPage>> {
    let after = match (query.after_ts, query.after_id) {
        (Some(ts), Some(id)) => Some((ts, id)),
        (None, None) => None,
        _ => {
            return Err(
                Error::validation("afterTs and afterId must be provided together").into(),
            )
        }
    };

    let limit = query.limit.unwrap_or(100);
    let items = state.store.export_archived(after, limit).await?;

    let cursor = if items.len() as i64 >= limit.clamp(1, 1000) {
        items.last().map(|row| (row.archived_at, row.id))
    } else {
        None
    };

    Ok(Json(ExportPage {
        items,
        next_after_ts: cursor.map(|(ts, _)| ts),
        next_after_id: cursor.map(|(_, id)| id),
    }))
}

/// `GET /admin/config`: effective settings, secrets omitted.
pub async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = &state.config;
    Json(serde_json::json!({
        "retention": {
            "days": config.retention.days,
            "hardDeleteDays": config.retention.hard_delete_days,
            "cleanupIntervalHours": config.retention.cleanup_interval_hours,
        },
        "delivery": {
            "maxRetries": config.delivery.max_retries,
            "initialWorkers": config.delivery.initial_workers,
            "maxWorkers": config.delivery.max_workers,
        },
        "broker": {
            "exchange": config.broker.exchange_main,
            "queueMain": config.broker.queue_main,
            "queuePriority": config.broker.queue_priority,
            "messageTtlMs": config.broker.message_ttl_ms,
        },
        "rateLimiting": {
            "enabled": config.rate_limiting.enabled,
            "readPerMinute": config.rate_limiting.read_per_minute,
            "writePerMinute": config.rate_limiting.write_per_minute,
            "adminPerMinute": config.rate_limiting.admin_per_minute,
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<i64>,
}

/// `GET /admin/dlq/{queue}`
pub async fn dlq_list(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<DlqQuery>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    let letters = state
        .replay
        .list(&queue, query.limit.unwrap_or(100))
        .await?;

    // Payload bytes are elided from the listing
    let view = letters
        .into_iter()
        .map(|letter| {
            serde_json::json!({
                "id": letter.id,
                "messageId": letter.message_id,
                "queue": letter.queue,
                "routingKey": letter.routing_key,
                "firstError": letter.first_error,
                "lastError": letter.last_error,
                "attempts": letter.attempts,
                "failureKind": letter.failure_kind,
                "replayedAt": letter.replayed_at,
                "createdAt": letter.created_at,
            })
        })
        .collect();

    Ok(Json(view))
}

/// `POST /admin/dlq/replay/{id}`: idempotent by message id.
pub async fn dlq_replay(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let outcome = state.replay.replay(id).await?;
    Ok(Json(serde_json::json!({ "outcome": outcome })))
}

/// `DELETE /admin/dlq/{queue}`
pub async fn dlq_purge(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let purged = state.replay.purge(&queue).await?;
    Ok(Json(serde_json::json!({ "purged": purged })))
}
