//! Notification ingress and listing.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use herald_core::notification::{
    Channel, Notification, NotificationFilter, NotificationKind, Priority,
};
use herald_core::repository::Page;
use herald_core::{Error, ValidationErrors};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::envelope::ApiResult;
use crate::middleware::{AuthOutcome, CorrelationId};
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateNotificationRequest {
    /// Recipient. Optional for user principals (defaults to self),
    /// required for service principals.
    pub user_id: Option<Uuid>,

    #[serde(rename = "type")]
    pub kind: NotificationKind,

    #[validate(length(max = 200))]
    pub title: Option<String>,

    #[validate(length(max = 10000))]
    pub content: Option<String>,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub channels: Vec<Channel>,

    pub template_id: Option<String>,

    #[serde(default)]
    pub variables: serde_json::Value,

    pub locale: Option<String>,

    #[serde(default)]
    pub metadata: serde_json::Value,

    #[serde(default)]
    pub metadata_map: HashMap<String, String>,
}

impl CreateNotificationRequest {
    /// Single normalized metadata view; the flat map wins on key
    /// collision.
    fn merged_metadata(&self) -> serde_json::Value {
        let mut merged = serde_json::Map::new();
        if let Some(obj) = self.metadata.as_object() {
            for (key, value) in obj {
                merged.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &self.metadata_map {
            merged.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        if merged.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::Object(merged)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: Option<u32>,
    pub size: Option<u32>,
    pub is_read: Option<bool>,
    #[serde(rename = "type")]
    pub kind: Option<NotificationKind>,
}

#[derive(Debug, Serialize)]
pub struct PagedResponse<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: i64,
}

#[derive(Debug, Deserialize)]
pub struct BulkReadRequest {
    pub ids: Vec<Uuid>,
}

/// `POST /api/v1/notifications`
pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
    Extension(correlation): Extension<CorrelationId>,
    Json(request): Json<CreateNotificationRequest>,
) -> ApiResult<(StatusCode, Json<Notification>)> {
    // Writes need the USER authority or the notification.send scope
    if !auth.principal.can_write_notifications() {
        return Err(Error::forbidden("Write access requires the USER authority").into());
    }

    request
        .validate()
        .map_err(|e| Error::validation(e.to_string()))?;

    let mut errors = ValidationErrors::new();

    let user_id = match request.user_id.or_else(|| auth.principal.user_id()) {
        Some(user_id) => user_id,
        None => {
            errors.add("userId", "required for service principals");
            Uuid::nil()
        }
    };

    if !errors.is_empty() {
        return Err(errors.into_error().into());
    }

    let template_id = effective_template_id(&request);

    let notification = Notification::new(
        user_id,
        request.kind,
        request.title.clone().unwrap_or_default(),
        request.content.clone().unwrap_or_default(),
    )
    .with_priority(request.priority)
    .with_channels(request.channels.clone())
    .with_metadata(request.merged_metadata());

    let mut notification = notification;
    if let Some(template_id) = template_id {
        notification = notification.with_template(template_id, request.variables.clone());
    }
    if let Some(locale) = &request.locale {
        notification = notification.with_locale(locale.clone());
    }

    // The record is durable before anything is published or returned
    let stored = state.store.insert(&notification).await?;

    let message = herald_core::NotificationMessage::from(&stored);
    state
        .publisher
        .publish_created(&message, Some(&correlation.0))
        .await?;

    Ok((StatusCode::CREATED, Json(stored)))
}

/// Without an explicit body or template, the notification kind names
/// the template (`PASSWORD_RESET` -> `password_reset`).
fn effective_template_id(request: &CreateNotificationRequest) -> Option<String> {
    if request.template_id.is_some() {
        return request.template_id.clone();
    }

    let has_body = request.title.is_some() || request.content.is_some();
    if has_body {
        None
    } else {
        Some(request.kind.category().to_string())
    }
}

/// `GET /api/v1/notifications`
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<PagedResponse<Notification>>> {
    let user_id = auth
        .principal
        .user_id()
        .ok_or_else(|| Error::forbidden("Listing requires a user principal"))?;

    let filter = NotificationFilter {
        is_read: query.is_read,
        kind: query.kind,
    };
    let page = Page::new(query.page.unwrap_or(0), query.size.unwrap_or(20));

    let items = state.store.list_by_user(user_id, &filter, page).await?;
    let total = state.store.count_by_user(user_id, &filter).await?;

    Ok(Json(PagedResponse {
        items,
        page: page.page,
        size: page.size,
        total,
    }))
}

/// `PUT /api/v1/notifications/{id}/read` (idempotent)
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let user_id = auth
        .principal
        .user_id()
        .ok_or_else(|| Error::forbidden("Requires a user principal"))?;

    if state.store.mark_read(id, user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found(format!("notification {}", id)).into())
    }
}

/// `POST /api/v1/notifications/bulk-read`
pub async fn bulk_mark_read(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
    Json(request): Json<BulkReadRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_id = auth
        .principal
        .user_id()
        .ok_or_else(|| Error::forbidden("Requires a user principal"))?;

    if request.ids.is_empty() {
        return Err(Error::validation("ids must not be empty").into());
    }

    let updated = state.store.bulk_mark_read(&request.ids, user_id).await?;

    Ok(Json(serde_json::json!({ "updated": updated })))
}

/// `DELETE /api/v1/notifications/{id}` (soft delete)
pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let user_id = auth
        .principal
        .user_id()
        .ok_or_else(|| Error::forbidden("Requires a user principal"))?;

    if state.store.soft_delete(id, user_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Error::not_found(format!("notification {}", id)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_parses_wire_shape() {
        let request: CreateNotificationRequest = serde_json::from_value(serde_json::json!({
            "userId": "0a0f5c3e-1111-4222-8333-444455556666",
            "type": "PASSWORD_RESET",
            "channels": ["EMAIL"],
            "metadata": {"userEmail": "a@x.com"},
            "variables": {"resetUrl": "https://x/r?t=abc"},
            "templateId": "password_reset"
        }))
        .unwrap();

        assert_eq!(request.kind, NotificationKind::PasswordReset);
        assert_eq!(request.channels, vec![Channel::Email]);
        assert_eq!(request.priority, Priority::Normal);
        assert_eq!(request.template_id.as_deref(), Some("password_reset"));
    }

    #[test]
    fn test_metadata_map_wins_in_request_merge() {
        let request: CreateNotificationRequest = serde_json::from_value(serde_json::json!({
            "type": "SYSTEM_ALERT",
            "title": "t",
            "content": "c",
            "metadata": {"userEmail": "struct@x.com"},
            "metadataMap": {"userEmail": "map@x.com"}
        }))
        .unwrap();

        let merged = request.merged_metadata();
        assert_eq!(merged["userEmail"], "map@x.com");
    }

    #[test]
    fn test_template_defaults_to_kind_when_no_body() {
        let bare: CreateNotificationRequest = serde_json::from_value(serde_json::json!({
            "userId": Uuid::new_v4(),
            "type": "PASSWORD_RESET",
            "channels": ["EMAIL"],
            "metadata": {"userEmail": "a@x.com"},
            "variables": {"resetUrl": "https://x/r?t=abc"}
        }))
        .unwrap();
        assert_eq!(
            effective_template_id(&bare).as_deref(),
            Some("password_reset")
        );

        let with_body: CreateNotificationRequest = serde_json::from_value(serde_json::json!({
            "type": "SYSTEM_ALERT",
            "title": "t",
            "content": "c"
        }))
        .unwrap();
        assert_eq!(effective_template_id(&with_body), None);

        let explicit: CreateNotificationRequest = serde_json::from_value(serde_json::json!({
            "type": "SYSTEM_ALERT",
            "templateId": "custom_alert"
        }))
        .unwrap();
        assert_eq!(
            effective_template_id(&explicit).as_deref(),
            Some("custom_alert")
        );
    }

    #[test]
    fn test_list_query_wire_names() {
        let query: ListQuery =
            serde_json::from_value(serde_json::json!({"isRead": false, "type": "BUDDY_REQUEST"}))
                .unwrap();
        assert_eq!(query.is_read, Some(false));
        assert_eq!(query.kind, Some(NotificationKind::BuddyRequest));
    }
}
