//! Template administration (admin only).

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use herald_core::notification::Channel;
use herald_core::repository::{Template, TemplateUpdate};
use herald_core::Error;
use serde::Deserialize;
use uuid::Uuid;

use crate::envelope::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTemplateRequest {
    pub template_id: String,
    pub channel: Channel,
    #[serde(default = "default_locale")]
    pub locale: String,
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub html: bool,
    #[serde(default)]
    pub required_variables: Vec<String>,
}

fn default_locale() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTemplatesQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// `GET /api/v1/admin/templates`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListTemplatesQuery>,
) -> ApiResult<Json<Vec<Template>>> {
    Ok(Json(state.template_store.list(query.include_inactive).await?))
}

/// `POST /api/v1/admin/templates`
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateTemplateRequest>,
) -> ApiResult<(StatusCode, Json<Template>)> {
    if request.template_id.trim().is_empty() {
        return Err(Error::validation("templateId must not be empty").into());
    }
    if request.body.trim().is_empty() {
        return Err(Error::validation("body must not be empty").into());
    }
    if request.channel == Channel::Email && request.subject.is_none() {
        return Err(Error::validation("email templates require a subject").into());
    }

    if state
        .template_store
        .find(&request.template_id, request.channel, &request.locale)
        .await?
        .is_some()
    {
        return Err(Error::conflict(format!(
            "template {}/{}/{} already exists",
            request.template_id, request.channel, request.locale
        ))
        .into());
    }

    let mut template = Template::new(
        request.template_id,
        request.channel,
        request.locale,
        request.body,
    )
    .with_html(request.html)
    .with_required_variables(request.required_variables);
    template.subject = request.subject;

    let stored = state.template_store.create(&template).await?;

    Ok((StatusCode::CREATED, Json(stored)))
}

/// `GET /api/v1/admin/templates/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Template>> {
    state
        .template_store
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| Error::not_found(format!("template {}", id)).into())
}

/// `PUT /api/v1/admin/templates/{id}`: bumps the version, drops cache
/// entries.
pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<TemplateUpdate>,
) -> ApiResult<Json<Template>> {
    let updated = state
        .template_store
        .update(id, update)
        .await?
        .ok_or_else(|| Error::not_found(format!("template {}", id)))?;

    state.templates.invalidate(&updated.template_id).await;

    Ok(Json(updated))
}

/// `DELETE /api/v1/admin/templates/{id}`
pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let template = state
        .template_store
        .get(id)
        .await?
        .ok_or_else(|| Error::not_found(format!("template {}", id)))?;

    state.template_store.delete(id).await?;
    state.templates.invalidate(&template.template_id).await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_defaults() {
        let request: CreateTemplateRequest = serde_json::from_value(serde_json::json!({
            "templateId": "password_reset",
            "channel": "EMAIL",
            "subject": "Reset",
            "body": "Hello {{name}}"
        }))
        .unwrap();

        assert_eq!(request.locale, "en");
        assert!(!request.html);
        assert!(request.required_variables.is_empty());
    }
}
