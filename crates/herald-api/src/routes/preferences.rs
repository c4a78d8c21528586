//! User delivery preferences.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::NaiveTime;
use herald_core::notification::Channel;
use herald_core::policy::valid_timezone;
use herald_core::repository::{DeliveryFrequency, Preference, CATEGORY_ANY};
use herald_core::{Error, ValidationErrors};
use serde::Deserialize;
use sqlx::types::Json as SqlJson;

use crate::envelope::ApiResult;
use crate::middleware::AuthOutcome;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePreferenceRequest {
    /// Notification category or `*`
    #[serde(default = "default_category")]
    pub category: String,

    pub channels_enabled: Vec<Channel>,

    #[serde(default)]
    pub frequency: DeliveryFrequency,

    pub quiet_hours_start: Option<NaiveTime>,

    pub quiet_hours_end: Option<NaiveTime>,

    pub timezone: Option<String>,

    #[serde(default = "default_true")]
    pub defer_during_quiet_hours: bool,
}

fn default_category() -> String {
    CATEGORY_ANY.to_string()
}

fn default_true() -> bool {
    true
}

/// `GET /api/v1/preferences`
pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
) -> ApiResult<Json<Vec<Preference>>> {
    let user_id = auth
        .principal
        .user_id()
        .ok_or_else(|| Error::forbidden("Requires a user principal"))?;

    let mut rows = state.preferences.list_for_user(user_id).await?;
    if rows.is_empty() {
        rows.push(Preference::default_for(user_id));
    }

    Ok(Json(rows))
}

/// `PUT /api/v1/preferences`
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthOutcome>,
    Json(request): Json<UpdatePreferenceRequest>,
) -> ApiResult<Json<Preference>> {
    let user_id = auth
        .principal
        .user_id()
        .ok_or_else(|| Error::forbidden("Requires a user principal"))?;

    let mut errors = ValidationErrors::new();

    if request.category != CATEGORY_ANY && request.category.parse::<herald_core::NotificationKind>().is_err()
    {
        errors.add("category", "unknown notification category");
    }

    if let Some(timezone) = &request.timezone {
        if !valid_timezone(timezone) {
            errors.add("timezone", "not a valid IANA timezone");
        }
    }

    if request.quiet_hours_start.is_some() != request.quiet_hours_end.is_some() {
        errors.add("quietHours", "start and end must be set together");
    }

    if !errors.is_empty() {
        return Err(errors.into_error().into());
    }

    let preference = Preference {
        user_id,
        category: request.category,
        channels_enabled: SqlJson(request.channels_enabled),
        frequency: request.frequency,
        quiet_hours_start: request.quiet_hours_start,
        quiet_hours_end: request.quiet_hours_end,
        timezone: request.timezone,
        defer_during_quiet_hours: request.defer_during_quiet_hours,
        updated_at: chrono::Utc::now(),
    };

    let stored = state.preferences.upsert(&preference).await?;

    Ok(Json(stored))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_request_defaults() {
        let request: UpdatePreferenceRequest = serde_json::from_value(serde_json::json!({
            "channelsEnabled": ["EMAIL", "IN_APP"]
        }))
        .unwrap();

        assert_eq!(request.category, "*");
        assert_eq!(request.frequency, DeliveryFrequency::Immediate);
        assert!(request.defer_during_quiet_hours);
    }

    #[test]
    fn test_quiet_hours_parse() {
        let request: UpdatePreferenceRequest = serde_json::from_value(serde_json::json!({
            "channelsEnabled": ["EMAIL"],
            "quietHoursStart": "22:00:00",
            "quietHoursEnd": "08:00:00",
            "timezone": "Europe/Berlin"
        }))
        .unwrap();

        assert_eq!(
            request.quiet_hours_start,
            Some(NaiveTime::from_hms_opt(22, 0, 0).unwrap())
        );
        assert_eq!(
            request.quiet_hours_end,
            Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap())
        );
    }
}
