//! User delivery preferences, one row per `(user, category)`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::notification::Channel;
use crate::repository::CATEGORY_ANY;
use crate::Result;

/// How often a category is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryFrequency {
    Immediate,
    DigestHourly,
    DigestDaily,
    DigestWeekly,
    Off,
}

impl Default for DeliveryFrequency {
    fn default() -> Self {
        DeliveryFrequency::Immediate
    }
}

impl DeliveryFrequency {
    /// Digest bucket length in seconds; `None` for non-digest modes.
    pub fn bucket_secs(&self) -> Option<i64> {
        match self {
            DeliveryFrequency::DigestHourly => Some(3_600),
            DeliveryFrequency::DigestDaily => Some(86_400),
            DeliveryFrequency::DigestWeekly => Some(604_800),
            DeliveryFrequency::Immediate | DeliveryFrequency::Off => None,
        }
    }
}

/// Preference record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Preference {
    pub user_id: Uuid,

    /// Notification category or `*` for the wildcard row
    pub category: String,

    pub channels_enabled: Json<Vec<Channel>>,

    pub frequency: DeliveryFrequency,

    pub quiet_hours_start: Option<NaiveTime>,

    pub quiet_hours_end: Option<NaiveTime>,

    /// IANA timezone name for the quiet-hours window
    pub timezone: Option<String>,

    /// Defer (true) or drop (false) non-critical deliveries that land
    /// inside quiet hours
    pub defer_during_quiet_hours: bool,

    pub updated_at: DateTime<Utc>,
}

impl Preference {
    /// Built-in default: every channel on, immediate, no quiet hours.
    pub fn default_for(user_id: Uuid) -> Self {
        Self {
            user_id,
            category: CATEGORY_ANY.to_string(),
            channels_enabled: Json(Channel::ALL.to_vec()),
            frequency: DeliveryFrequency::Immediate,
            quiet_hours_start: None,
            quiet_hours_end: None,
            timezone: None,
            defer_during_quiet_hours: true,
            updated_at: Utc::now(),
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        self.channels_enabled.iter().any(|c| *c == channel)
    }
}

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// All preference rows for a user (wildcard and specific).
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Preference>>;

    async fn get(&self, user_id: Uuid, category: &str) -> Result<Option<Preference>>;

    /// Insert or replace a `(user, category)` row.
    async fn upsert(&self, preference: &Preference) -> Result<Preference>;
}

/// PostgreSQL implementation of `PreferenceStore`
#[derive(Clone)]
pub struct PostgresPreferenceStore {
    db: PgPool,
}

impl PostgresPreferenceStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PreferenceStore for PostgresPreferenceStore {
    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Preference>> {
        let rows = sqlx::query_as::<_, Preference>(
            "SELECT * FROM notification_preferences WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn get(&self, user_id: Uuid, category: &str) -> Result<Option<Preference>> {
        let row = sqlx::query_as::<_, Preference>(
            "SELECT * FROM notification_preferences WHERE user_id = $1 AND category = $2",
        )
        .bind(user_id)
        .bind(category)
        .fetch_optional(&self.db)
        .await?;

        Ok(row)
    }

    async fn upsert(&self, preference: &Preference) -> Result<Preference> {
        let row = sqlx::query_as::<_, Preference>(
            r#"
            INSERT INTO notification_preferences
                (user_id, category, channels_enabled, frequency,
                 quiet_hours_start, quiet_hours_end, timezone,
                 defer_during_quiet_hours, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (user_id, category) DO UPDATE SET
                channels_enabled = EXCLUDED.channels_enabled,
                frequency = EXCLUDED.frequency,
                quiet_hours_start = EXCLUDED.quiet_hours_start,
                quiet_hours_end = EXCLUDED.quiet_hours_end,
                timezone = EXCLUDED.timezone,
                defer_during_quiet_hours = EXCLUDED.defer_during_quiet_hours,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(preference.user_id)
        .bind(&preference.category)
        .bind(&preference.channels_enabled)
        .bind(preference.frequency)
        .bind(preference.quiet_hours_start)
        .bind(preference.quiet_hours_end)
        .bind(&preference.timezone)
        .bind(preference.defer_during_quiet_hours)
        .fetch_one(&self.db)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_preference_enables_everything() {
        let pref = Preference::default_for(Uuid::new_v4());
        for channel in Channel::ALL {
            assert!(pref.channel_enabled(channel));
        }
        assert_eq!(pref.frequency, DeliveryFrequency::Immediate);
        assert_eq!(pref.category, CATEGORY_ANY);
    }

    #[test]
    fn test_digest_buckets() {
        assert_eq!(DeliveryFrequency::Immediate.bucket_secs(), None);
        assert_eq!(DeliveryFrequency::DigestHourly.bucket_secs(), Some(3_600));
        assert_eq!(DeliveryFrequency::DigestDaily.bucket_secs(), Some(86_400));
        assert_eq!(
            DeliveryFrequency::DigestWeekly.bucket_secs(),
            Some(604_800)
        );
        assert_eq!(DeliveryFrequency::Off.bucket_secs(), None);
    }
}
