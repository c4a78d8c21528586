//! Notification templates, keyed by `(template_id, channel, locale)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::notification::Channel;
use crate::Result;

/// Locale used when the requested one has no template
pub const DEFAULT_LOCALE: &str = "en";

/// Template record. `version` is bumped on every update so cache
/// entries keyed by it can be swapped without invalidation races.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Template {
    pub id: Uuid,

    /// Logical template name, e.g. `password_reset`
    pub template_id: String,

    pub channel: Channel,

    pub locale: String,

    /// Subject template; mandatory for EMAIL
    pub subject: Option<String>,

    /// Body template with `{{variable}}` placeholders
    pub body: String,

    /// Whether the EMAIL body is HTML (drives escaping)
    pub html: bool,

    /// Variables that must be present at render time
    pub required_variables: Json<Vec<String>>,

    pub version: i64,

    pub is_active: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        template_id: impl Into<String>,
        channel: Channel,
        locale: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            template_id: template_id.into(),
            channel,
            locale: locale.into(),
            subject: None,
            body: body.into(),
            html: false,
            required_variables: Json(Vec::new()),
            version: 1,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_html(mut self, html: bool) -> Self {
        self.html = html;
        self
    }

    pub fn with_required_variables(mut self, variables: Vec<String>) -> Self {
        self.required_variables = Json(variables);
        self
    }
}

/// Fields accepted by a template update; version is bumped server-side
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateUpdate {
    pub subject: Option<Option<String>>,
    pub body: Option<String>,
    pub html: Option<bool>,
    pub required_variables: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Active template for the exact `(template_id, channel, locale)`.
    async fn find(
        &self,
        template_id: &str,
        channel: Channel,
        locale: &str,
    ) -> Result<Option<Template>>;

    /// Exact locale first, then the default locale.
    async fn find_with_fallback(
        &self,
        template_id: &str,
        channel: Channel,
        locale: Option<&str>,
    ) -> Result<Option<Template>> {
        if let Some(locale) = locale {
            if let Some(template) = self.find(template_id, channel, locale).await? {
                return Ok(Some(template));
            }
        }
        self.find(template_id, channel, DEFAULT_LOCALE).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Template>>;

    async fn list(&self, include_inactive: bool) -> Result<Vec<Template>>;

    async fn create(&self, template: &Template) -> Result<Template>;

    /// Applies the update and bumps `version`.
    async fn update(&self, id: Uuid, update: TemplateUpdate) -> Result<Option<Template>>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// PostgreSQL implementation of `TemplateStore`
#[derive(Clone)]
pub struct PostgresTemplateStore {
    db: PgPool,
}

impl PostgresTemplateStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TemplateStore for PostgresTemplateStore {
    async fn find(
        &self,
        template_id: &str,
        channel: Channel,
        locale: &str,
    ) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, Template>(
            r#"
            SELECT * FROM notification_templates
            WHERE template_id = $1 AND channel = $2 AND locale = $3 AND is_active
            "#,
        )
        .bind(template_id)
        .bind(channel)
        .bind(locale)
        .fetch_optional(&self.db)
        .await?;

        Ok(row)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Template>> {
        let row =
            sqlx::query_as::<_, Template>("SELECT * FROM notification_templates WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;

        Ok(row)
    }

    async fn list(&self, include_inactive: bool) -> Result<Vec<Template>> {
        let rows = sqlx::query_as::<_, Template>(
            r#"
            SELECT * FROM notification_templates
            WHERE $1 OR is_active
            ORDER BY template_id, channel, locale
            "#,
        )
        .bind(include_inactive)
        .fetch_all(&self.db)
        .await?;

        Ok(rows)
    }

    async fn create(&self, template: &Template) -> Result<Template> {
        let row = sqlx::query_as::<_, Template>(
            r#"
            INSERT INTO notification_templates
                (id, template_id, channel, locale, subject, body, html,
                 required_variables, version, is_active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, $9, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(template.id)
        .bind(&template.template_id)
        .bind(template.channel)
        .bind(&template.locale)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(template.html)
        .bind(&template.required_variables)
        .bind(template.is_active)
        .fetch_one(&self.db)
        .await?;

        Ok(row)
    }

    async fn update(&self, id: Uuid, update: TemplateUpdate) -> Result<Option<Template>> {
        let row = sqlx::query_as::<_, Template>(
            r#"
            UPDATE notification_templates
            SET subject = CASE WHEN $2 THEN $3 ELSE subject END,
                body = COALESCE($4, body),
                html = COALESCE($5, html),
                required_variables = COALESCE($6, required_variables),
                is_active = COALESCE($7, is_active),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(update.subject.is_some())
        .bind(update.subject.flatten())
        .bind(update.body)
        .bind(update.html)
        .bind(update.required_variables.map(Json))
        .bind(update.is_active)
        .fetch_optional(&self.db)
        .await?;

        Ok(row)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM notification_templates WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_builder() {
        let template = Template::new("password_reset", Channel::Email, "en", "Hi {{name}}")
            .with_subject("Reset your password")
            .with_html(true)
            .with_required_variables(vec!["name".to_string(), "resetUrl".to_string()]);

        assert_eq!(template.version, 1);
        assert!(template.is_active);
        assert!(template.html);
        assert_eq!(template.required_variables.len(), 2);
    }
}
