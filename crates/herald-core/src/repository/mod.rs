//! Persistence layer.
//!
//! One repository trait per aggregate with a Postgres implementation.
//! The notification repository owns the delivery state machine: every
//! state change goes through its conditional transition and lands in
//! the audit log.

pub mod dead_letter_repository;
pub mod notification_repository;
pub mod preference_repository;
pub mod template_repository;

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::DatabaseConfig;
use crate::{Error, Result};

pub use dead_letter_repository::{DeadLetter, DeadLetterStore, PostgresDeadLetterStore};
pub use notification_repository::{
    NotificationStore, PostgresNotificationStore, TransitionContext, TransitionOutcome,
};
pub use preference_repository::{
    DeliveryFrequency, PostgresPreferenceStore, Preference, PreferenceStore,
};
pub use template_repository::{PostgresTemplateStore, Template, TemplateStore, TemplateUpdate};

/// Wildcard preference category
pub const CATEGORY_ANY: &str = "*";

/// Create the shared Postgres pool.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.timeout_secs))
        .connect(&config.url)
        .await
        .map_err(Error::Database)?;

    Ok(pool)
}

/// Paged query window
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub size: u32,
}

impl Page {
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, 200),
        }
    }

    pub fn offset(&self) -> i64 {
        self.page as i64 * self.size as i64
    }

    pub fn limit(&self) -> i64 {
        self.size as i64
    }
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 0, size: 20 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_window() {
        let page = Page::new(2, 25);
        assert_eq!(page.offset(), 50);
        assert_eq!(page.limit(), 25);
    }

    #[test]
    fn test_page_size_clamped() {
        assert_eq!(Page::new(0, 0).limit(), 1);
        assert_eq!(Page::new(0, 10_000).limit(), 200);
    }
}
