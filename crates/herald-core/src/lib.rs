pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod delivery;
pub mod dlq;
pub mod error;
pub mod notification;
pub mod observability;
pub mod policy;
pub mod repository;
pub mod scheduler;
pub mod template;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result, ValidationErrors};
pub use notification::{
    Channel, Notification, NotificationFilter, NotificationKind, NotificationMessage,
    NotificationState, NotificationStats, Priority,
};

/// Embedded schema migrations, run at boot.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Current version of herald
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_reexports() {
        let err = Error::validation("bad request");
        assert_eq!(err.status_code(), 400);
        assert_eq!(err.category(), "validation");
    }
}
