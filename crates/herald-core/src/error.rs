use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::notification::NotificationState;

/// Main error type for herald
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (SQLx wrapped)
    Database(sqlx::Error),

    /// Message broker errors (lapin wrapped)
    Broker(lapin::Error),

    /// Cache errors
    Cache(String),

    /// Validation errors
    Validation(String),

    /// Credential missing or invalid
    Unauthorized(String),

    /// Credential valid, authority insufficient
    Forbidden(String),

    /// Resource absent
    NotFound(String),

    /// Operation already in progress or state precondition failed
    Conflict(String),

    /// Rate limit breached; carries seconds until the bucket refills
    RateLimited { retry_after_secs: u64 },

    /// Conditional state transition lost the race; internal only
    ConcurrentState {
        id: Uuid,
        expected: NotificationState,
        actual: NotificationState,
    },

    /// Template missing for the requested (id, channel, locale)
    TemplateNotFound(String),

    /// A required template variable was absent
    MissingVariable(String),

    /// Template compiled but rendering failed
    Render(String),

    /// Transport failed in a way worth retrying (network, 5xx, throttle)
    TransportTransient(String),

    /// Transport failed permanently (bad address, auth denied)
    TransportPermanent(String),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// IO errors
    Io(std::io::Error),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Broker(e) => write!(f, "Broker error: {}", e),
            Error::Cache(msg) => write!(f, "Cache error: {}", msg),
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            Error::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Error::RateLimited { retry_after_secs } => {
                write!(f, "Rate limited, retry after {}s", retry_after_secs)
            }
            Error::ConcurrentState { id, expected, actual } => write!(
                f,
                "Concurrent state change on {}: expected {}, found {}",
                id, expected, actual
            ),
            Error::TemplateNotFound(key) => write!(f, "Template not found: {}", key),
            Error::MissingVariable(name) => write!(f, "Missing template variable: {}", name),
            Error::Render(msg) => write!(f, "Render error: {}", msg),
            Error::TransportTransient(msg) => write!(f, "Transient transport failure: {}", msg),
            Error::TransportPermanent(msg) => write!(f, "Permanent transport failure: {}", msg),
            Error::Serialization(e) => write!(f, "Serialization error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Broker(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

// Conversions from external error types
impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::RowNotFound => Error::NotFound("row not found".to_string()),
            other => Error::Database(other),
        }
    }
}

impl From<lapin::Error> for Error {
    fn from(error: lapin::Error) -> Self {
        Error::Broker(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(error: uuid::Error) -> Self {
        Error::Validation(format!("Invalid UUID: {}", error))
    }
}

// Common error constructors
impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new validation error
    pub fn validation<T: Into<String>>(msg: T) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a new not found error
    pub fn not_found<T: Into<String>>(msg: T) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create a new unauthorized error
    pub fn unauthorized<T: Into<String>>(msg: T) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// Create a new forbidden error
    pub fn forbidden<T: Into<String>>(msg: T) -> Self {
        Error::Forbidden(msg.into())
    }

    /// Create a new cache error
    pub fn cache<T: Into<String>>(msg: T) -> Self {
        Error::Cache(msg.into())
    }

    /// Create a new conflict error
    pub fn conflict<T: Into<String>>(msg: T) -> Self {
        Error::Conflict(msg.into())
    }
}

impl Error {
    /// Get HTTP status code for error
    pub fn status_code(&self) -> u16 {
        match self {
            Error::Validation(_) | Error::MissingVariable(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) | Error::TemplateNotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::RateLimited { .. } => 429,
            Error::Config(_)
            | Error::Database(_)
            | Error::Broker(_)
            | Error::Cache(_)
            | Error::ConcurrentState { .. }
            | Error::Render(_)
            | Error::TransportTransient(_)
            | Error::TransportPermanent(_)
            | Error::Serialization(_)
            | Error::Io(_)
            | Error::Other(_) => 500,
        }
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Broker(_) => "broker",
            Error::Cache(_) => "cache",
            Error::Validation(_) => "validation",
            Error::Unauthorized(_) => "authn",
            Error::Forbidden(_) => "authz",
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::RateLimited { .. } => "rate_limited",
            Error::ConcurrentState { .. } => "concurrent_state",
            Error::TemplateNotFound(_) => "template_not_found",
            Error::MissingVariable(_) => "missing_variable",
            Error::Render(_) => "render",
            Error::TransportTransient(_) => "transport_transient",
            Error::TransportPermanent(_) => "transport_permanent",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// Whether the delivery pipeline may retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportTransient(_) | Error::Database(_) | Error::Broker(_) | Error::Cache(_)
        )
    }

    /// Whether this error moves a notification straight to the dead letter queue
    pub fn is_fatal_for_delivery(&self) -> bool {
        matches!(
            self,
            Error::TransportPermanent(_)
                | Error::TemplateNotFound(_)
                | Error::MissingVariable(_)
                | Error::Render(_)
        )
    }
}

/// Validation error struct for detailed field errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub code: Option<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
            code: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_error(self) -> Error {
        Error::Validation(
            serde_json::to_string(&self).unwrap_or_else(|_| "Validation failed".to_string()),
        )
    }
}

impl Default for ValidationErrors {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::validation("bad").status_code(), 400);
        assert_eq!(Error::unauthorized("no token").status_code(), 401);
        assert_eq!(Error::forbidden("no authority").status_code(), 403);
        assert_eq!(Error::not_found("gone").status_code(), 404);
        assert_eq!(Error::RateLimited { retry_after_secs: 5 }.status_code(), 429);
        assert_eq!(Error::Other("boom".to_string()).status_code(), 500);
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::TransportTransient("503".to_string()).is_retryable());
        assert!(!Error::TransportPermanent("550".to_string()).is_retryable());
        assert!(Error::TransportPermanent("550".to_string()).is_fatal_for_delivery());
        assert!(Error::MissingVariable("resetUrl".to_string()).is_fatal_for_delivery());
        assert!(!Error::TransportTransient("503".to_string()).is_fatal_for_delivery());
    }

    #[test]
    fn test_categories() {
        assert_eq!(Error::cache("down").category(), "cache");
        assert_eq!(
            Error::TemplateNotFound("welcome/email/en".to_string()).category(),
            "template_not_found"
        );
    }

    #[test]
    fn test_validation_errors_collect() {
        let mut errors = ValidationErrors::new();
        assert!(errors.is_empty());
        errors.add("userId", "must not be empty");
        errors.add("channels", "must contain at least one channel");
        assert_eq!(errors.errors.len(), 2);
        assert_eq!(errors.into_error().status_code(), 400);
    }
}
