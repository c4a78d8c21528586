//! Shared-cache layer (Redis).
//!
//! Holds the distributed tier of the template cache, the rate-limit
//! buckets, the token blacklist, and the digest buffers. Every
//! operation carries a bounded deadline; callers decide whether a
//! cache failure degrades (template cache, rate limiter) or fails
//! closed (token blacklist).

pub mod connection;
pub mod rate_limit;
pub mod token;

pub use connection::{RedisConnection, RedisPool};
pub use rate_limit::{OperationClass, RateLimitDecision, RateLimiter};
pub use token::{BlacklistedToken, TokenBlacklist};

/// Cache result type alias
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific error types
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Operation failed: {0}")]
    OperationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Timeout waiting for cache operation")]
    Timeout,
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::OperationError(err.to_string())
    }
}

impl From<CacheError> for crate::Error {
    fn from(err: CacheError) -> Self {
        crate::Error::Cache(err.to_string())
    }
}

/// Key namespaces; one prefix per data family to avoid collisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNamespace {
    /// Compiled template snapshots
    TemplateCompiled,

    /// Rendered template output
    TemplateRendered,

    /// Rate limiting buckets
    RateLimit,

    /// Token blacklist
    TokenBlacklist,

    /// Digest buffers
    Digest,

    /// Cache statistics
    Statistics,
}

impl CacheNamespace {
    /// Get the string prefix for this namespace
    pub fn prefix(&self) -> &'static str {
        match self {
            CacheNamespace::TemplateCompiled => "tpl:compiled",
            CacheNamespace::TemplateRendered => "tpl:rendered",
            CacheNamespace::RateLimit => "rate:limit",
            CacheNamespace::TokenBlacklist => "token:blacklist",
            CacheNamespace::Digest => "digest",
            CacheNamespace::Statistics => "stats",
        }
    }

    /// Build a fully-qualified key within this namespace
    pub fn key(&self, prefix: &str, suffix: &str) -> String {
        format!("{}:{}:{}", prefix, self.prefix(), suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_keys() {
        let key = CacheNamespace::RateLimit.key("herald", "u1/write/60");
        assert_eq!(key, "herald:rate:limit:u1/write/60");

        let key = CacheNamespace::TokenBlacklist.key("herald", "abc");
        assert!(key.starts_with("herald:token:blacklist:"));
    }

    #[test]
    fn test_cache_error_maps_to_root_error() {
        let err: crate::Error = CacheError::Timeout.into();
        assert_eq!(err.category(), "cache");
        assert_eq!(err.status_code(), 500);
    }
}
