//! Distributed rate limiting.
//!
//! Token buckets are kept in the shared cache, one per
//! `(principal, operation class)`. A bucket is a window-scoped counter
//! bumped with `INCR`; its expiry equals the refill interval, so a
//! fresh window starts with a full budget. Works unchanged across
//! multiple service instances.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::cache::{CacheNamespace, CacheResult, RedisPool};
use crate::config::RateLimitConfig;

/// Refill interval for all buckets
const WINDOW_SECS: u64 = 60;

/// Operation classes with independent budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Read,
    Write,
    Admin,
    /// Health, docs, metrics; never limited
    Public,
}

impl OperationClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::Read => "read",
            OperationClass::Write => "write",
            OperationClass::Admin => "admin",
            OperationClass::Public => "public",
        }
    }
}

/// Outcome of a rate-limit check, carrying everything the HTTP layer
/// needs for the `X-RateLimit-*` and `Retry-After` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the bucket refills
    pub reset_secs: u64,
}

impl RateLimitDecision {
    fn open(limit: u64, reset_secs: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_secs,
        }
    }
}

/// Redis-backed rate limiter
#[derive(Clone)]
pub struct RateLimiter {
    pool: RedisPool,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(pool: RedisPool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    fn limit_for(&self, class: OperationClass) -> u64 {
        let base = match class {
            OperationClass::Read => self.config.read_per_minute,
            OperationClass::Write => self.config.write_per_minute,
            OperationClass::Admin => self.config.admin_per_minute,
            OperationClass::Public => u64::MAX,
        };
        base.saturating_add(self.config.burst)
    }

    fn window_key(&self, principal: &str, class: OperationClass, window_start: u64) -> String {
        CacheNamespace::RateLimit.key(
            self.pool.key_prefix(),
            &format!("{}/{}/{}", principal, class.as_str(), window_start),
        )
    }

    /// Check and consume one token for `(principal, class)`.
    ///
    /// Cache outages fail open: dropping legitimate traffic because the
    /// limiter store is down is the wrong trade for this surface. The
    /// token blacklist makes the opposite choice.
    pub async fn check(&self, principal: &str, class: OperationClass) -> RateLimitDecision {
        let limit = self.limit_for(class);
        let (window_start, reset_secs) = current_window();

        if !self.config.enabled || class == OperationClass::Public {
            return RateLimitDecision::open(limit, reset_secs);
        }

        match self.try_consume(principal, class, window_start).await {
            Ok(current) => {
                let allowed = current <= limit;
                let remaining = limit.saturating_sub(current);

                if !allowed {
                    warn!(
                        principal,
                        class = class.as_str(),
                        current,
                        limit,
                        "Rate limit exceeded"
                    );
                    metrics::counter!("ratelimit.denied", "class" => class.as_str()).increment(1);
                } else {
                    debug!(
                        principal,
                        class = class.as_str(),
                        current,
                        limit,
                        "Rate limit check"
                    );
                }

                RateLimitDecision {
                    allowed,
                    limit,
                    remaining,
                    reset_secs,
                }
            }
            Err(e) => {
                warn!(error = %e, "Rate limiter cache unavailable, allowing request");
                RateLimitDecision::open(limit, reset_secs)
            }
        }
    }

    async fn try_consume(
        &self,
        principal: &str,
        class: OperationClass,
        window_start: u64,
    ) -> CacheResult<u64> {
        let mut conn = self.pool.get().await?;
        let key = self.window_key(principal, class, window_start);

        let current = conn.incr(&key).await?;

        // Bucket expiry equals the refill interval
        if current == 1 {
            conn.expire(&key, WINDOW_SECS as i64).await?;
        }

        Ok(current.max(0) as u64)
    }

    /// Current usage without consuming a token.
    pub async fn usage(&self, principal: &str, class: OperationClass) -> CacheResult<u64> {
        let mut conn = self.pool.get().await?;
        let (window_start, _) = current_window();
        let key = self.window_key(principal, class, window_start);

        let value = conn.get_string(&key).await?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }
}

/// Returns the start of the current window and the seconds left in it.
fn current_window() -> (u64, u64) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let window_start = now - (now % WINDOW_SECS);
    let reset_secs = (window_start + WINDOW_SECS).saturating_sub(now).max(1);
    (window_start, reset_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_math() {
        let (start, reset) = current_window();
        assert_eq!(start % WINDOW_SECS, 0);
        assert!(reset >= 1 && reset <= WINDOW_SECS);
    }

    #[test]
    fn test_operation_class_names() {
        assert_eq!(OperationClass::Read.as_str(), "read");
        assert_eq!(OperationClass::Write.as_str(), "write");
        assert_eq!(OperationClass::Admin.as_str(), "admin");
        assert_eq!(OperationClass::Public.as_str(), "public");
    }

    #[test]
    fn test_open_decision_has_full_budget() {
        let decision = RateLimitDecision::open(60, 30);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 60);
        assert_eq!(decision.reset_secs, 30);
    }

    #[tokio::test]
    async fn test_limit_and_denial_against_live_cache() {
        // Exercised only when a local Redis is available, mirroring the
        // window behavior: limit+1-th request in the window is denied.
        let config = crate::config::CacheConfig {
            max_retries: 1,
            retry_delay_ms: 10,
            ..Default::default()
        };

        if let Ok(pool) = RedisPool::new(config).await {
            let limiter = RateLimiter::new(
                pool,
                RateLimitConfig {
                    enabled: true,
                    write_per_minute: 3,
                    burst: 0,
                    ..Default::default()
                },
            );

            let principal = format!("test-{}", uuid::Uuid::new_v4());

            let mut last_remaining = u64::MAX;
            for _ in 0..3 {
                let decision = limiter.check(&principal, OperationClass::Write).await;
                assert!(decision.allowed);
                assert!(decision.remaining < last_remaining);
                last_remaining = decision.remaining;
            }

            let denied = limiter.check(&principal, OperationClass::Write).await;
            assert!(!denied.allowed);
            assert_eq!(denied.remaining, 0);
            assert!(denied.reset_secs >= 1);
        }
    }
}
