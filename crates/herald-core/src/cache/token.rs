//! Token blacklist for revoked credentials.
//!
//! Entries expire by TTL. Lookups fail closed: if the store cannot be
//! reached, a token is treated as revoked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheNamespace, CacheResult, RedisPool};

/// Blacklisted token entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistedToken {
    /// Token id (`jti` claim)
    pub token_id: String,

    /// Subject the token belonged to
    pub subject: Uuid,

    /// Revocation reason
    pub reason: String,

    /// When the entry may be evicted
    pub expires_at: DateTime<Utc>,
}

impl BlacklistedToken {
    pub fn new(
        token_id: impl Into<String>,
        subject: Uuid,
        reason: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            subject,
            reason: reason.into(),
            expires_at,
        }
    }

    /// Seconds until the entry expires, clamped to at least one so the
    /// store always gets a positive TTL.
    pub fn ttl_secs(&self) -> u64 {
        let remaining = (self.expires_at - Utc::now()).num_seconds();
        remaining.max(1) as u64
    }
}

/// Token blacklist store
#[derive(Clone)]
pub struct TokenBlacklist {
    pool: RedisPool,

    /// TTL applied when revoking every token of a user (there is no
    /// per-token expiry to inherit in that case)
    default_ttl_secs: u64,
}

impl TokenBlacklist {
    pub fn new(pool: RedisPool, default_ttl_secs: u64) -> Self {
        Self {
            pool,
            default_ttl_secs,
        }
    }

    fn token_key(&self, token_id: &str) -> String {
        CacheNamespace::TokenBlacklist.key(self.pool.key_prefix(), token_id)
    }

    fn user_key(&self, user_id: Uuid) -> String {
        CacheNamespace::TokenBlacklist.key(self.pool.key_prefix(), &format!("user:{}", user_id))
    }

    /// Blacklist a single token until its natural expiry.
    pub async fn blacklist(&self, token: BlacklistedToken) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;

        let key = self.token_key(&token.token_id);
        let data = serde_json::to_vec(&token)
            .map_err(|e| crate::cache::CacheError::SerializationError(e.to_string()))?;
        let ttl = token.ttl_secs();

        conn.set_ex(&key, &data, ttl).await?;

        // Index by subject so a full-user revocation can be audited
        let user_key = self.user_key(token.subject);
        conn.sadd(&user_key, &token.token_id).await?;
        conn.expire(&user_key, ttl as i64).await?;

        info!(
            token_id = %token.token_id,
            subject = %token.subject,
            reason = %token.reason,
            "Token blacklisted"
        );

        Ok(())
    }

    /// Whether a token id is revoked. Store outage counts as revoked.
    pub async fn is_blacklisted(&self, token_id: &str) -> bool {
        match self.lookup(token_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, token_id, "Blacklist unreachable, failing closed");
                true
            }
        }
    }

    async fn lookup(&self, token_id: &str) -> CacheResult<bool> {
        let mut conn = self.pool.get().await?;
        conn.exists(&self.token_key(token_id)).await
    }

    /// Fetch the stored entry, if any.
    pub async fn get(&self, token_id: &str) -> CacheResult<Option<BlacklistedToken>> {
        let mut conn = self.pool.get().await?;

        match conn.get_bytes(&self.token_key(token_id)).await? {
            Some(data) => {
                let token = serde_json::from_slice(&data)
                    .map_err(|e| crate::cache::CacheError::DeserializationError(e.to_string()))?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    /// Mark a whole user as revoked. Individual token ids issued before
    /// this call are rejected through the user-level flag.
    pub async fn blacklist_all_for_user(
        &self,
        user_id: Uuid,
        reason: impl Into<String>,
    ) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let reason = reason.into();

        let key = self.token_key(&format!("user-wide:{}", user_id));
        let entry = BlacklistedToken::new(
            format!("user-wide:{}", user_id),
            user_id,
            reason.clone(),
            Utc::now() + chrono::Duration::seconds(self.default_ttl_secs as i64),
        );
        let data = serde_json::to_vec(&entry)
            .map_err(|e| crate::cache::CacheError::SerializationError(e.to_string()))?;

        conn.set_ex(&key, &data, self.default_ttl_secs).await?;

        info!(user = %user_id, reason = %reason, "All tokens for user blacklisted");

        Ok(())
    }

    /// Whether a user is revoked wholesale. Fails closed like
    /// `is_blacklisted`.
    pub async fn is_user_revoked(&self, user_id: Uuid) -> bool {
        self.is_blacklisted(&format!("user-wide:{}", user_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_clamped_positive() {
        let expired = BlacklistedToken::new(
            "jti-1",
            Uuid::new_v4(),
            "logout",
            Utc::now() - chrono::Duration::hours(1),
        );
        assert_eq!(expired.ttl_secs(), 1);

        let live = BlacklistedToken::new(
            "jti-2",
            Uuid::new_v4(),
            "logout",
            Utc::now() + chrono::Duration::hours(1),
        );
        assert!(live.ttl_secs() > 3500);
    }

    #[tokio::test]
    async fn test_blacklist_roundtrip_against_live_cache() {
        let config = crate::config::CacheConfig {
            max_retries: 1,
            retry_delay_ms: 10,
            ..Default::default()
        };

        if let Ok(pool) = RedisPool::new(config).await {
            let blacklist = TokenBlacklist::new(pool, 60);
            let token_id = format!("jti-{}", Uuid::new_v4());

            assert!(!blacklist.is_blacklisted(&token_id).await);

            blacklist
                .blacklist(BlacklistedToken::new(
                    token_id.clone(),
                    Uuid::new_v4(),
                    "compromised",
                    Utc::now() + chrono::Duration::minutes(5),
                ))
                .await
                .unwrap();

            assert!(blacklist.is_blacklisted(&token_id).await);
            let stored = blacklist.get(&token_id).await.unwrap().unwrap();
            assert_eq!(stored.reason, "compromised");
        }
    }
}
