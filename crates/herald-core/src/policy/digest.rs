//! Digest buffers.
//!
//! Notifications withheld by a digest frequency are appended to a
//! Redis list keyed by `(user, category, bucket)`, where the bucket is
//! the truncated start of the current digest period. Only the decision
//! to defer is contractual; the emit side drains these buckets.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{CacheNamespace, CacheResult, RedisPool};
use crate::notification::Channel;
use crate::repository::DeliveryFrequency;

/// One withheld delivery inside a digest bucket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestEntry {
    pub notification_id: Uuid,
    pub channel: Channel,
    pub queued_at: chrono::DateTime<Utc>,
}

/// Redis-backed digest buffer
#[derive(Clone)]
pub struct DigestBuffer {
    pool: RedisPool,
}

impl DigestBuffer {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    fn bucket_key(&self, user_id: Uuid, category: &str, bucket_start: i64) -> String {
        CacheNamespace::Digest.key(
            self.pool.key_prefix(),
            &format!("{}:{}:{}", user_id, category, bucket_start),
        )
    }

    /// Append a withheld delivery to the current bucket.
    pub async fn append(
        &self,
        user_id: Uuid,
        category: &str,
        frequency: DeliveryFrequency,
        notification_id: Uuid,
        channel: Channel,
    ) -> crate::Result<()> {
        let Some(bucket_secs) = frequency.bucket_secs() else {
            return Ok(());
        };

        let now = Utc::now().timestamp();
        let bucket_start = now - now.rem_euclid(bucket_secs);
        let key = self.bucket_key(user_id, category, bucket_start);

        let entry = DigestEntry {
            notification_id,
            channel,
            queued_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let mut conn = self.pool.get().await.map_err(crate::Error::from)?;
        conn.rpush(&key, &bytes).await.map_err(crate::Error::from)?;
        // Keep the bucket around one extra period for the emitter
        conn.expire(&key, bucket_secs * 2)
            .await
            .map_err(crate::Error::from)?;

        Ok(())
    }

    /// Number of entries waiting in the current bucket.
    pub async fn pending(
        &self,
        user_id: Uuid,
        category: &str,
        frequency: DeliveryFrequency,
    ) -> CacheResult<i64> {
        let Some(bucket_secs) = frequency.bucket_secs() else {
            return Ok(0);
        };

        let now = Utc::now().timestamp();
        let bucket_start = now - now.rem_euclid(bucket_secs);
        let key = self.bucket_key(user_id, category, bucket_start);

        let mut conn = self.pool.get().await?;
        conn.llen(&key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_entry_serializes() {
        let entry = DigestEntry {
            notification_id: Uuid::new_v4(),
            channel: Channel::Email,
            queued_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry).unwrap();
        let back: DigestEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.notification_id, entry.notification_id);
        assert_eq!(back.channel, Channel::Email);
    }
}
