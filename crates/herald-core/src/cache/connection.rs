//! Redis connection management.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::cache::{CacheError, CacheResult};
use crate::config::CacheConfig;

/// Redis connection pool built on the crate's multiplexed
/// `ConnectionManager`. Handles the initial connect with bounded
/// retries; the manager itself reconnects transparently afterwards.
#[derive(Clone)]
pub struct RedisPool {
    /// Redis client
    client: Arc<RedisClient>,

    /// Multiplexed connection shared by all callers
    manager: Arc<RwLock<Option<ConnectionManager>>>,

    /// Configuration
    config: Arc<CacheConfig>,
}

impl RedisPool {
    /// Create a new Redis pool and establish the initial connection.
    pub async fn new(config: CacheConfig) -> CacheResult<Self> {
        let client = RedisClient::open(config.url.as_str())
            .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

        let pool = Self {
            client: Arc::new(client),
            manager: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
        };

        pool.connect().await?;

        info!(url = %pool.config.url, "Redis pool created");

        Ok(pool)
    }

    /// Get a connection handle.
    pub async fn get(&self) -> CacheResult<RedisConnection> {
        {
            let manager = self.manager.read().await;
            if let Some(manager) = manager.as_ref() {
                return Ok(RedisConnection {
                    manager: manager.clone(),
                    timeout: self.config.operation_timeout(),
                });
            }
        }

        self.connect().await?;

        let manager = self.manager.read().await;
        manager
            .as_ref()
            .map(|m| RedisConnection {
                manager: m.clone(),
                timeout: self.config.operation_timeout(),
            })
            .ok_or_else(|| CacheError::ConnectionError("No connection available".to_string()))
    }

    /// Establish the managed connection, retrying up to the configured
    /// attempt count.
    async fn connect(&self) -> CacheResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(attempt, "Redis connect attempt");

            match ConnectionManager::new((*self.client).clone()).await {
                Ok(manager) => {
                    *self.manager.write().await = Some(manager);
                    info!(attempt, "Redis connected");
                    return Ok(());
                }
                Err(e) => {
                    error!(attempt, error = %e, "Redis connection attempt failed");

                    if attempt >= self.config.max_retries {
                        return Err(CacheError::ConnectionError(format!(
                            "Failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }

                    tokio::time::sleep(self.config.retry_delay()).await;
                }
            }
        }
    }

    /// PING the server; used by the readiness probe.
    pub async fn health_check(&self) -> bool {
        match self.get().await {
            Ok(mut conn) => conn.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    pub fn key_prefix(&self) -> &str {
        &self.config.key_prefix
    }
}

/// Single Redis connection handle. Every operation is clamped to the
/// configured cache deadline.
pub struct RedisConnection {
    manager: ConnectionManager,
    timeout: Duration,
}

impl RedisConnection {
    async fn bounded<T, F>(&self, fut: F) -> CacheResult<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Timeout),
        }
    }

    pub async fn ping(&mut self) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        self.bounded(async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }

    pub async fn get_bytes(&mut self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.get(key).await }).await
    }

    pub async fn get_string(&mut self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.get(key).await }).await
    }

    pub async fn set_ex(&mut self, key: &str, value: &[u8], ttl_secs: u64) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let value = value.to_vec();
        self.bounded(async move { conn.set_ex(key, value, ttl_secs).await })
            .await
    }

    pub async fn del(&mut self, key: &str) -> CacheResult<bool> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let deleted: i64 = self.bounded(async move { conn.del(key).await }).await?;
        Ok(deleted > 0)
    }

    pub async fn exists(&mut self, key: &str) -> CacheResult<bool> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.exists(key).await }).await
    }

    pub async fn incr(&mut self, key: &str) -> CacheResult<i64> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.incr(key, 1i64).await }).await
    }

    pub async fn expire(&mut self, key: &str, ttl_secs: i64) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move {
            conn.expire::<_, i64>(key, ttl_secs).await?;
            Ok(())
        })
        .await
    }

    pub async fn ttl(&mut self, key: &str) -> CacheResult<i64> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.ttl(key).await }).await
    }

    pub async fn sadd(&mut self, key: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let member = member.to_string();
        self.bounded(async move {
            conn.sadd::<_, _, i64>(key, member).await?;
            Ok(())
        })
        .await
    }

    pub async fn smembers(&mut self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.smembers(key).await }).await
    }

    pub async fn rpush(&mut self, key: &str, value: &[u8]) -> CacheResult<i64> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        let value = value.to_vec();
        self.bounded(async move { conn.rpush(key, value).await })
            .await
    }

    pub async fn llen(&mut self, key: &str) -> CacheResult<i64> {
        let mut conn = self.manager.clone();
        let key = key.to_string();
        self.bounded(async move { conn.llen(key).await }).await
    }
}
