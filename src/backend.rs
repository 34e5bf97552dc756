//! Key-value backends for [`IndexedStore`](crate::IndexedStore)
//!
//! The store only needs per-key atomicity: single-key get, set and delete,
//! plus a prefix count used for sizing. Two implementations are provided:
//! - [`MemoryBackend`]: in-process Moka cache, optionally with TTL
//! - [`RedisBackend`]: shared Redis instance via a connection manager

use async_trait::async_trait;
use moka::future::Cache;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{debug, warn};

use crate::StoreError;

/// Namespaced string key-value capability.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Number of keys starting with `prefix`
    async fn count(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Restart the expiry clock of a key, if the backend expires keys.
    async fn touch(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }

    /// Connection upkeep. Backends without any simply never return.
    async fn run(&self) -> Result<(), StoreError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// In-memory backend built on a Moka cache
#[derive(Clone)]
pub struct MemoryBackend {
    entries: Cache<String, String>,
}

impl MemoryBackend {
    /// Unbounded backend without expiry
    pub fn new() -> Self {
        Self {
            entries: Cache::builder().build(),
        }
    }

    /// Backend whose entries expire `ttl` after their last write or touch
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder().time_to_live(ttl).build(),
        }
    }

    /// Backend bounded to `max_capacity` entries, with optional expiry
    pub fn with_capacity(max_capacity: u64, ttl: Option<Duration>) -> Self {
        let builder = Cache::builder().max_capacity(max_capacity);
        let entries = match ttl {
            Some(ttl) => builder.time_to_live(ttl).build(),
            None => builder.build(),
        };
        Self { entries }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.get(key).await)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.entries.insert(key.to_owned(), value).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.invalidate(key).await;
        Ok(())
    }

    async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .count())
    }

    async fn touch(&self, key: &str) -> Result<(), StoreError> {
        // Moka measures TTL from the last insert, so re-inserting restarts it
        if let Some(value) = self.entries.get(key).await {
            self.entries.insert(key.to_owned(), value).await;
        }
        Ok(())
    }
}

/// Redis backend sharing one auto-reconnecting connection manager.
#[derive(Clone)]
pub struct RedisBackend {
    redis: redis::aio::ConnectionManager,
    ttl: Option<Duration>,
    health_interval: Duration,
}

impl RedisBackend {
    /// Connect to Redis. With `ttl` set every write uses `SET EX`.
    pub async fn new(
        redis_client: redis::Client,
        ttl: Option<Duration>,
    ) -> Result<Self, redis::RedisError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self {
            redis,
            ttl,
            health_interval: Duration::from_secs(30),
        })
    }

    /// Interval between PING health checks in [`KeyValueStore::run`]
    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval;
        self
    }

    fn ttl_seconds(&self) -> Option<u64> {
        self.ttl.map(|ttl| ttl.as_secs().max(1))
    }
}

#[async_trait]
impl KeyValueStore for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        match self.ttl_seconds() {
            Some(seconds) => conn.set_ex::<_, _, ()>(key, value, seconds).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn count(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{prefix}*");
        let mut cursor = 0u64;
        let mut total = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;
            total += keys.len();
            if next == 0 {
                return Ok(total);
            }
            cursor = next;
        }
    }

    async fn touch(&self, key: &str) -> Result<(), StoreError> {
        if let Some(seconds) = self.ttl_seconds() {
            let mut conn = self.redis.clone();
            conn.expire::<_, ()>(key, seconds as i64).await?;
        }
        Ok(())
    }

    async fn run(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        loop {
            tokio::time::sleep(self.health_interval).await;
            match redis::cmd("PING").query_async::<String>(&mut conn).await {
                Ok(_) => debug!("RedisBackend: health check ok"),
                Err(e) => {
                    warn!("RedisBackend: PING failed ({})", e);
                    return Err(e.into());
                }
            }
        }
    }
}
