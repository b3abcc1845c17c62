//! Memcached cache store implementation.

use super::CacheStore;
use crate::error::{Error, Result};
use async_memcached::AsciiProtocol;
use deadpool_memcached::{Manager, Pool};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Default Memcached connection pool size.
/// Override with MEMCACHED_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Memcached reads expirations above 30 days as absolute unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Configuration for Memcached store.
#[derive(Clone, Debug)]
pub struct MemcachedConfig {
    pub servers: Vec<String>, // e.g., ["localhost:11211", "cache2:11211"]
    pub connection_timeout: Duration,
    pub pool_size: u32,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        MemcachedConfig {
            servers: vec!["localhost:11211".to_string()],
            connection_timeout: Duration::from_secs(5),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Memcached store with connection pooling.
///
/// Memcached has no compare-and-delete primitive suitable for lock release,
/// so pair it with [`crate::lock::RedisLock`] or a lock service of your own
/// when running more than one process.
///
/// # Example
///
/// ```no_run
/// # use cache_shield::backend::{CacheStore, MemcachedConfig, MemcachedStore};
/// # use cache_shield::error::Result;
/// # async fn example() -> Result<()> {
/// let store = MemcachedStore::new(MemcachedConfig::default()).await?;
/// store.set("key", "value".to_string(), None).await?;
/// let value = store.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct MemcachedStore {
    pool: Pool,
}

impl MemcachedStore {
    /// Create new Memcached store from configuration.
    ///
    /// # Errors
    /// Returns `Err` if no server is configured or pool creation fails
    pub async fn new(config: MemcachedConfig) -> Result<Self> {
        // deadpool-memcached Manager takes a single server address
        let addr = config
            .servers
            .first()
            .ok_or_else(|| Error::ConfigError("No memcached servers specified".to_string()))?
            .clone();

        let manager = Manager::new(addr.clone());

        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| Error::ConfigError(format!("Failed to create connection pool: {}", e)))?;

        info!(
            "✓ Memcached store initialized with server: {} (pool size: {})",
            addr, config.pool_size
        );

        Ok(MemcachedStore { pool })
    }

    /// Create from server address directly.
    ///
    /// Pool size is determined by:
    /// 1. `MEMCACHED_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if connection pool creation fails
    pub async fn from_server(addr: String) -> Result<Self> {
        let pool_size = std::env::var("MEMCACHED_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let config = MemcachedConfig {
            servers: vec![addr],
            pool_size,
            ..Default::default()
        };
        Self::new(config).await
    }
}

/// Memcached expiration for `ttl`, in whole seconds (minimum 1).
fn expiration_for(ttl: Duration) -> i64 {
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    let secs = secs.max(1);
    if secs <= MAX_RELATIVE_EXPIRATION {
        return secs as i64;
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    now.saturating_add(secs) as i64
}

fn command_error(command: &str, key: &str, e: impl std::fmt::Display) -> Error {
    Error::BackendError(format!("Memcached {} failed for key {}: {}", command, key, e))
}

impl MemcachedStore {
    async fn connection(&self) -> Result<deadpool_memcached::Object> {
        self.pool.get().await.map_err(|e| {
            Error::BackendError(format!("Failed to get Memcached connection: {}", e))
        })
    }
}

impl CacheStore for MemcachedStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value = conn
            .get(key)
            .await
            .map_err(|e| command_error("GET", key, e))?;

        let Some(value) = value else {
            trace!("Memcached GET {} -> MISS", key);
            return Ok(None);
        };
        trace!("Memcached GET {} -> HIT", key);

        // A hit with no data is the empty tombstone.
        String::from_utf8(value.data.unwrap_or_default())
            .map(Some)
            .map_err(|e| {
                Error::DeserializationError(format!(
                    "Memcached value for key {} is not UTF-8: {}",
                    key, e
                ))
            })
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection().await?;

        // Parameter order: set(key, value, ttl, flags)
        conn.set(key, value.as_bytes(), ttl.map(expiration_for), None)
            .await
            .map_err(|e| command_error("SET", key, e))?;

        trace!("Memcached SET {} (TTL: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.delete(key)
            .await
            .map_err(|e| command_error("DELETE", key, e))
    }

    async fn health_check(&self) -> Result<bool> {
        let Ok(mut conn) = self.pool.get().await else {
            return Ok(false);
        };
        Ok(conn.get("__health_check__").await.is_ok())
    }

    async fn clear_all(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        conn.flush_all()
            .await
            .map_err(|e| Error::BackendError(format!("Memcached FLUSH_ALL failed: {}", e)))?;

        warn!("⚠ Memcached FLUSH_ALL executed - all cache cleared!");
        Ok(())
    }
}
