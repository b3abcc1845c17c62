//! Cache store implementations.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;

pub mod inmemory;
#[cfg(feature = "memcached")]
pub mod memcached;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryStore;
#[cfg(feature = "memcached")]
pub use memcached::{MemcachedConfig, MemcachedStore};
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisConfig, RedisStore};

/// Trait for the remote key-value store the engine reads through.
///
/// Values are strings. Implementations **must** keep an empty string
/// distinct from an absent key: the engine uses `Some("")` as its
/// negative-cache tombstone.
///
/// **IMPORTANT:** All methods use `&self` so the store can be shared by
/// concurrent callers and the background rebuild workers. Implementations
/// should use interior mutability or an external connection pool.
///
/// **ASYNC:** Every returned future is `Send`, because rebuilds run them on
/// the task executor. Implementations may still be written as `async fn`.
pub trait CacheStore: Send + Sync + Clone + 'static {
    /// Retrieve the value stored at `key`.
    ///
    /// # Returns
    /// - `Ok(Some(value))` - Key present (possibly the empty tombstone)
    /// - `Ok(None)` - Key absent
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs (connection lost, etc.)
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

    /// Store `value` at `key` with optional TTL.
    ///
    /// # Arguments
    /// - `key`: Cache key
    /// - `value`: Encoded value
    /// - `ttl`: Time-to-live. None = no expiry
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn set(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove the value stored at `key`.
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if key exists (optional optimization).
    ///
    /// # Errors
    /// Returns `Err` if backend error occurs
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Health check - verify the store is reachable.
    ///
    /// # Errors
    /// Returns `Err` if the store is not accessible
    fn health_check(&self) -> impl Future<Output = Result<bool>> + Send {
        async { Ok(true) }
    }

    /// Optional: Clear every key (use with caution).
    ///
    /// # Errors
    /// Returns `Err` if operation is not implemented or fails
    fn clear_all(&self) -> impl Future<Output = Result<()>> + Send {
        async {
            Err(crate::error::Error::NotImplemented(
                "clear_all not implemented for this store".to_string(),
            ))
        }
    }
}
