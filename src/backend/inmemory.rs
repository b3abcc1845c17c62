//! In-memory cache store (default, thread-safe, async).
//!
//! Uses DashMap for lock-free concurrent access with per-key sharding.
//! Automatically handles TTL expiration on access.

use super::CacheStore;
use crate::error::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// In-memory entry with optional expiration.
struct StoreEntry {
    data: String,
    expires_at: Option<Instant>,
}

impl StoreEntry {
    fn new(data: String, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.map(|d| Instant::now() + d);
        StoreEntry { data, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// Thread-safe async in-memory cache store.
///
/// Expiry is measured on the tokio clock, so tests may drive TTLs with
/// `tokio::time::pause` / `advance`.
///
/// # Example
///
/// ```no_run
/// use cache_shield::backend::{CacheStore, InMemoryStore};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     store.set("key1", "value".to_string(), None).await?;
///     assert_eq!(store.get("key1").await?, Some("value".to_string()));
///
///     store.set("key2", String::new(), Some(Duration::from_secs(60))).await?;
///     assert_eq!(store.get("key2").await?, Some(String::new()));
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    store: Arc<DashMap<String, StoreEntry>>,
}

impl InMemoryStore {
    /// Create a new in-memory cache store.
    pub fn new() -> Self {
        InMemoryStore {
            store: Arc::new(DashMap::new()),
        }
    }

    /// Get the current number of entries, including not-yet-evicted expired ones.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Remaining TTL of `key`, if it is present and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.store
            .get(key)
            .and_then(|entry| entry.expires_at)
            .map(|exp| exp.saturating_duration_since(Instant::now()))
    }

    /// Get memory statistics.
    pub fn stats(&self) -> StoreStats {
        let total_bytes: usize = self.store.iter().map(|entry| entry.data.len()).sum();
        let expired_count = self.store.iter().filter(|entry| entry.is_expired()).count();
        let tombstones = self
            .store
            .iter()
            .filter(|entry| entry.data.is_empty() && !entry.is_expired())
            .count();

        StoreStats {
            total_entries: self.store.len(),
            expired_entries: expired_count,
            tombstones,
            total_bytes,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.store.get(key) {
            if !entry.is_expired() {
                debug!("✓ InMemory GET {} -> HIT", key);
                return Ok(Some(entry.data.clone()));
            }
        }

        self.store.remove_if(key, |_, entry| entry.is_expired());
        debug!("✓ InMemory GET {} -> MISS", key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        let entry = StoreEntry::new(value, ttl);
        self.store.insert(key.to_string(), entry);

        if let Some(d) = ttl {
            debug!("✓ InMemory SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ InMemory SET {}", key);
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.store.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if let Some(entry) = self.store.get(key) {
            return Ok(!entry.is_expired());
        }

        Ok(false)
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn clear_all(&self) -> Result<()> {
        self.store.clear();
        warn!("⚠ InMemory CLEAR_ALL executed - all cache cleared!");
        Ok(())
    }
}

/// Store statistics.
#[derive(Clone, Debug)]
pub struct StoreStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub tombstones: usize,
    pub total_bytes: usize,
}
