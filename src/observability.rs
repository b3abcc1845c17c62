//! Metrics hooks for cache-aside operations.
//!
//! Implement [`CacheMetrics`] to feed cache behaviour into your monitoring
//! system:
//!
//! ```ignore
//! use cache_shield::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         // counter!("cache_hits").inc();
//!     }
//!     fn record_lock_contention(&self, _key: &str) {
//!         // counter!("cache_lock_contention").inc();
//!     }
//!     // ... other hooks keep their defaults
//! }
//!
//! // let engine = CacheAsideEngine::new(store, lock, config)?
//! //     .with_metrics(Arc::new(PrometheusMetrics));
//! ```
//!
//! Every hook has a default that logs at `debug!` (errors at `warn!`).
//! [`NoOpMetrics`] silences them; [`CounterMetrics`] counts them.
//!
//! # Hooks
//!
//! - `record_hit()` - Value served from the store
//! - `record_miss()` - Key absent from the store
//! - `record_null_hit()` - Tombstone served; the loader was not called
//! - `record_load()` - Loader invoked, with its duration
//! - `record_stale()` - Logically expired value returned while a rebuild is scheduled
//! - `record_rebuild()` - Background rebuild wrote a fresh entry
//! - `record_lock_contention()` - Rebuild lock was held by someone else
//! - `record_error()` - Operation failure with error message

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Trait for cache metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a cache hit.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Record a cache miss.
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Record a tombstone hit.
    fn record_null_hit(&self, key: &str) {
        debug!("Cache NULL HIT: {}", key);
    }

    /// Record a loader invocation.
    fn record_load(&self, key: &str, duration: Duration) {
        debug!("Cache LOAD: {} took {:?}", key, duration);
    }

    /// Record a stale read under logical expiry.
    fn record_stale(&self, key: &str) {
        debug!("Cache STALE: {}", key);
    }

    /// Record a completed background rebuild.
    fn record_rebuild(&self, key: &str, duration: Duration) {
        debug!("Cache REBUILD: {} took {:?}", key, duration);
    }

    /// Record a failed lock acquisition.
    fn record_lock_contention(&self, key: &str) {
        debug!("Cache LOCK CONTENDED: {}", key);
    }

    /// Record an error.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_null_hit(&self, _key: &str) {}
    fn record_load(&self, _key: &str, _duration: Duration) {}
    fn record_stale(&self, _key: &str) {}
    fn record_rebuild(&self, _key: &str, _duration: Duration) {}
    fn record_lock_contention(&self, _key: &str) {}
    fn record_error(&self, _key: &str, _error: &str) {}
}

/// Metrics implementation that counts each hook.
#[derive(Default)]
pub struct CounterMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    null_hits: AtomicU64,
    loads: AtomicU64,
    stale_reads: AtomicU64,
    rebuilds: AtomicU64,
    lock_contentions: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub null_hits: u64,
    pub loads: u64,
    pub stale_reads: u64,
    pub rebuilds: u64,
    pub lock_contentions: u64,
    pub errors: u64,
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            null_hits: self.null_hits.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            stale_reads: self.stale_reads.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            lock_contentions: self.lock_contentions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

impl CacheMetrics for CounterMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, _key: &str, _duration: Duration) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_null_hit(&self, _key: &str) {
        self.null_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_load(&self, _key: &str, _duration: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_stale(&self, _key: &str) {
        self.stale_reads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_rebuild(&self, _key: &str, _duration: Duration) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    fn record_lock_contention(&self, _key: &str) {
        self.lock_contentions.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, _key: &str, _error: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}
