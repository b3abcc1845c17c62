//! High-level cache service for web applications.
//!
//! Provides a convenient wrapper around CacheAsideEngine with Arc for easy sharing.

use crate::backend::{CacheStore, InMemoryStore};
use crate::engine::{CacheAsideEngine, EngineConfig};
use crate::error::Result;
use crate::lock::{InMemoryLock, LockService};
use crate::observability::CacheMetrics;
use std::ops::Deref;
use std::sync::Arc;

/// High-level cache service for web applications.
///
/// Wraps `CacheAsideEngine` in `Arc` so request handlers can share one
/// engine (and its rebuild executor) without an extra `Arc<Mutex<>>`.
/// Every query method of the engine is reachable through `Deref`.
///
/// # Example
///
/// ```
/// use cache_shield::{CacheService, Result};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let cache = CacheService::in_memory()?;
///
/// // In your web service struct
/// let handler_cache = cache.clone(); // Cheap - just Arc increment
/// let greeting: Option<String> = handler_cache
///     .query_with_pass_through_without_args(
///         "greeting",
///         || async { Ok(Some("hello".to_string())) },
///         Duration::from_secs(60),
///     )
///     .await?;
/// assert_eq!(greeting.as_deref(), Some("hello"));
///
/// cache.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CacheService<S: CacheStore, L: LockService> {
    engine: Arc<CacheAsideEngine<S, L>>,
}

impl<S: CacheStore, L: LockService> Clone for CacheService<S, L> {
    fn clone(&self) -> Self {
        CacheService {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<S: CacheStore, L: LockService> CacheService<S, L> {
    /// Create a new cache service over `store` and `lock`.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if `config` is invalid or no tokio
    /// runtime is running
    pub fn new(store: S, lock: L, config: EngineConfig) -> Result<Self> {
        Ok(Self::from_engine(CacheAsideEngine::new(store, lock, config)?))
    }

    /// Create a new cache service with custom metrics.
    ///
    /// # Errors
    /// As [`CacheService::new`]
    pub fn with_metrics(
        store: S,
        lock: L,
        config: EngineConfig,
        metrics: Arc<dyn CacheMetrics>,
    ) -> Result<Self> {
        let engine = CacheAsideEngine::new(store, lock, config)?.with_metrics(metrics);
        Ok(Self::from_engine(engine))
    }

    /// Wrap an already configured engine.
    pub fn from_engine(engine: CacheAsideEngine<S, L>) -> Self {
        CacheService {
            engine: Arc::new(engine),
        }
    }

    /// Get a reference to the underlying engine.
    pub fn engine(&self) -> &CacheAsideEngine<S, L> {
        &self.engine
    }

    /// Drain and stop the shared rebuild executor.
    ///
    /// Affects every clone of this service.
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}

impl CacheService<InMemoryStore, InMemoryLock> {
    /// Process-local service with default configuration.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if no tokio runtime is running
    pub fn in_memory() -> Result<Self> {
        Self::new(
            InMemoryStore::new(),
            InMemoryLock::new(),
            EngineConfig::default(),
        )
    }
}

impl<S: CacheStore, L: LockService> Deref for CacheService<S, L> {
    type Target = CacheAsideEngine<S, L>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}
