//! Cache-aside engine - the read strategies and their rebuild protocol.

use crate::backend::CacheStore;
use crate::error::{Error, Result};
use crate::executor::{ExecutorConfig, ExecutorStats, TaskExecutor};
use crate::key::{CacheKeyBuilder, LOCK_SUFFIX};
use crate::loader::{self, BoundLoader, Loader, Supplier};
use crate::lock::{LockGuard, LockService};
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::serialization::{self, is_tombstone, Encoded, LogicalEntry, TOMBSTONE};
use crate::strategy::CacheStrategy;
use crate::value::{CacheValue, Shape};
use futures::FutureExt;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Negative-cache TTL for tombstones.
pub const DEFAULT_NULL_TTL: Duration = Duration::from_secs(60);

/// Bounded wait for the rebuild lock.
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(2000);

/// Sleep between retries on lock contention and logical-expiry cold start.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Retry cap for the mutex and logical-expiry loops.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 100;

/// Engine configuration.
///
/// # Example
///
/// ```
/// use cache_shield::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_null_ttl(Duration::from_secs(30))
///     .with_max_attempts(20);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// TTL of the tombstone written when the loader finds nothing.
    pub null_ttl: Duration,
    /// Appended to a cache key to form its lock key.
    pub lock_suffix: String,
    /// How long a caller waits for the rebuild lock before backing off.
    pub lock_wait: Duration,
    /// Sleep between retries.
    pub retry_delay: Duration,
    /// Attempts before a retry loop gives up with `Error::RetryExhausted`.
    pub max_attempts: u32,
    /// Sizing of the background rebuild executor.
    pub executor: ExecutorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            null_ttl: DEFAULT_NULL_TTL,
            lock_suffix: LOCK_SUFFIX.to_string(),
            lock_wait: DEFAULT_LOCK_WAIT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            executor: ExecutorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_null_ttl(mut self, null_ttl: Duration) -> Self {
        self.null_ttl = null_ttl;
        self
    }

    pub fn with_lock_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.lock_suffix = suffix.into();
        self
    }

    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` for a zero attempt cap, an empty lock
    /// suffix or an invalid executor sizing
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::ConfigError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.lock_suffix.is_empty() {
            return Err(Error::ConfigError(
                "lock_suffix must not be empty".to_string(),
            ));
        }
        self.executor.validate()
    }
}

// ============================================================================
// Value forms
// ============================================================================

/// How a strategy encodes, decodes and judges its loader's result.
trait Form: 'static {
    type Output: Send + Sync + 'static;

    fn decode_stored(stored: &str) -> Result<Option<Self::Output>>;
    fn encode_value(value: &Self::Output) -> Result<String>;
    /// Results that are cached as a tombstone rather than stored.
    fn is_empty_result(value: &Self::Output) -> bool;
    fn from_entry(entry: &LogicalEntry) -> Result<Option<Self::Output>>;
    fn to_entry(value: &Self::Output, logical_ttl: Duration) -> Result<LogicalEntry>;
}

struct Single<T>(PhantomData<fn() -> T>);

impl<T: CacheValue> Form for Single<T> {
    type Output = T;

    fn decode_stored(stored: &str) -> Result<Option<T>> {
        serialization::decode(stored)
    }

    fn encode_value(value: &T) -> Result<String> {
        serialization::encode(value).map(Encoded::into_string)
    }

    /// A scalar that encodes to the tombstone (the empty string) cannot be
    /// told apart from one once stored.
    fn is_empty_result(value: &T) -> bool {
        T::SHAPE == Shape::Scalar
            && serialization::encode(value).is_ok_and(|encoded| is_tombstone(encoded.as_str()))
    }

    fn from_entry(entry: &LogicalEntry) -> Result<Option<T>> {
        entry.payload()
    }

    fn to_entry(value: &T, logical_ttl: Duration) -> Result<LogicalEntry> {
        LogicalEntry::wrap(value, logical_ttl)
    }
}

struct List<T>(PhantomData<fn() -> T>);

impl<T: CacheValue> Form for List<T> {
    type Output = Vec<T>;

    fn decode_stored(stored: &str) -> Result<Option<Vec<T>>> {
        serialization::decode_list(stored)
    }

    fn encode_value(value: &Vec<T>) -> Result<String> {
        serialization::encode_list(value).map(Encoded::into_string)
    }

    fn is_empty_result(value: &Vec<T>) -> bool {
        value.is_empty()
    }

    fn from_entry(entry: &LogicalEntry) -> Result<Option<Vec<T>>> {
        entry.payload_list()
    }

    fn to_entry(value: &Vec<T>, logical_ttl: Duration) -> Result<LogicalEntry> {
        LogicalEntry::wrap(value.as_slice(), logical_ttl)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Cache-aside engine.
///
/// Reads go through one of three strategies (see [`CacheStrategy`]); each
/// has an id-keyed and an argument-less form, for single values and for
/// lists. Logical-expiry rebuilds run on a bounded executor owned by the
/// engine; call [`CacheAsideEngine::shutdown`] to drain it.
///
/// # Example
///
/// ```
/// use cache_shield::{CacheAsideEngine, EngineConfig, Result};
/// use cache_shield::backend::InMemoryStore;
/// use cache_shield::lock::InMemoryLock;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<()> {
/// let engine = CacheAsideEngine::new(
///     InMemoryStore::new(),
///     InMemoryLock::new(),
///     EngineConfig::default(),
/// )?;
///
/// let name = engine
///     .query_with_pass_through(
///         "user:",
///         7u64,
///         |id: u64| async move { Ok(Some(format!("user-{}", id))) },
///         Duration::from_secs(300),
///     )
///     .await?;
/// assert_eq!(name.as_deref(), Some("user-7"));
///
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct CacheAsideEngine<S: CacheStore, L: LockService> {
    store: S,
    lock: L,
    config: EngineConfig,
    metrics: Arc<dyn CacheMetrics>,
    executor: TaskExecutor,
}

impl<S: CacheStore, L: LockService> CacheAsideEngine<S, L> {
    /// Create an engine and start its rebuild executor.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if `config` is invalid or no tokio
    /// runtime is running
    pub fn new(store: S, lock: L, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let executor = TaskExecutor::new(config.executor.clone())?;

        Ok(CacheAsideEngine {
            store,
            lock,
            config,
            metrics: Arc::new(NoOpMetrics),
            executor,
        })
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get store reference (for advanced use).
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get lock service reference (for advanced use).
    pub fn lock_service(&self) -> &L {
        &self.lock
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Counters of the rebuild executor.
    pub fn executor_stats(&self) -> ExecutorStats {
        self.executor.stats()
    }

    /// Stop the rebuild executor after draining queued rebuilds.
    ///
    /// Rebuilds scheduled afterwards run on the calling task.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }

    // ------------------------------------------------------------------------
    // Pass-through
    // ------------------------------------------------------------------------

    /// Read `prefix ++ id`, loading on a miss and negative-caching absence.
    ///
    /// A tombstone left by an earlier miss answers `None` without calling
    /// the loader until it expires after `null_ttl`. Concurrent misses are
    /// not deduplicated.
    ///
    /// # Errors
    /// Returns `Err` if the store or the loader fails, or if the stored
    /// value does not decode as `R`
    pub async fn query_with_pass_through<I, R, F>(
        &self,
        prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, R>,
    {
        let key = CacheKeyBuilder::build(prefix, Some(&id))?;
        let result = self
            .pass_through::<Single<R>>(&key, loader::bind(loader, id), ttl)
            .await;
        self.observe(&key, result)
    }

    /// List form of [`Self::query_with_pass_through`].
    ///
    /// An empty list from the loader is negative-cached like `None`.
    ///
    /// # Errors
    /// As [`Self::query_with_pass_through`]
    pub async fn query_with_pass_through_list<I, R, F>(
        &self,
        prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<Vec<R>>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, Vec<R>>,
    {
        let key = CacheKeyBuilder::build(prefix, Some(&id))?;
        let result = self
            .pass_through::<List<R>>(&key, loader::bind(loader, id), ttl)
            .await;
        self.observe(&key, result)
    }

    /// Pass-through read of the fixed key `prefix`.
    ///
    /// # Errors
    /// As [`Self::query_with_pass_through`]
    pub async fn query_with_pass_through_without_args<R, F>(
        &self,
        prefix: &str,
        supplier: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: CacheValue,
        F: Supplier<R>,
    {
        let result = self
            .pass_through::<Single<R>>(prefix, loader::bind_supplier(supplier), ttl)
            .await;
        self.observe(prefix, result)
    }

    /// List form of [`Self::query_with_pass_through_without_args`].
    ///
    /// # Errors
    /// As [`Self::query_with_pass_through`]
    pub async fn query_with_pass_through_list_without_args<R, F>(
        &self,
        prefix: &str,
        supplier: F,
        ttl: Duration,
    ) -> Result<Option<Vec<R>>>
    where
        R: CacheValue,
        F: Supplier<Vec<R>>,
    {
        let result = self
            .pass_through::<List<R>>(prefix, loader::bind_supplier(supplier), ttl)
            .await;
        self.observe(prefix, result)
    }

    // ------------------------------------------------------------------------
    // Logical expiry
    // ------------------------------------------------------------------------

    /// Read `prefix ++ id` stored with a logical expiry.
    ///
    /// A fresh entry is returned as is. A stale entry is returned
    /// immediately while one background rebuild refreshes it. A missing
    /// entry schedules a rebuild and polls every `retry_delay` until it
    /// appears, giving up after `max_attempts`. A new rebuild is scheduled
    /// only once the previous one from this call has finished.
    ///
    /// Loader failures during a rebuild are logged and leave the stale entry
    /// in place; they never reach the caller.
    ///
    /// # Errors
    /// Returns `Error::RetryExhausted` if a missing entry is never seeded,
    /// `Error::DeserializationError` if the stored envelope or its payload
    /// is malformed, or `Err` if the store fails.
    ///
    /// A rebuild writes nothing when the loader reports no data (`None`, an
    /// empty list, or an empty string), and no tombstone is kept for this
    /// strategy. A cold-start read of such a key therefore polls for
    /// `max_attempts * retry_delay` and then returns
    /// `Error::RetryExhausted`. Seed keys that may be absent with
    /// [`Self::set_with_logical_expire`], or read them with another strategy.
    pub async fn query_with_logical_expire<I, R, F>(
        &self,
        prefix: &str,
        id: I,
        loader: F,
        logical_ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, R>,
    {
        let key = CacheKeyBuilder::build(prefix, Some(&id))?;
        let result = self
            .logical_expire::<Single<R>>(&key, loader::bind(loader, id), logical_ttl)
            .await;
        self.observe(&key, result)
    }

    /// List form of [`Self::query_with_logical_expire`].
    ///
    /// # Errors
    /// As [`Self::query_with_logical_expire`]
    pub async fn query_with_logical_expire_list<I, R, F>(
        &self,
        prefix: &str,
        id: I,
        loader: F,
        logical_ttl: Duration,
    ) -> Result<Option<Vec<R>>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, Vec<R>>,
    {
        let key = CacheKeyBuilder::build(prefix, Some(&id))?;
        let result = self
            .logical_expire::<List<R>>(&key, loader::bind(loader, id), logical_ttl)
            .await;
        self.observe(&key, result)
    }

    /// Logical-expiry read of the fixed key `prefix`.
    ///
    /// # Errors
    /// As [`Self::query_with_logical_expire`]
    pub async fn query_with_logical_expire_without_args<R, F>(
        &self,
        prefix: &str,
        supplier: F,
        logical_ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: CacheValue,
        F: Supplier<R>,
    {
        let result = self
            .logical_expire::<Single<R>>(prefix, loader::bind_supplier(supplier), logical_ttl)
            .await;
        self.observe(prefix, result)
    }

    /// List form of [`Self::query_with_logical_expire_without_args`].
    ///
    /// # Errors
    /// As [`Self::query_with_logical_expire`]
    pub async fn query_with_logical_expire_list_without_args<R, F>(
        &self,
        prefix: &str,
        supplier: F,
        logical_ttl: Duration,
    ) -> Result<Option<Vec<R>>>
    where
        R: CacheValue,
        F: Supplier<Vec<R>>,
    {
        let result = self
            .logical_expire::<List<R>>(prefix, loader::bind_supplier(supplier), logical_ttl)
            .await;
        self.observe(prefix, result)
    }

    // ------------------------------------------------------------------------
    // Mutex
    // ------------------------------------------------------------------------

    /// Read `prefix ++ id`, letting one caller at a time load a missing key.
    ///
    /// The lock holder re-checks the store before loading, so callers that
    /// queued behind it return its result without loading again. Callers
    /// that cannot get the lock within `lock_wait` sleep `retry_delay` and
    /// start over, up to `max_attempts` times.
    ///
    /// # Errors
    /// Returns `Error::RetryExhausted` under sustained contention, or `Err`
    /// if the store, the lock service or the loader fails
    pub async fn query_with_mutex<I, R, F>(
        &self,
        prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, R>,
    {
        let key = CacheKeyBuilder::build(prefix, Some(&id))?;
        let result = self
            .mutex::<Single<R>>(&key, loader::bind(loader, id), ttl)
            .await;
        self.observe(&key, result)
    }

    /// List form of [`Self::query_with_mutex`].
    ///
    /// # Errors
    /// As [`Self::query_with_mutex`]
    pub async fn query_with_mutex_list<I, R, F>(
        &self,
        prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<Vec<R>>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, Vec<R>>,
    {
        let key = CacheKeyBuilder::build(prefix, Some(&id))?;
        let result = self
            .mutex::<List<R>>(&key, loader::bind(loader, id), ttl)
            .await;
        self.observe(&key, result)
    }

    /// Mutex read of the fixed key `prefix`.
    ///
    /// # Errors
    /// As [`Self::query_with_mutex`]
    pub async fn query_with_mutex_without_args<R, F>(
        &self,
        prefix: &str,
        supplier: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        R: CacheValue,
        F: Supplier<R>,
    {
        let result = self
            .mutex::<Single<R>>(prefix, loader::bind_supplier(supplier), ttl)
            .await;
        self.observe(prefix, result)
    }

    /// List form of [`Self::query_with_mutex_without_args`].
    ///
    /// # Errors
    /// As [`Self::query_with_mutex`]
    pub async fn query_with_mutex_list_without_args<R, F>(
        &self,
        prefix: &str,
        supplier: F,
        ttl: Duration,
    ) -> Result<Option<Vec<R>>>
    where
        R: CacheValue,
        F: Supplier<Vec<R>>,
    {
        let result = self
            .mutex::<List<R>>(prefix, loader::bind_supplier(supplier), ttl)
            .await;
        self.observe(prefix, result)
    }

    // ------------------------------------------------------------------------
    // Dispatcher and direct access
    // ------------------------------------------------------------------------

    /// Read `prefix ++ id` with a strategy chosen at runtime.
    ///
    /// `ttl` is the physical TTL for pass-through and mutex and the logical
    /// TTL for logical expiry.
    ///
    /// # Errors
    /// As the selected strategy
    pub async fn query<I, R, F>(
        &self,
        strategy: CacheStrategy,
        prefix: &str,
        id: I,
        loader: F,
        ttl: Duration,
    ) -> Result<Option<R>>
    where
        I: Serialize + Clone + Send + Sync + 'static,
        R: CacheValue,
        F: Loader<I, R>,
    {
        debug!("» Cache query for {} (strategy: {})", prefix, strategy);
        match strategy {
            CacheStrategy::PassThrough => {
                self.query_with_pass_through(prefix, id, loader, ttl).await
            }
            CacheStrategy::LogicalExpire => {
                self.query_with_logical_expire(prefix, id, loader, ttl)
                    .await
            }
            CacheStrategy::Mutex => self.query_with_mutex(prefix, id, loader, ttl).await,
        }
    }

    /// Store `value` under `key` with no TTL.
    ///
    /// # Errors
    /// Returns `Err` if encoding or the store fails
    pub async fn set<T: CacheValue>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serialization::encode(value)?;
        self.store.set(key, encoded.into_string(), None).await
    }

    /// Store `value` under `key`, evicted after `ttl`.
    ///
    /// # Errors
    /// Returns `Err` if encoding or the store fails
    pub async fn set_with_ttl<T: CacheValue>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let encoded = serialization::encode(value)?;
        self.store.set(key, encoded.into_string(), Some(ttl)).await
    }

    /// Seed `key` for logical-expiry reads.
    ///
    /// The entry is stored without a physical TTL and counts as stale once
    /// `logical_ttl` has passed. Use this to warm hot keys ahead of traffic.
    ///
    /// # Errors
    /// Returns `Err` if encoding or the store fails
    pub async fn set_with_logical_expire<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        logical_ttl: Duration,
    ) -> Result<()> {
        let entry = LogicalEntry::wrap(value, logical_ttl)?;
        self.store.set(key, entry.encode()?, None).await
    }

    /// Read and decode the plain value at `key`.
    ///
    /// Absent keys and tombstones both yield `None`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails or the value does not decode as `T`
    pub async fn get<T: CacheValue>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key).await? {
            Some(stored) => serialization::decode(&stored),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------------
    // Strategy internals
    // ------------------------------------------------------------------------

    fn observe<T>(&self, key: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.metrics.record_error(key, &e.to_string());
        }
        result
    }

    /// Read `key` as a plain (non-envelope) value.
    ///
    /// `None` means absent; `Some(None)` is a tombstone.
    async fn read_cached<F: Form>(&self, key: &str) -> Result<Option<Option<F::Output>>> {
        let timer = Instant::now();
        match self.store.get(key).await? {
            None => Ok(None),
            Some(stored) if is_tombstone(&stored) => {
                debug!("✓ Tombstone hit for {}", key);
                self.metrics.record_null_hit(key);
                Ok(Some(None))
            }
            Some(stored) => {
                let value = F::decode_stored(&stored)?;
                self.metrics.record_hit(key, timer.elapsed());
                Ok(Some(value))
            }
        }
    }

    /// Call the loader and write its result, or a tombstone.
    async fn load_and_store<F: Form>(
        &self,
        key: &str,
        load: &BoundLoader<F::Output>,
        ttl: Duration,
    ) -> Result<Option<F::Output>> {
        let timer = Instant::now();
        let loaded = load().await;
        self.metrics.record_load(key, timer.elapsed());

        match loaded? {
            Some(value) if !F::is_empty_result(&value) => {
                let encoded = F::encode_value(&value)?;
                self.store.set(key, encoded, Some(ttl)).await?;
                debug!("✓ Cached loaded value for {} (TTL: {:?})", key, ttl);
                Ok(Some(value))
            }
            _ => {
                self.store
                    .set(key, TOMBSTONE.to_string(), Some(self.config.null_ttl))
                    .await?;
                debug!(
                    "Loader found nothing for {}; tombstone cached for {:?}",
                    key, self.config.null_ttl
                );
                Ok(None)
            }
        }
    }

    async fn pass_through<F: Form>(
        &self,
        key: &str,
        load: BoundLoader<F::Output>,
        ttl: Duration,
    ) -> Result<Option<F::Output>> {
        debug!("» PassThrough query for {}", key);
        let timer = Instant::now();

        if let Some(cached) = self.read_cached::<F>(key).await? {
            return Ok(cached);
        }

        self.metrics.record_miss(key, timer.elapsed());
        self.load_and_store::<F>(key, &load, ttl).await
    }

    async fn mutex<F: Form>(
        &self,
        key: &str,
        load: BoundLoader<F::Output>,
        ttl: Duration,
    ) -> Result<Option<F::Output>> {
        debug!("» Mutex query for {}", key);
        let lock_key = CacheKeyBuilder::lock_key(key, &self.config.lock_suffix);
        let max_attempts = self.config.max_attempts;

        for attempt in 1..=max_attempts {
            let timer = Instant::now();
            if let Some(cached) = self.read_cached::<F>(key).await? {
                return Ok(cached);
            }
            if attempt == 1 {
                self.metrics.record_miss(key, timer.elapsed());
            }

            let guard =
                match LockGuard::acquire(&self.lock, &lock_key, self.config.lock_wait).await? {
                    Some(guard) => guard,
                    None => {
                        self.metrics.record_lock_contention(key);
                        debug!(
                            "Lock {} busy (attempt {}/{}), retrying in {:?}",
                            lock_key, attempt, max_attempts, self.config.retry_delay
                        );
                        tokio::time::sleep(self.config.retry_delay).await;
                        continue;
                    }
                };

            let result = async {
                // Whoever held the lock before us may already have filled the key.
                if let Some(cached) = self.read_cached::<F>(key).await? {
                    debug!("Key {} filled while waiting for the lock", key);
                    return Ok(cached);
                }
                self.load_and_store::<F>(key, &load, ttl).await
            }
            .await;

            if let Err(e) = guard.release().await {
                warn!("Failed to release lock {}: {}", lock_key, e);
            }
            return result;
        }

        warn!(
            "Mutex query for {} gave up after {} attempts",
            key, max_attempts
        );
        Err(Error::RetryExhausted {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }

    async fn logical_expire<F: Form>(
        &self,
        key: &str,
        load: BoundLoader<F::Output>,
        logical_ttl: Duration,
    ) -> Result<Option<F::Output>> {
        debug!("» LogicalExpire query for {}", key);
        let max_attempts = self.config.max_attempts;
        // Set while this call's cold-start rebuild is queued or running.
        let pending = Arc::new(AtomicBool::new(false));

        for attempt in 1..=max_attempts {
            let timer = Instant::now();
            let stored = self
                .store
                .get(key)
                .await?
                .filter(|stored| !is_tombstone(stored));

            let stored = match stored {
                Some(stored) => stored,
                None => {
                    if attempt == 1 {
                        self.metrics.record_miss(key, timer.elapsed());
                    }
                    if pending.swap(true, Ordering::AcqRel) {
                        trace!(
                            "No entry for {} (attempt {}/{}); rebuild still pending",
                            key, attempt, max_attempts
                        );
                    } else {
                        debug!(
                            "No entry for {} (attempt {}/{}); scheduling rebuild",
                            key, attempt, max_attempts
                        );
                        self.schedule_rebuild::<F>(
                            key,
                            &load,
                            logical_ttl,
                            Some(PendingRebuild(Arc::clone(&pending))),
                        )
                        .await;
                    }
                    tokio::time::sleep(self.config.retry_delay).await;
                    continue;
                }
            };

            let entry = LogicalEntry::decode(&stored)?;
            let value = F::from_entry(&entry)?;

            if !entry.is_expired() {
                self.metrics.record_hit(key, timer.elapsed());
                return Ok(value);
            }

            debug!(
                "Entry for {} expired at {}; serving stale value",
                key, entry.expire_time
            );
            self.metrics.record_stale(key);
            self.schedule_rebuild::<F>(key, &load, logical_ttl, None).await;
            return Ok(value);
        }

        warn!(
            "LogicalExpire query for {} gave up after {} attempts",
            key, max_attempts
        );
        Err(Error::RetryExhausted {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }

    async fn schedule_rebuild<F: Form>(
        &self,
        key: &str,
        load: &BoundLoader<F::Output>,
        logical_ttl: Duration,
        pending: Option<PendingRebuild>,
    ) {
        let job = Rebuild::<S, L, F> {
            store: self.store.clone(),
            lock: self.lock.clone(),
            metrics: Arc::clone(&self.metrics),
            key: key.to_string(),
            lock_key: CacheKeyBuilder::lock_key(key, &self.config.lock_suffix),
            lock_wait: self.config.lock_wait,
            load: Arc::clone(load),
            logical_ttl,
            _pending: pending,
        };
        self.executor.submit(job.run().boxed()).await;
    }
}

// ============================================================================
// Background rebuild
// ============================================================================

/// Everything a rebuild needs, owned so it can run on the executor.
struct Rebuild<S, L, F: Form> {
    store: S,
    lock: L,
    metrics: Arc<dyn CacheMetrics>,
    key: String,
    lock_key: String,
    lock_wait: Duration,
    load: BoundLoader<F::Output>,
    logical_ttl: Duration,
    _pending: Option<PendingRebuild>,
}

/// Clears a caller's pending flag once its rebuild is dropped, however the
/// job ended.
struct PendingRebuild(Arc<AtomicBool>);

impl Drop for PendingRebuild {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: CacheStore, L: LockService, F: Form> Rebuild<S, L, F> {
    async fn run(self) {
        let guard = match LockGuard::acquire(&self.lock, &self.lock_key, self.lock_wait).await {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                self.metrics.record_lock_contention(&self.key);
                debug!("Rebuild of {} already in progress; skipping", self.key);
                return;
            }
            Err(e) => {
                error!("Rebuild of {} could not lock {}: {}", self.key, self.lock_key, e);
                self.metrics.record_error(&self.key, &e.to_string());
                return;
            }
        };

        let timer = Instant::now();
        match self.refresh().await {
            Ok(true) => {
                self.metrics.record_rebuild(&self.key, timer.elapsed());
                debug!("✓ Rebuilt {} in {:?}", self.key, timer.elapsed());
            }
            Ok(false) => {}
            Err(e) => {
                error!("Rebuild of {} failed; keeping current entry: {}", self.key, e);
                self.metrics.record_error(&self.key, &e.to_string());
            }
        }

        if let Err(e) = guard.release().await {
            error!("Failed to release lock {}: {}", self.lock_key, e);
        }
    }

    /// Returns true if a new entry was written.
    async fn refresh(&self) -> Result<bool> {
        if let Some(stored) = self.store.get(&self.key).await? {
            if !is_tombstone(&stored) && !LogicalEntry::decode(&stored)?.is_expired() {
                debug!("{} already rebuilt by another worker", self.key);
                return Ok(false);
            }
        }

        let timer = Instant::now();
        let loaded = (self.load)().await;
        self.metrics.record_load(&self.key, timer.elapsed());

        match loaded? {
            Some(value) if !F::is_empty_result(&value) => {
                let entry = F::to_entry(&value, self.logical_ttl)?;
                self.store.set(&self.key, entry.encode()?, None).await?;
                Ok(true)
            }
            _ => {
                debug!("Loader found nothing for {}; nothing written", self.key);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryStore;
    use crate::lock::InMemoryLock;
    use crate::observability::CounterMetrics;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Shop {
        id: u64,
        name: String,
    }

    impl CacheValue for Shop {}

    fn engine() -> CacheAsideEngine<InMemoryStore, InMemoryLock> {
        CacheAsideEngine::new(
            InMemoryStore::new(),
            InMemoryLock::new(),
            EngineConfig::default()
                .with_retry_delay(Duration::from_millis(5))
                .with_max_attempts(20),
        )
        .expect("engine should start")
    }

    fn counting_loader(
        calls: &Arc<AtomicUsize>,
    ) -> impl Fn(u64) -> futures::future::Ready<Result<Option<Shop>>> + Send + Sync + 'static
    {
        let calls = Arc::clone(calls);
        move |id: u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            let shop = (id != 0).then(|| Shop {
                id,
                name: format!("shop-{}", id),
            });
            futures::future::ready(Ok(shop))
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.null_ttl, Duration::from_secs(60));
        assert_eq!(config.lock_suffix, "_lock");
        assert_eq!(config.lock_wait, Duration::from_millis(2000));
        assert_eq!(config.retry_delay, Duration::from_millis(50));
        assert_eq!(config.max_attempts, 100);
        assert_eq!(config.executor.workers, 16);
        assert_eq!(config.executor.queue_capacity, 4096);
    }

    #[test]
    fn test_config_validate() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(matches!(
            EngineConfig::default().with_max_attempts(0).validate(),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            EngineConfig::default().with_lock_suffix("").validate(),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            EngineConfig::default()
                .with_executor(ExecutorConfig {
                    workers: 0,
                    queue_capacity: 1,
                })
                .validate(),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_list_form_treats_empty_as_absent() {
        assert!(List::<u32>::is_empty_result(&Vec::new()));
        assert!(!List::<u32>::is_empty_result(&vec![1]));
        assert!(!Single::<Vec<u32>>::is_empty_result(&Vec::new()));
    }

    #[tokio::test]
    async fn test_pass_through_caches_loaded_value() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let shop = engine
                .query_with_pass_through("shop:", 1u64, counting_loader(&calls), Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(shop.map(|s| s.name), Some("shop-1".to_string()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(engine.store().get("shop:1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pass_through_writes_tombstone_with_null_ttl() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));

        let shop = engine
            .query_with_pass_through("shop:", 0u64, counting_loader(&calls), Duration::from_secs(300))
            .await
            .unwrap();
        assert!(shop.is_none());

        assert_eq!(
            engine.store().get("shop:0").await.unwrap(),
            Some(String::new())
        );
        let ttl = engine.store().ttl("shop:0").expect("tombstone has a TTL");
        assert!(ttl <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_loader_error_propagates_and_caches_nothing() {
        let engine = engine();
        let loader = |_id: u64| async { Err::<Option<Shop>, Error>(Error::LoaderError("db down".to_string())) };

        let result = engine
            .query_with_mutex("shop:", 5u64, loader, Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::LoaderError(_))));
        assert!(engine.store().get("shop:5").await.unwrap().is_none());
        assert!(!engine.lock_service().is_locked("shop:5_lock"));
    }

    #[tokio::test]
    async fn test_mutex_retry_exhausted_under_contention() {
        let engine = CacheAsideEngine::new(
            InMemoryStore::new(),
            InMemoryLock::new(),
            EngineConfig::default()
                .with_lock_wait(Duration::from_millis(1))
                .with_retry_delay(Duration::from_millis(1))
                .with_max_attempts(3),
        )
        .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let _held = engine
            .lock_service()
            .try_lock("shop:9_lock", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let result = engine
            .query_with_mutex("shop:", 9u64, counting_loader(&calls), Duration::from_secs(60))
            .await;
        match result {
            Err(Error::RetryExhausted { key, attempts }) => {
                assert_eq!(key, "shop:9");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected RetryExhausted, got {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mutex_double_check_skips_loader() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));

        // Hold the lock, fill the key, then release: the waiting caller
        // reads the filled key instead of loading.
        let token = engine
            .lock_service()
            .try_lock("shop:3_lock", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        let store = engine.store().clone();
        let lock = engine.lock_service().clone();
        let filler = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let shop = Shop {
                id: 3,
                name: "filled".to_string(),
            };
            store
                .set("shop:3", serde_json::to_string(&shop).unwrap(), None)
                .await
                .unwrap();
            lock.unlock("shop:3_lock", &token).await.unwrap();
        });

        let shop = engine
            .query_with_mutex("shop:", 3u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();
        filler.await.unwrap();

        assert_eq!(shop.map(|s| s.name), Some("filled".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_logical_expire_fresh_hit_skips_loader() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let shop = Shop {
            id: 4,
            name: "seeded".to_string(),
        };
        engine
            .set_with_logical_expire("shop:4", &shop, Duration::from_secs(60))
            .await
            .unwrap();

        let read = engine
            .query_with_logical_expire("shop:", 4u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(read, Some(shop));

        engine.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.executor_stats().submitted, 0);
    }

    #[tokio::test]
    async fn test_logical_expire_cold_start_seeds_entry() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));

        let read = engine
            .query_with_logical_expire("shop:", 8u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(read.map(|s| s.id), Some(8));

        let stored = engine.store().get("shop:8").await.unwrap().unwrap();
        let entry = LogicalEntry::decode(&stored).unwrap();
        assert!(!entry.is_expired());
        assert_eq!(engine.store().ttl("shop:8"), None);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_logical_expire_cold_start_gives_up() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));

        // Id 0 never exists, so nothing is ever written.
        let result = engine
            .query_with_logical_expire("shop:", 0u64, counting_loader(&calls), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::RetryExhausted { attempts: 20, .. })));
        engine.shutdown().await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logical_expire_cold_start_waits_for_pending_rebuild() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        let slow = {
            let calls = Arc::clone(&calls);
            move |id: u64| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Spans several retry delays.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Error>(Some(Shop {
                        id,
                        name: "slow".to_string(),
                    }))
                }
            }
        };

        let read = engine
            .query_with_logical_expire("shop:", 4u64, slow, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(read.map(|s| s.name), Some("slow".to_string()));
        assert_eq!(engine.executor_stats().submitted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_decode_failure_is_fatal_not_a_miss() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));
        engine
            .store()
            .set("shop:6", "not json".to_string(), None)
            .await
            .unwrap();

        let result = engine
            .query_with_pass_through("shop:", 6u64, counting_loader(&calls), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::DeserializationError(_))));

        let result = engine
            .query_with_logical_expire("shop:", 6u64, counting_loader(&calls), Duration::from_secs(60))
            .await;
        assert!(matches!(result, Err(Error::DeserializationError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_direct_set_and_get() {
        let engine = engine();

        engine.set("greeting", &"hello".to_string()).await.unwrap();
        assert_eq!(engine.store().get("greeting").await.unwrap(), Some("hello".to_string()));
        assert_eq!(engine.get::<String>("greeting").await.unwrap(), Some("hello".to_string()));

        engine
            .set_with_ttl("count", &42u32, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(engine.get::<u32>("count").await.unwrap(), Some(42));
        assert!(engine.store().ttl("count").is_some());

        assert_eq!(engine.get::<u32>("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_query_dispatches_by_strategy() {
        let engine = engine();
        let calls = Arc::new(AtomicUsize::new(0));

        for (strategy, id) in [
            (CacheStrategy::PassThrough, 11u64),
            (CacheStrategy::LogicalExpire, 12),
            (CacheStrategy::Mutex, 13),
        ] {
            let shop = engine
                .query(strategy, "shop:", id, counting_loader(&calls), Duration::from_secs(60))
                .await
                .unwrap();
            assert_eq!(shop.map(|s| s.id), Some(id));
        }

        let stored = engine.store().get("shop:12").await.unwrap().unwrap();
        assert!(LogicalEntry::decode(&stored).is_ok());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_are_recorded() {
        let metrics = Arc::new(CounterMetrics::new());
        let engine = engine().with_metrics(metrics.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        engine
            .query_with_pass_through("shop:", 1u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();
        engine
            .query_with_pass_through("shop:", 1u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();
        engine
            .query_with_pass_through("shop:", 0u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();
        engine
            .query_with_pass_through("shop:", 0u64, counting_loader(&calls), Duration::from_secs(60))
            .await
            .unwrap();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.misses, 2);
        assert_eq!(snapshot.loads, 2);
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.null_hits, 1);
        assert_eq!(snapshot.errors, 0);
    }
}
