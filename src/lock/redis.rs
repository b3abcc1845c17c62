//! Redis lock service.
//!
//! Acquire is `SET key token NX PX lease`; release and renewal are Lua
//! scripts that check the token first, so a holder whose lease expired can
//! never free or extend a lock that has since passed to someone else.

use super::{LockService, LockToken, DEFAULT_LEASE};
use crate::backend::RedisStore;
use crate::error::{Error, Result};
use deadpool_redis::redis::{cmd, Script};
use deadpool_redis::{Connection, Pool};
use std::time::Duration;
use tokio::time::Instant;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Interval between acquire attempts while the lock is held elsewhere.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lock service backed by Redis.
///
/// # Example
///
/// ```no_run
/// # use cache_shield::backend::{RedisConfig, RedisStore};
/// # use cache_shield::lock::RedisLock;
/// # async fn example() -> cache_shield::Result<()> {
/// let store = RedisStore::new(RedisConfig::default()).await?;
/// let lock = RedisLock::from_store(&store);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisLock {
    pool: Pool,
    lease: Duration,
    poll_interval: Duration,
}

impl RedisLock {
    /// Create a lock service on an existing connection pool.
    pub fn new(pool: Pool) -> Self {
        RedisLock {
            pool,
            lease: DEFAULT_LEASE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Create a lock service sharing `store`'s connection pool.
    pub fn from_store(store: &RedisStore) -> Self {
        Self::new(store.pool().clone())
    }

    /// Set the lease after which an unreleased lock frees itself.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Set the interval between acquire attempts.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn connection(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::LockError(format!("Failed to get Redis connection: {}", e)))
    }

    fn lease_ms(&self) -> u64 {
        (self.lease.as_millis() as u64).max(1)
    }

    async fn try_acquire(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.connection().await?;
        let lease_ms = self.lease_ms();

        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::LockError(format!("Redis SET NX failed for {}: {}", key, e)))?;

        Ok(reply.is_some())
    }
}

impl LockService for RedisLock {
    async fn try_lock(&self, key: &str, wait: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();
        let deadline = Instant::now() + wait;

        loop {
            if self.try_acquire(key, &token).await? {
                debug!("✓ Redis LOCK {}", key);
                return Ok(Some(token));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("Redis LOCK {} unavailable after {:?}", key, wait);
                return Ok(None);
            }

            tokio::time::sleep(remaining.min(self.poll_interval)).await;
        }
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> Result<()> {
        let mut conn = self.connection().await?;

        let removed: i64 = Script::new(UNLOCK_SCRIPT)
            .key(key)
            .arg(token.as_str())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::LockError(format!("Redis UNLOCK failed for {}: {}", key, e)))?;

        if removed > 0 {
            debug!("✓ Redis UNLOCK {}", key);
        } else {
            debug!("Redis UNLOCK {} skipped: not held by this token", key);
        }

        Ok(())
    }

    async fn extend(&self, key: &str, token: &LockToken) -> Result<bool> {
        let mut conn = self.connection().await?;

        let extended: i64 = Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token.as_str())
            .arg(self.lease_ms())
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| Error::LockError(format!("Redis PEXPIRE failed for {}: {}", key, e)))?;

        Ok(extended > 0)
    }

    fn lease(&self) -> Duration {
        self.lease
    }
}
