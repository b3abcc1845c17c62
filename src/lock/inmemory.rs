//! Process-local lock service.
//!
//! Serializes callers within one process only. Use a shared lock service
//! such as [`crate::lock::RedisLock`] when several processes rebuild the
//! same keys.

use super::{LockService, LockToken, DEFAULT_LEASE};
use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Upper bound between re-checks while waiting, so a lease expiring on an
/// abandoned lock is noticed without a release notification.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct Holder {
    token: LockToken,
    expires_at: Instant,
}

struct Inner {
    holders: DashMap<String, Holder>,
    released: Notify,
    lease: Duration,
}

/// In-memory lock service with leases.
///
/// # Example
///
/// ```
/// use cache_shield::lock::{InMemoryLock, LockService};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> cache_shield::Result<()> {
/// let lock = InMemoryLock::new();
///
/// let token = lock.try_lock("user:1_lock", Duration::ZERO).await?.unwrap();
/// assert!(lock.try_lock("user:1_lock", Duration::ZERO).await?.is_none());
///
/// lock.unlock("user:1_lock", &token).await?;
/// assert!(lock.try_lock("user:1_lock", Duration::ZERO).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryLock {
    inner: Arc<Inner>,
}

impl InMemoryLock {
    /// Create a lock service with the default lease.
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    /// Create a lock service whose locks free themselves after `lease`.
    pub fn with_lease(lease: Duration) -> Self {
        InMemoryLock {
            inner: Arc::new(Inner {
                holders: DashMap::new(),
                released: Notify::new(),
                lease,
            }),
        }
    }

    /// True if `key` is currently held and its lease has not run out.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inner
            .holders
            .get(key)
            .is_some_and(|holder| holder.expires_at > Instant::now())
    }

    fn try_acquire(&self, key: &str, token: &LockToken) -> bool {
        let now = Instant::now();
        let holder = Holder {
            token: token.clone(),
            expires_at: now + self.inner.lease,
        };

        match self.inner.holders.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    warn!("Lock {} lease expired; taking it over", key);
                    occupied.insert(holder);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(holder);
                true
            }
        }
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new()
    }
}

impl LockService for InMemoryLock {
    async fn try_lock(&self, key: &str, wait: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();
        let deadline = Instant::now() + wait;

        loop {
            // Register interest before checking, so a release between the
            // check and the wait is not missed.
            let released = self.inner.released.notified();

            if self.try_acquire(key, &token) {
                debug!("✓ InMemory LOCK {}", key);
                return Ok(Some(token));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("InMemory LOCK {} unavailable after {:?}", key, wait);
                return Ok(None);
            }

            let _ = tokio::time::timeout(remaining.min(POLL_INTERVAL), released).await;
        }
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> Result<()> {
        let removed = self
            .inner
            .holders
            .remove_if(key, |_, holder| holder.token == *token)
            .is_some();

        if removed {
            debug!("✓ InMemory UNLOCK {}", key);
            self.inner.released.notify_waiters();
        }

        Ok(())
    }

    async fn extend(&self, key: &str, token: &LockToken) -> Result<bool> {
        let now = Instant::now();
        let extended = match self.inner.holders.get_mut(key) {
            Some(mut holder) if holder.token == *token && holder.expires_at > now => {
                holder.expires_at = now + self.inner.lease;
                true
            }
            _ => false,
        };
        Ok(extended)
    }

    fn lease(&self) -> Duration {
        self.inner.lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let lock = InMemoryLock::new();

        let token = lock.try_lock("k", Duration::ZERO).await.unwrap();
        assert!(token.is_some());
        assert!(lock.try_lock("k", Duration::ZERO).await.unwrap().is_none());
        assert!(lock.try_lock("other", Duration::ZERO).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unlock_with_wrong_token_is_noop() {
        let lock = InMemoryLock::new();

        let _token = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();
        lock.unlock("k", &LockToken::generate()).await.unwrap();
        assert!(lock.is_locked("k"));
    }

    #[tokio::test]
    async fn test_unlock_is_idempotent() {
        let lock = InMemoryLock::new();

        let token = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();
        lock.unlock("k", &token).await.unwrap();
        lock.unlock("k", &token).await.unwrap();
        assert!(!lock.is_locked("k"));
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let lock = InMemoryLock::new();
        let token = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_lock("k", Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        lock.unlock("k", &token).await.unwrap();

        let acquired = waiter.await.expect("waiter panicked").unwrap();
        assert!(acquired.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let lock = InMemoryLock::new();
        let _token = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();

        let started = Instant::now();
        let result = lock.try_lock("k", Duration::from_millis(200)).await.unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_taken_over() {
        let lock = InMemoryLock::with_lease(Duration::from_millis(100));
        let stale = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!lock.is_locked("k"));

        let fresh = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();
        // The previous holder's late release must not free the new holder.
        lock.unlock("k", &stale).await.unwrap();
        assert!(lock.is_locked("k"));

        lock.unlock("k", &fresh).await.unwrap();
        assert!(!lock.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_restarts_lease() {
        let lock = InMemoryLock::with_lease(Duration::from_millis(100));
        let token = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(lock.extend("k", &token).await.unwrap());
        tokio::time::advance(Duration::from_millis(80)).await;
        assert!(lock.is_locked("k"));

        assert!(!lock.extend("k", &LockToken::generate()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_after_expiry_or_release_fails() {
        let lock = InMemoryLock::with_lease(Duration::from_millis(100));
        let token = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!lock.extend("k", &token).await.unwrap());

        let fresh = lock.try_lock("k", Duration::ZERO).await.unwrap().unwrap();
        lock.unlock("k", &fresh).await.unwrap();
        assert!(!lock.extend("k", &fresh).await.unwrap());
    }
}
