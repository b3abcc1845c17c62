//! Distributed mutual exclusion used to coordinate rebuilds.
//!
//! The engine needs a bounded-wait acquire, a lease extension and a
//! release, so any lock service that can express them plugs in through
//! [`LockService`]. Each acquisition hands back a [`LockToken`]; release is a
//! compare-and-delete on that token, which makes it idempotent and harmless
//! when the lease has already passed to another holder.
//!
//! [`LockGuard`] scopes an acquisition and renews its lease every third of
//! the lease until released, so a slow loader keeps the lock for as long as
//! it runs. Callers release it explicitly with
//! [`LockGuard::release`]; a guard dropped without release (panic,
//! cancellation) schedules the release on the current runtime instead.

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

pub mod inmemory;
#[cfg(feature = "redis")]
pub mod redis;

pub use inmemory::InMemoryLock;
#[cfg(feature = "redis")]
pub use redis::RedisLock;

/// Default lease after which an unreleased lock frees itself.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Floor on the interval between lease renewals.
const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(1);

/// Proof of holding a lock, presented again on release.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a fresh, globally unique token.
    pub fn generate() -> Self {
        LockToken(uuid::Uuid::now_v7().to_string())
    }

    /// Token as stored by the lock service.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Trait for lock service implementations.
///
/// Implementations must be usable from any task (every method takes `&self`
/// and returns a `Send` future) and cheap to clone.
pub trait LockService: Send + Sync + Clone + 'static {
    /// Try to acquire `key`, waiting at most `wait` for a current holder to
    /// release it.
    ///
    /// # Returns
    /// - `Ok(Some(token))` - Lock held until released or its lease runs out
    /// - `Ok(None)` - Still held by someone else when `wait` elapsed
    ///
    /// # Errors
    /// Returns `Err` only if the lock service itself fails
    fn try_lock(
        &self,
        key: &str,
        wait: Duration,
    ) -> impl Future<Output = Result<Option<LockToken>>> + Send;

    /// Release `key` if it is still held under `token`.
    ///
    /// Releasing twice, or after the lease expired and another caller took
    /// the lock, is a no-op.
    ///
    /// # Errors
    /// Returns `Err` only if the lock service itself fails
    fn unlock(&self, key: &str, token: &LockToken) -> impl Future<Output = Result<()>> + Send;

    /// Restart the lease on `key` if it is still held under `token`.
    ///
    /// Returns `Ok(false)` if the lock was released or its lease already ran
    /// out.
    ///
    /// # Errors
    /// Returns `Err` only if the lock service itself fails
    fn extend(&self, key: &str, token: &LockToken) -> impl Future<Output = Result<bool>> + Send;

    /// Lease granted by each acquisition.
    fn lease(&self) -> Duration;
}

/// Scoped lock acquisition.
pub struct LockGuard<L: LockService> {
    service: L,
    key: String,
    token: Option<LockToken>,
    renewal: Option<JoinHandle<()>>,
}

impl<L: LockService> LockGuard<L> {
    /// Acquire `key` on `service`, waiting at most `wait`.
    ///
    /// # Returns
    /// - `Ok(Some(guard))` - Lock acquired
    /// - `Ok(None)` - Lock unavailable within `wait`
    ///
    /// # Errors
    /// Returns `Err` if the lock service fails
    pub async fn acquire(service: &L, key: &str, wait: Duration) -> Result<Option<Self>> {
        let token = service.try_lock(key, wait).await?;
        Ok(token.map(|token| LockGuard {
            service: service.clone(),
            key: key.to_string(),
            renewal: spawn_renewal(service, key, &token),
            token: Some(token),
        }))
    }

    /// Lock key this guard holds.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock now.
    ///
    /// # Errors
    /// Returns `Err` if the lock service fails; the lease still bounds how
    /// long the key stays locked.
    pub async fn release(mut self) -> Result<()> {
        self.stop_renewal();
        match self.token.take() {
            Some(token) => {
                let result = self.service.unlock(&self.key, &token).await;
                debug!("Released lock {}", self.key);
                result
            }
            None => Ok(()),
        }
    }

    fn stop_renewal(&mut self) {
        if let Some(renewal) = self.renewal.take() {
            renewal.abort();
        }
    }
}

/// Extend the lease on `key` until aborted or the lock is lost.
///
/// Returns `None` outside a runtime; the lock then lives for one lease.
fn spawn_renewal<L: LockService>(
    service: &L,
    key: &str,
    token: &LockToken,
) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let period = (service.lease() / 3).max(MIN_RENEWAL_PERIOD);
    let service = service.clone();
    let key = key.to_string();
    let token = token.clone();

    Some(handle.spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            match service.extend(&key, &token).await {
                Ok(true) => trace!("Renewed lock {}", key),
                Ok(false) => {
                    warn!("Lock {} lost before release; renewal stopped", key);
                    return;
                }
                Err(e) => warn!("Failed to renew lock {}: {}", key, e),
            }
        }
    }))
}

impl<L: LockService> Drop for LockGuard<L> {
    fn drop(&mut self) {
        self.stop_renewal();
        let token = match self.token.take() {
            Some(token) => token,
            None => return,
        };

        let key = std::mem::take(&mut self.key);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let service = self.service.clone();
                handle.spawn(async move {
                    if let Err(e) = service.unlock(&key, &token).await {
                        error!("Failed to release dropped lock {}: {}", key, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Lock {} dropped outside a runtime; it frees on lease expiry",
                    key
                );
            }
        }
    }
}
