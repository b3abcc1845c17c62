//! Loader traits for reading the backing data source.
//!
//! The engine calls a loader only on a cache miss (or, for logical expiry,
//! on a stale or cold entry). A loader is any async function of the id:
//!
//! ```
//! use cache_shield::loader::Loader;
//! use cache_shield::Result;
//!
//! async fn fetch_user(id: u64) -> Result<Option<String>> {
//!     Ok((id == 1).then(|| "alice".to_string()))
//! }
//!
//! fn assert_loader<L: Loader<u64, String>>(_: &L) {}
//! assert_loader(&fetch_user);
//! ```
//!
//! Closures work the same way, provided they own what they capture:
//! logical-expiry rebuilds run loaders on the background executor, so both
//! the loader and the future it returns must be `Send + 'static`.
//!
//! # Returns
//!
//! - `Ok(Some(value))` - Value found; the engine caches it
//! - `Ok(None)` - Value does not exist; the engine caches a tombstone
//! - `Err(e)` - Source failure; surfaced to synchronous callers unchanged

use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// Loader keyed by an identifier.
pub trait Loader<I, R>: Send + Sync + 'static {
    /// Fetch the value for `id` from the backing source.
    ///
    /// # Errors
    /// Returns `Err` if the backing source fails
    fn load(&self, id: I) -> BoxFuture<'static, Result<Option<R>>>;
}

impl<I, R, F, Fut> Loader<I, R> for F
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<R>>> + Send + 'static,
{
    fn load(&self, id: I) -> BoxFuture<'static, Result<Option<R>>> {
        self(id).boxed()
    }
}

/// Loader for a value that takes no identifier, such as "all active users".
pub trait Supplier<R>: Send + Sync + 'static {
    /// Fetch the value from the backing source.
    ///
    /// # Errors
    /// Returns `Err` if the backing source fails
    fn supply(&self) -> BoxFuture<'static, Result<Option<R>>>;
}

impl<R, F, Fut> Supplier<R> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<R>>> + Send + 'static,
{
    fn supply(&self) -> BoxFuture<'static, Result<Option<R>>> {
        self().boxed()
    }
}

/// A loader with its id already bound.
///
/// Every entry point reduces to one of these, so the strategies do not care
/// whether the caller supplied an id.
pub(crate) type BoundLoader<R> =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<R>>> + Send + Sync>;

pub(crate) fn bind<I, R, L>(loader: L, id: I) -> BoundLoader<R>
where
    I: Clone + Send + Sync + 'static,
    R: 'static,
    L: Loader<I, R>,
{
    Arc::new(move || loader.load(id.clone()))
}

pub(crate) fn bind_supplier<R, S>(supplier: S) -> BoundLoader<R>
where
    R: 'static,
    S: Supplier<R>,
{
    Arc::new(move || supplier.supply())
}
