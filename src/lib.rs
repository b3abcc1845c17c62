//! # cache-shield
//!
//! Cache-aside query strategies for Rust services that put a remote
//! key-value cache in front of a slow data source.
//!
//! ## Features
//!
//! - **Penetration defence:** Missing ids are negative-cached with a short-lived tombstone
//! - **Breakdown defence:** Hot keys rebuild single-flight, under a distributed lock
//! - **Avalanche defence:** Logical expiry keeps entries readable while they refresh
//! - **Backend Agnostic:** In-memory, Redis and Memcached stores, or your own [`backend::CacheStore`]
//! - **Bounded background work:** Rebuilds run on a fixed worker pool with caller-runs backpressure
//! - **Production Ready:** Built-in logging, metrics hooks, and error handling
//!
//! ## Quick Start
//!
//! ### For Web Applications (Recommended)
//!
//! Use [`CacheService`] for easy sharing across request handlers:
//!
//! ```
//! use cache_shield::{CacheService, CacheValue, Result};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! // 1. Define your value
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Shop {
//!     id: u64,
//!     name: String,
//! }
//!
//! // 2. Opt into caching (stored as JSON)
//! impl CacheValue for Shop {}
//!
//! // 3. Your loader - any async fn of the id
//! async fn load_shop(id: u64) -> Result<Option<Shop>> {
//!     Ok(Some(Shop { id, name: format!("shop {}", id) }))
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! // 4. Create the service - CacheService is Clone for thread sharing
//! let cache = CacheService::in_memory()?;
//!
//! // 5. Read through the cache
//! let shop = cache
//!     .query_with_mutex("cache:shop:", 1u64, load_shop, Duration::from_secs(1800))
//!     .await?;
//! assert_eq!(shop.map(|s| s.id), Some(1));
//!
//! cache.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ### Choosing a strategy
//!
//! | Method family | Defends against | Loader called |
//! |---------------|-----------------|---------------|
//! | `query_with_pass_through*` | penetration | on every miss |
//! | `query_with_mutex*` | penetration, breakdown | once per miss, under lock |
//! | `query_with_logical_expire*` | breakdown, avalanche | in the background, once per expiry |
//!
//! Each family has id-keyed and `_without_args` forms, for single values
//! and `_list` values. [`CacheAsideEngine::query`] picks the family from a
//! [`CacheStrategy`] at runtime.
//!
//! ### Shared deployments
//!
//! With the `redis` feature, [`backend::RedisStore`] and
//! [`lock::RedisLock`] share one connection pool so several processes
//! coordinate rebuilds of the same keys.

#[macro_use]
extern crate log;

pub mod backend;
pub mod engine;
pub mod error;
pub mod executor;
pub mod key;
pub mod loader;
pub mod lock;
pub mod observability;
pub mod serialization;
pub mod service;
pub mod strategy;
pub mod value;

// Re-exports for convenience
pub use backend::CacheStore;
pub use engine::{CacheAsideEngine, EngineConfig};
pub use error::{Error, Result};
pub use executor::{ExecutorConfig, TaskExecutor};
pub use loader::{Loader, Supplier};
pub use lock::LockService;
pub use service::CacheService;
pub use strategy::CacheStrategy;
pub use value::{CacheValue, Shape};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
