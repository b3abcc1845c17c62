//! Read strategies offered by the engine.
//!
//! Each strategy defends against a different failure of a plain cache-aside
//! read:
//!
//! ```
//! use cache_shield::strategy::CacheStrategy;
//!
//! // Negative-caches missing ids (penetration)
//! let _s = CacheStrategy::PassThrough;
//!
//! // Serves stale data while one caller rebuilds in the background (breakdown)
//! let _s = CacheStrategy::LogicalExpire;
//!
//! // Lets exactly one caller rebuild while the others wait (breakdown)
//! let _s = CacheStrategy::Mutex;
//! ```
//!
//! # When to Use Each Strategy
//!
//! | Strategy | Hit | Tombstone | Miss | Use Case |
//! |----------|-----|-----------|------|----------|
//! | **PassThrough** | Return | Return None | Load, cache value or tombstone | Default; cheap loaders |
//! | **LogicalExpire** | Return, even if stale | - | Rebuild, poll until seeded | Hot keys; staleness acceptable |
//! | **Mutex** | Return | Return None | One caller loads, others retry | Hot keys; expensive loaders |
//!
//! Keys read with `LogicalExpire` hold a different envelope than the other
//! two, so a given key prefix should stick to one family.

use crate::error::{Error, Result};
use std::str::FromStr;

/// Strategy enum selecting how a read reaches the loader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum CacheStrategy {
    /// **PassThrough**: Cache-first, load on miss, negative-cache absence.
    ///
    /// Flow:
    /// 1. Check cache
    /// 2. If hit: return cached value
    /// 3. If tombstone: return None without loading
    /// 4. If miss: load, store the value (or a short-lived tombstone), return
    #[default]
    PassThrough,

    /// **LogicalExpire**: Entries carry their own expiry and are never evicted.
    ///
    /// Flow:
    /// 1. Check cache
    /// 2. If fresh: return it
    /// 3. If stale: schedule a background rebuild, return the stale value
    /// 4. If absent: schedule a rebuild and poll until it lands
    LogicalExpire,

    /// **Mutex**: Single-flight rebuild under a distributed lock.
    ///
    /// Flow:
    /// 1. Check cache
    /// 2. If hit or tombstone: as PassThrough
    /// 3. If miss: take the lock, re-check, load, store, release
    /// 4. If the lock is busy: wait and start over
    Mutex,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::PassThrough => write!(f, "PassThrough"),
            CacheStrategy::LogicalExpire => write!(f, "LogicalExpire"),
            CacheStrategy::Mutex => write!(f, "Mutex"),
        }
    }
}

impl FromStr for CacheStrategy {
    type Err = Error;

    /// Parse a strategy name as written in configuration files.
    ///
    /// Accepts the `Display` form and snake/kebab-case spellings,
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();

        match normalized.as_str() {
            "passthrough" => Ok(CacheStrategy::PassThrough),
            "logicalexpire" | "logicalexpiry" => Ok(CacheStrategy::LogicalExpire),
            "mutex" => Ok(CacheStrategy::Mutex),
            _ => Err(Error::ConfigError(format!("unknown cache strategy: {}", s))),
        }
    }
}
