//! Cache key derivation.

use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default suffix appended to a cache key to form its lock key.
pub const LOCK_SUFFIX: &str = "_lock";

/// Builder for cache keys.
pub struct CacheKeyBuilder;

impl CacheKeyBuilder {
    /// Build the cache key for `id` under `prefix`.
    ///
    /// - `None` (or an id that serializes to `null`) yields `prefix` unchanged
    /// - numbers, booleans and plain strings are appended as their string form
    /// - anything else is appended as the SHA-256 hex digest of its JSON encoding
    ///
    /// A string whose content is itself a JSON object or array is digested
    /// rather than appended, so that structured ids smuggled in as text
    /// cannot produce unbounded or delimiter-laden keys.
    ///
    /// # Example
    ///
    /// ```
    /// use cache_shield::key::CacheKeyBuilder;
    ///
    /// let key = CacheKeyBuilder::build("user:", Some(&42u64)).unwrap();
    /// assert_eq!(key, "user:42");
    ///
    /// let key = CacheKeyBuilder::build::<u64>("users:all", None).unwrap();
    /// assert_eq!(key, "users:all");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if `id` cannot be serialized.
    pub fn build<I: Serialize + ?Sized>(prefix: &str, id: Option<&I>) -> Result<String> {
        let id = match id {
            Some(id) => id,
            None => return Ok(prefix.to_string()),
        };

        let value = serde_json::to_value(id).map_err(|e| {
            Error::SerializationError(format!("Failed to encode cache id: {}", e))
        })?;

        let suffix = match value {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) if is_json_document(&s) => Self::digest(&s),
            Value::String(s) => s,
            structured => Self::digest(&structured.to_string()),
        };

        Ok(format!("{}{}", prefix, suffix))
    }

    /// Lock key guarding rebuilds of `cache_key`.
    pub fn lock_key(cache_key: &str, suffix: &str) -> String {
        format!("{}{}", cache_key, suffix)
    }

    /// SHA-256 hex digest of `text`.
    pub fn digest(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }
}

fn is_json_document(s: &str) -> bool {
    let trimmed = s.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return false;
    }
    matches!(
        serde_json::from_str::<Value>(s),
        Ok(Value::Object(_)) | Ok(Value::Array(_))
    )
}
