//! String codec for values held in the cache store.
//!
//! Every stored value is one of:
//!
//! ```text
//! ┌──────────────┬────────────────────────────┬──────────────────────────────┐
//! │ Scalar       │ literal string form        │ 42 / true / ann              │
//! │ Structured   │ JSON document              │ {"id":42,"name":"ann"}       │
//! │ Tombstone    │ empty string               │ (source has no data)         │
//! └──────────────┴────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! Values written by the logical-expiry strategy are additionally wrapped
//! in a [`LogicalEntry`] JSON envelope carrying their expiry timestamp.
//!
//! The shape used for a type is fixed by [`CacheValue::SHAPE`]; the caller
//! always names the target type when decoding, so nothing here guesses a
//! value's kind from its content.
//!
//! # Example
//!
//! ```rust
//! use cache_shield::serialization::{decode, encode};
//! use cache_shield::CacheValue;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct User {
//!     id: u64,
//!     name: String,
//! }
//!
//! impl CacheValue for User {}
//!
//! # fn main() -> cache_shield::Result<()> {
//! let user = User { id: 1, name: "ann".to_string() };
//! let stored = encode(&user)?.into_string();
//! assert_eq!(stored, r#"{"id":1,"name":"ann"}"#);
//!
//! let decoded: Option<User> = decode(&stored)?;
//! assert_eq!(decoded, Some(user));
//!
//! assert_eq!(encode(&42u32)?.into_string(), "42");
//! # Ok(())
//! # }
//! ```

use crate::error::{Error, Result};
use crate::value::{CacheValue, Shape};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Stored marker meaning "the backing source confirmed there is no data".
///
/// Distinct from an absent key: a read of a tombstone returns `Some("")`.
pub const TOMBSTONE: &str = "";

/// A value encoded for storage, tagged with the shape it was encoded as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Encoded {
    /// Literal string form of a scalar.
    Scalar(String),
    /// JSON document.
    Structured(String),
}

impl Encoded {
    /// Shape this value was encoded with.
    pub fn shape(&self) -> Shape {
        match self {
            Encoded::Scalar(_) => Shape::Scalar,
            Encoded::Structured(_) => Shape::Structured,
        }
    }

    /// Borrow the stored string.
    pub fn as_str(&self) -> &str {
        match self {
            Encoded::Scalar(s) | Encoded::Structured(s) => s,
        }
    }

    /// Take the stored string.
    pub fn into_string(self) -> String {
        match self {
            Encoded::Scalar(s) | Encoded::Structured(s) => s,
        }
    }
}

/// Returns true for the tombstone marker.
pub fn is_tombstone(stored: &str) -> bool {
    stored.is_empty()
}

/// Encode a value for the cache store.
///
/// # Errors
///
/// Returns `Error::SerializationError` if the value cannot be serialized,
/// or if a `Shape::Scalar` type serializes to something other than a
/// string, number or boolean.
pub fn encode<T: CacheValue>(value: &T) -> Result<Encoded> {
    match T::SHAPE {
        Shape::Scalar => {
            let json = serde_json::to_value(value).map_err(serialization_error)?;
            match json {
                Value::String(s) => Ok(Encoded::Scalar(s)),
                Value::Number(n) => Ok(Encoded::Scalar(n.to_string())),
                Value::Bool(b) => Ok(Encoded::Scalar(b.to_string())),
                other => Err(Error::SerializationError(format!(
                    "Scalar type {} encoded as non-scalar JSON: {}",
                    std::any::type_name::<T>(),
                    other
                ))),
            }
        }
        Shape::Structured => serde_json::to_string(value)
            .map(Encoded::Structured)
            .map_err(serialization_error),
    }
}

/// Encode a sequence of values as a JSON array.
///
/// # Errors
///
/// Returns `Error::SerializationError` if any element cannot be serialized.
pub fn encode_list<T: CacheValue>(values: &[T]) -> Result<Encoded> {
    serde_json::to_string(values)
        .map(Encoded::Structured)
        .map_err(serialization_error)
}

/// Decode a stored value into `T`.
///
/// Returns `Ok(None)` for the tombstone.
///
/// # Errors
///
/// Returns `Error::DeserializationError` if the stored string is not a
/// valid encoding of `T`.
pub fn decode<T: CacheValue>(stored: &str) -> Result<Option<T>> {
    if is_tombstone(stored) {
        return Ok(None);
    }

    match T::SHAPE {
        Shape::Scalar => decode_scalar(stored).map(Some),
        Shape::Structured => serde_json::from_str(stored)
            .map(Some)
            .map_err(|e| deserialization_error(std::any::type_name::<T>(), e)),
    }
}

/// Decode a stored JSON array into a `Vec<T>`, element by element.
///
/// Returns `Ok(None)` for the tombstone.
///
/// # Errors
///
/// Returns `Error::DeserializationError` if the stored string is not a JSON
/// array or any element is not a valid `T`.
pub fn decode_list<T: CacheValue>(stored: &str) -> Result<Option<Vec<T>>> {
    if is_tombstone(stored) {
        return Ok(None);
    }

    let elements: Vec<Value> = serde_json::from_str(stored)
        .map_err(|e| deserialization_error("JSON array", e))?;
    elements_from_values(elements).map(Some)
}

fn decode_scalar<T: CacheValue>(stored: &str) -> Result<T> {
    // Text-like scalars (String, char) take the raw string; numbers and
    // booleans parse from their literal form.
    if let Ok(value) = serde_json::from_value::<T>(Value::String(stored.to_string())) {
        return Ok(value);
    }
    serde_json::from_str::<T>(stored).map_err(|e| deserialization_error(std::any::type_name::<T>(), e))
}

fn elements_from_values<T: CacheValue>(elements: Vec<Value>) -> Result<Vec<T>> {
    elements
        .into_iter()
        .map(|element| {
            serde_json::from_value(element)
                .map_err(|e| deserialization_error(std::any::type_name::<T>(), e))
        })
        .collect()
}

fn serialization_error(e: serde_json::Error) -> Error {
    error!("Cache serialization failed: {}", e);
    Error::SerializationError(e.to_string())
}

fn deserialization_error(target: &str, e: serde_json::Error) -> Error {
    error!("Cache deserialization into {} failed: {}", target, e);
    Error::DeserializationError(format!("{}: {}", target, e))
}

// ============================================================================
// Logical expiry envelope
// ============================================================================

/// Envelope written by the logical-expiry strategy.
///
/// ```text
/// {"data": <payload JSON>, "expire_time": "2026-10-14T09:30:00Z"}
/// ```
///
/// `expire_time` is fixed when the entry is written; the only way to move it
/// is to write a new entry. The envelope itself is stored without a physical
/// TTL.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogicalEntry {
    /// Payload in JSON form.
    pub data: Value,
    /// Instant after which the payload counts as stale.
    pub expire_time: DateTime<Utc>,
}

impl LogicalEntry {
    /// Wrap `value` with an expiry of `now + logical_ttl`.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if the value cannot be serialized.
    pub fn wrap<T: Serialize + ?Sized>(value: &T, logical_ttl: Duration) -> Result<Self> {
        let data = serde_json::to_value(value).map_err(serialization_error)?;
        Ok(LogicalEntry {
            data,
            expire_time: expire_at(Utc::now(), logical_ttl),
        })
    }

    /// True once `now` has reached `expire_time`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expire_time <= now
    }

    /// True once the current wall-clock time has reached `expire_time`.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Encode the envelope for storage.
    ///
    /// # Errors
    ///
    /// Returns `Error::SerializationError` if JSON encoding fails.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(serialization_error)
    }

    /// Decode an envelope from its stored form.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationError` if `stored` is not an envelope.
    pub fn decode(stored: &str) -> Result<Self> {
        serde_json::from_str(stored).map_err(|e| deserialization_error("LogicalEntry", e))
    }

    /// Decode the payload into `T`. A `null` payload yields `None`.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationError` if the payload is not a valid `T`.
    pub fn payload<T: CacheValue>(&self) -> Result<Option<T>> {
        if self.data.is_null() {
            return Ok(None);
        }
        serde_json::from_value(self.data.clone())
            .map(Some)
            .map_err(|e| deserialization_error(std::any::type_name::<T>(), e))
    }

    /// Decode a JSON array payload into `Vec<T>`, element by element.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeserializationError` if the payload is not an array
    /// or any element is not a valid `T`.
    pub fn payload_list<T: CacheValue>(&self) -> Result<Option<Vec<T>>> {
        match &self.data {
            Value::Null => Ok(None),
            Value::Array(elements) => elements_from_values(elements.clone()).map(Some),
            other => Err(Error::DeserializationError(format!(
                "Expected JSON array payload, found {}",
                other
            ))),
        }
    }
}

/// Longest logical TTL honoured; larger values are clamped.
const MAX_LOGICAL_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expire_at(now: DateTime<Utc>, logical_ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(logical_ttl.min(MAX_LOGICAL_TTL))
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
    struct User {
        id: u64,
        name: String,
    }

    impl CacheValue for User {}

    #[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
    struct Wrapped(Vec<u8>);

    impl CacheValue for Wrapped {
        const SHAPE: Shape = Shape::Scalar;
    }

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&42u32).unwrap(), Encoded::Scalar("42".to_string()));
        assert_eq!(encode(&-7i64).unwrap().as_str(), "-7");
        assert_eq!(encode(&true).unwrap().as_str(), "true");
        assert_eq!(encode(&'x').unwrap().as_str(), "x");
        assert_eq!(encode(&"ann".to_string()).unwrap().as_str(), "ann");
    }

    #[test]
    fn test_encode_structured() {
        let user = User {
            id: 42,
            name: "ann".to_string(),
        };
        let encoded = encode(&user).unwrap();
        assert_eq!(encoded.shape(), Shape::Structured);
        assert_eq!(encoded.as_str(), r#"{"id":42,"name":"ann"}"#);
    }

    #[test]
    fn test_encode_scalar_with_structured_json_fails() {
        let result = encode(&Wrapped(vec![1, 2]));
        assert!(matches!(result, Err(Error::SerializationError(_))));
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode::<u32>("42").unwrap(), Some(42));
        assert_eq!(decode::<f64>("1.5").unwrap(), Some(1.5));
        assert_eq!(decode::<bool>("false").unwrap(), Some(false));
        assert_eq!(decode::<String>("ann").unwrap(), Some("ann".to_string()));
        // Strings that look like other scalars stay strings
        assert_eq!(decode::<String>("42").unwrap(), Some("42".to_string()));
        assert_eq!(decode::<String>("true").unwrap(), Some("true".to_string()));
    }

    #[test]
    fn test_decode_tombstone_is_none() {
        assert_eq!(decode::<u32>(TOMBSTONE).unwrap(), None);
        assert_eq!(decode::<User>(TOMBSTONE).unwrap(), None);
        assert_eq!(decode_list::<User>(TOMBSTONE).unwrap(), None);
    }

    #[test]
    fn test_decode_malformed_is_error() {
        assert!(matches!(
            decode::<u32>("forty-two"),
            Err(Error::DeserializationError(_))
        ));
        assert!(matches!(
            decode::<User>("{\"id\": \"x\"}"),
            Err(Error::DeserializationError(_))
        ));
        assert!(matches!(
            decode_list::<u32>("{\"not\":\"a list\"}"),
            Err(Error::DeserializationError(_))
        ));
    }

    #[test]
    fn test_list_preserves_order() {
        let users = vec![
            User {
                id: 3,
                name: "c".to_string(),
            },
            User {
                id: 1,
                name: "a".to_string(),
            },
        ];
        let stored = encode_list(&users).unwrap().into_string();
        assert_eq!(decode_list::<User>(&stored).unwrap(), Some(users));

        let ids = vec![0u32, 0, 7];
        let stored = encode_list(&ids).unwrap().into_string();
        assert_eq!(stored, "[0,0,7]");
        assert_eq!(decode_list::<u32>(&stored).unwrap(), Some(ids));
    }

    #[test]
    fn test_logical_entry_expiry() {
        let entry = LogicalEntry::wrap(&42u32, Duration::from_secs(60)).unwrap();
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.expire_time));
        assert!(entry.is_expired_at(entry.expire_time + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_logical_entry_encode_decode() {
        let user = User {
            id: 42,
            name: "ann".to_string(),
        };
        let entry = LogicalEntry::wrap(&user, Duration::from_secs(60)).unwrap();
        let stored = entry.encode().unwrap();
        let decoded = LogicalEntry::decode(&stored).unwrap();

        assert_eq!(decoded, entry);
        assert_eq!(decoded.payload::<User>().unwrap(), Some(user));
    }

    #[test]
    fn test_logical_entry_list_payload() {
        let entry = LogicalEntry::wrap(&vec![1u32, 2, 3], Duration::from_secs(1)).unwrap();
        assert_eq!(entry.payload_list::<u32>().unwrap(), Some(vec![1, 2, 3]));

        let scalar = LogicalEntry::wrap(&5u32, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            scalar.payload_list::<u32>(),
            Err(Error::DeserializationError(_))
        ));
    }

    #[test]
    fn test_logical_entry_rejects_plain_value() {
        assert!(matches!(
            LogicalEntry::decode("42"),
            Err(Error::DeserializationError(_))
        ));
    }

    #[test]
    fn test_huge_ttl_is_clamped() {
        let entry = LogicalEntry::wrap(&1u8, Duration::from_secs(u64::MAX)).unwrap();
        assert!(!entry.is_expired());

        let stored = entry.encode().unwrap();
        assert_eq!(LogicalEntry::decode(&stored).unwrap(), entry);
    }
}
