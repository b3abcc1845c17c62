//! Value trait that every cached type must implement.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// How a value is represented in the cache store.
///
/// Decided once per type, so encoding and decoding never inspect values at
/// runtime to guess their kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Stored as its literal string form: `42`, `true`, `ann`.
    Scalar,
    /// Stored as a JSON document.
    Structured,
}

/// Trait for values that can be stored by the engine.
///
/// Scalars (all integer types, floats, `bool`, `char`, `String`) are
/// implemented here. Structured types opt in with an empty impl.
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use cache_shield::{CacheValue, Shape};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// pub struct User {
///     pub id: u64,
///     pub name: String,
/// }
///
/// impl CacheValue for User {}
///
/// assert_eq!(User::SHAPE, Shape::Structured);
/// assert_eq!(<u64 as CacheValue>::SHAPE, Shape::Scalar);
/// ```
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Storage representation for this type.
    const SHAPE: Shape = Shape::Structured;
}

macro_rules! scalar_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CacheValue for $ty {
                const SHAPE: Shape = Shape::Scalar;
            }
        )*
    };
}

scalar_value!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char, String);

impl<T: CacheValue> CacheValue for Vec<T> {}

impl CacheValue for serde_json::Value {}
