//! Error types for the cache-aside engine.

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the cache-aside engine.
///
/// Lock contention is deliberately absent: a lock that cannot be acquired
/// within its bounded wait is a normal outcome that each strategy handles
/// itself (retry for mutex, silent abandon for background rebuilds).
#[derive(Debug, Clone)]
pub enum Error {
    /// Encoding a value for the cache store failed.
    ///
    /// Common causes:
    /// - A type declared `Shape::Scalar` serialized to an object or array
    /// - The value's `Serialize` implementation failed
    SerializationError(String),

    /// A stored value could not be decoded into the requested shape.
    ///
    /// This is fatal for the call and is never treated as a cache miss,
    /// since it means the store holds data of an unexpected type.
    ///
    /// **Recovery:** Evict the key and let the next read rebuild it.
    DeserializationError(String),

    /// Cache store error (Redis, Memcached, etc).
    ///
    /// Common causes:
    /// - Connection lost
    /// - Network timeout
    /// - Backend protocol error
    BackendError(String),

    /// Lock service failure.
    ///
    /// Raised only for I/O failures of the lock service itself, never
    /// because the lock is held by someone else.
    LockError(String),

    /// The caller-supplied loader failed.
    ///
    /// Propagated unchanged to pass-through and mutex callers. On the
    /// background rebuild path it is logged and the stale entry is kept.
    LoaderError(String),

    /// A wait was interrupted before it completed.
    ///
    /// Raised when the runtime or the executor goes away while a strategy
    /// is sleeping or waiting on a background task.
    Interrupted(String),

    /// A retry loop reached its attempt cap without producing a result.
    ///
    /// Returned by the mutex strategy under sustained lock contention and
    /// by the logical-expiry strategy when a cold key never gets seeded.
    RetryExhausted {
        /// Cache key the loop was polling
        key: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Invalid configuration.
    ///
    /// **Recovery:** Fix configuration and restart.
    ConfigError(String),

    /// Optional store operation not supported by this backend.
    NotImplemented(String),

    /// Generic error with custom message.
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::BackendError(msg) => write!(f, "Backend error: {}", msg),
            Error::LockError(msg) => write!(f, "Lock error: {}", msg),
            Error::LoaderError(msg) => write!(f, "Loader error: {}", msg),
            Error::Interrupted(msg) => write!(f, "Interrupted: {}", msg),
            Error::RetryExhausted { key, attempts } => {
                write!(f, "Retries exhausted for {} after {} attempts", key, attempts)
            }
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

// ============================================================================
// Conversions from other error types
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::BackendError(e.to_string())
        } else if e.is_syntax() || e.is_data() || e.is_eof() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::BackendError(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Interrupted(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::BackendError(format!("Redis error: {}", e))
    }
}
