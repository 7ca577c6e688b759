//! Error types for FlashStore.
//!
//! Each layer has its own error enum. Errors travel with `?` between layers and are
//! turned into the documented failure values (`false`, the caller's default, `None`)
//! at the public [`Store`](crate::Store) boundary.

use thiserror::Error;

/// Errors raised by a [`StorageBackend`](crate::backend::StorageBackend).
#[derive(Debug, Error)]
pub enum BackendError {
    /// The medium has no room for the write
    #[error("storage quota exceeded: {needed} bytes requested, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    /// The medium cannot be used at all (disabled, restricted, detached)
    #[error("storage medium unavailable: {0}")]
    Unavailable(String),

    /// Underlying I/O failure of a persistent medium
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The medium's own on-disk representation is corrupt
    #[error("medium serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Returns true for the capacity signal, the only recoverable backend failure.
    #[inline]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

/// Errors raised while encoding or decoding a stored value.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The obfuscated payload is not valid for the obfuscation stage
    #[error("obfuscation decode failed: {0}")]
    Obfuscation(#[from] base64::DecodeError),

    /// The de-obfuscated bytes are not UTF-8
    #[error("decoded value is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// JSON serialization of the caller's value failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the store internals.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The logical key cannot be mapped to physical keys
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// The store configuration was rejected at construction
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The backend refused the operation
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A value could not be encoded or decoded
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A snapshot handed to import is not a conforming document
    #[error("malformed snapshot: {0}")]
    ImportFormat(String),

    /// The store runs in the disabled state
    #[error("store is disabled: backing medium unavailable")]
    Disabled,
}

impl StoreError {
    /// Returns true if the error is the backend's capacity signal.
    #[inline]
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_quota_exceeded())
    }
}

/// Result type for store internals.
pub type StoreResult<T> = Result<T, StoreError>;
