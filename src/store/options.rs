//! Store configuration and per-call options.

use crate::error::{StoreError, StoreResult};
use crate::keys::{EXPIRY_INFIX, META_INFIX};
use std::time::Duration;

/// Default namespace prefix.
pub const DEFAULT_PREFIX: &str = "app_";

/// Default quota: the common 5 MiB per-origin budget.
pub const DEFAULT_MAX_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Default fraction of the quota at which warnings start.
pub const DEFAULT_WARNING_FRACTION: f64 = 0.8;

/// How a value is read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    /// Undo the obfuscation stage (default: false)
    pub decrypt: bool,
    /// Parse the stored text as JSON, falling back to the raw string (default: true)
    pub parse_json: bool,
    /// Apply lazy expiry before reading (default: true)
    pub check_expiry: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            decrypt: false,
            parse_json: true,
            check_expiry: true,
        }
    }
}

impl ReadOptions {
    /// Default options with decryption switched on.
    pub fn decrypted() -> Self {
        Self {
            decrypt: true,
            ..Self::default()
        }
    }
}

/// How a value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// JSON-serialize the value (default: true)
    pub stringify: bool,
    /// Apply the obfuscation stage (default: false)
    pub encrypt: bool,
    /// Time-to-live of the entry (default: none)
    pub ttl: Option<Duration>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            stringify: true,
            encrypt: false,
            ttl: None,
        }
    }
}

impl WriteOptions {
    /// Default options with a time-to-live.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::default()
        }
    }

    /// Default options with the obfuscation stage.
    pub fn encrypted() -> Self {
        Self {
            encrypt: true,
            ..Self::default()
        }
    }
}

/// Options of [`Store::import_data`](crate::Store::import_data).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Replace entries that already exist (default: false)
    pub overwrite: bool,
}

/// Construction-time configuration of a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Namespace prefix of every physical key
    pub prefix: String,
    /// Quota used for usage percentage and warnings
    pub max_size_bytes: usize,
    /// Usage fraction at which the store reports near-quota
    pub warning_fraction: f64,
    /// Read options used by the option-less accessors
    pub read: ReadOptions,
    /// Write options used by the option-less mutators
    pub write: WriteOptions,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            warning_fraction: DEFAULT_WARNING_FRACTION,
            read: ReadOptions::default(),
            write: WriteOptions::default(),
        }
    }
}

impl StoreConfig {
    /// Default configuration under `prefix`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..Self::default()
        }
    }

    /// Sets the quota.
    pub fn max_size_bytes(mut self, bytes: usize) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    /// Sets the warning fraction.
    pub fn warning_fraction(mut self, fraction: f64) -> Self {
        self.warning_fraction = fraction;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] when the prefix is empty or holds a record
    /// infix, the quota is zero, or the warning fraction is outside `(0, 1]`.
    pub fn validate(&self) -> StoreResult<()> {
        if self.prefix.is_empty() {
            return Err(StoreError::InvalidConfig("prefix must not be empty".into()));
        }
        if self.prefix.contains(EXPIRY_INFIX) || self.prefix.contains(META_INFIX) {
            return Err(StoreError::InvalidConfig(format!(
                "prefix {:?} contains a reserved record infix",
                self.prefix
            )));
        }
        if self.max_size_bytes == 0 {
            return Err(StoreError::InvalidConfig("max_size_bytes must be positive".into()));
        }
        if !(self.warning_fraction > 0.0 && self.warning_fraction <= 1.0) {
            return Err(StoreError::InvalidConfig(format!(
                "warning_fraction {} is outside (0, 1]",
                self.warning_fraction
            )));
        }
        Ok(())
    }
}
