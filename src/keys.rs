//! Physical key derivation.
//!
//! One logical key `K` under prefix `P` owns up to three physical records:
//!
//! ```text
//! P + K             value
//! P + "expiry_" + K expiry timestamp (epoch ms)
//! P + "meta_" + K   metadata JSON
//! ```
//!
//! Logical keys may not start with one of the record infixes, otherwise the value
//! record of `"expiry_x"` would be the expiry record of `"x"`.

use crate::error::{StoreError, StoreResult};

/// Infix of the expiry record.
pub const EXPIRY_INFIX: &str = "expiry_";

/// Infix of the metadata record.
pub const META_INFIX: &str = "meta_";

/// The three physical keys of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalKeys {
    pub value: String,
    pub expiry: String,
    pub meta: String,
}

impl PhysicalKeys {
    /// All three keys, value first.
    pub fn all(&self) -> [&str; 3] {
        [&self.value, &self.expiry, &self.meta]
    }
}

/// What a physical key inside the namespace stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record<'a> {
    Value(&'a str),
    Expiry(&'a str),
    Meta(&'a str),
}

impl<'a> Record<'a> {
    /// The logical key the record belongs to.
    pub fn logical(&self) -> &'a str {
        match *self {
            Record::Value(k) | Record::Expiry(k) | Record::Meta(k) => k,
        }
    }
}

/// Maps logical keys to physical keys under one namespace prefix, and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Checks that `key` can be stored without colliding with another entry's records.
    pub fn validate(key: &str) -> StoreResult<()> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key is empty",
            });
        }
        if key.starts_with(EXPIRY_INFIX) || key.starts_with(META_INFIX) {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key starts with a reserved record infix",
            });
        }
        Ok(())
    }

    /// Derives the physical keys of `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidKey`] for keys rejected by [`validate`](Self::validate).
    pub fn derive(&self, key: &str) -> StoreResult<PhysicalKeys> {
        Self::validate(key)?;
        Ok(PhysicalKeys {
            value: format!("{}{}", self.prefix, key),
            expiry: format!("{}{}{}", self.prefix, EXPIRY_INFIX, key),
            meta: format!("{}{}{}", self.prefix, META_INFIX, key),
        })
    }

    /// Returns true if the physical key lies inside this namespace.
    #[inline]
    pub fn owns(&self, physical: &str) -> bool {
        physical.starts_with(&self.prefix)
    }

    /// Classifies a physical key, or `None` if it lies outside the namespace.
    pub fn classify<'a>(&self, physical: &'a str) -> Option<Record<'a>> {
        let rest = physical.strip_prefix(self.prefix.as_str())?;
        if let Some(key) = rest.strip_prefix(EXPIRY_INFIX) {
            return Some(Record::Expiry(key));
        }
        if let Some(key) = rest.strip_prefix(META_INFIX) {
            return Some(Record::Meta(key));
        }
        if rest.is_empty() {
            return None;
        }
        Some(Record::Value(rest))
    }

    /// Recovers the logical key from a physical value key.
    pub fn logical<'a>(&self, physical: &'a str) -> Option<&'a str> {
        match self.classify(physical)? {
            Record::Value(key) => Some(key),
            _ => None,
        }
    }
}
