//! Namespace-scoped access to the backend.
//!
//! Every physical read and write of a store goes through [`Medium`], which owns the
//! disabled state: the medium is probed once at construction, and any non-quota
//! backend failure later on switches the whole store off.

use crate::backend::{RemoteSignals, StorageBackend};
use crate::error::{BackendError, StoreError, StoreResult};
use crate::keys::{KeyCodec, PhysicalKeys};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug)]
pub(crate) struct Medium {
    backend: Arc<dyn StorageBackend>,
    keys: KeyCodec,
    disabled: AtomicBool,
}

impl Medium {
    pub(crate) fn new(backend: Arc<dyn StorageBackend>, keys: KeyCodec) -> Self {
        let disabled = match backend.probe() {
            Ok(()) => false,
            Err(e) => {
                warn!(prefix = %keys.prefix(), error = %e, "Storage medium unavailable, store disabled");
                true
            }
        };
        Self {
            backend,
            keys,
            disabled: AtomicBool::new(disabled),
        }
    }

    #[inline]
    pub(crate) fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn ensure_enabled(&self) -> StoreResult<()> {
        if self.is_disabled() {
            Err(StoreError::Disabled)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub(crate) fn keys(&self) -> &KeyCodec {
        &self.keys
    }

    /// Maps a backend failure, downgrading the store unless it is a quota signal.
    fn fail(&self, err: BackendError) -> StoreError {
        if !err.is_quota_exceeded() && !self.disabled.swap(true, Ordering::Relaxed) {
            warn!(prefix = %self.keys.prefix(), error = %err, "Storage medium failed, store disabled");
        }
        StoreError::Backend(err)
    }

    pub(crate) fn get(&self, physical: &str) -> StoreResult<Option<String>> {
        self.ensure_enabled()?;
        self.backend.get(physical).map_err(|e| self.fail(e))
    }

    pub(crate) fn set(&self, physical: &str, value: &str) -> StoreResult<()> {
        self.ensure_enabled()?;
        trace!(key = %physical, bytes = value.len(), "Medium write");
        self.backend.set(physical, value).map_err(|e| self.fail(e))
    }

    pub(crate) fn remove(&self, physical: &str) -> StoreResult<()> {
        self.ensure_enabled()?;
        self.backend.remove(physical).map_err(|e| self.fail(e))
    }

    /// Removes the value, expiry and metadata records of one entry.
    pub(crate) fn remove_entry(&self, keys: &PhysicalKeys) -> StoreResult<()> {
        for physical in keys.all() {
            self.remove(physical)?;
        }
        Ok(())
    }

    /// Every physical key inside this namespace.
    pub(crate) fn namespace_keys(&self) -> StoreResult<Vec<String>> {
        self.ensure_enabled()?;
        let all = self.backend.keys().map_err(|e| self.fail(e))?;
        Ok(all.into_iter().filter(|k| self.keys.owns(k)).collect())
    }

    #[inline]
    pub(crate) fn byte_len(&self, s: &str) -> usize {
        self.backend.byte_len(s)
    }

    pub(crate) fn watch(&self) -> Option<RemoteSignals> {
        self.backend.watch()
    }
}
