//! In-process storage medium with a fixed byte capacity.
//!
//! Clones of a [`MemoryBackend`] share the same underlying map, the way every context
//! of one origin shares one persistent store.

use super::StorageBackend;
use crate::error::BackendError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct State {
    data: HashMap<String, String>,
    /// Sum of key + value bytes over `data`
    used: usize,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<State>,
    capacity: Option<usize>,
    available: AtomicBool,
}

/// A thread-safe, optionally bounded, in-memory medium.
///
/// # Example
///
/// ```
/// use flashstore::backend::{MemoryBackend, StorageBackend};
///
/// let medium = MemoryBackend::with_capacity(16);
/// medium.set("k", "value").unwrap();
/// assert!(medium.set("big", &"x".repeat(32)).is_err());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Creates an unbounded medium.
    pub fn new() -> Self {
        Self::build(None, true)
    }

    /// Creates a medium holding at most `capacity` bytes of keys and values.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity), true)
    }

    /// Creates a medium that rejects every call, like storage disabled by the host.
    pub fn unavailable() -> Self {
        Self::build(None, false)
    }

    fn build(capacity: Option<usize>, available: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                capacity,
                available: AtomicBool::new(available),
            }),
        }
    }

    /// Switches the medium on or off for every handle sharing it.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::Relaxed);
    }

    /// Bytes currently held (keys + values).
    pub fn used_bytes(&self) -> usize {
        self.inner.state.read().used
    }

    /// Configured capacity, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Number of physical records.
    pub fn len(&self) -> usize {
        self.inner.state.read().data.len()
    }

    /// Returns true if the medium holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn ensure_available(&self) -> Result<(), BackendError> {
        if self.inner.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(BackendError::Unavailable("memory medium is switched off".into()))
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.ensure_available()?;
        Ok(self.inner.state.read().data.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.ensure_available()?;
        let mut state = self.inner.state.write();

        let needed = key.len() + value.len();
        let released = state
            .data
            .get(key)
            .map(|old| key.len() + old.len())
            .unwrap_or(0);
        let used_without = state.used - released;

        if let Some(capacity) = self.inner.capacity {
            if used_without + needed > capacity {
                return Err(BackendError::QuotaExceeded {
                    needed,
                    available: capacity.saturating_sub(used_without),
                });
            }
        }

        state.data.insert(key.to_string(), value.to_string());
        state.used = used_without + needed;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.ensure_available()?;
        let mut state = self.inner.state.write();
        if let Some(old) = state.data.remove(key) {
            state.used -= key.len() + old.len();
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        self.ensure_available()?;
        Ok(self.inner.state.read().data.keys().cloned().collect())
    }
}
