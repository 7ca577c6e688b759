//! Cross-context change signal as an explicit decorator.
//!
//! [`SignalingBackend`] wraps any medium and publishes a [`MediumSignal`] after every
//! successful mutation. Each handle is one execution context; [`SignalingBackend::attach`]
//! creates another context over the same medium and signal channel.

use super::{ContextId, MediumSignal, RemoteSignals, StorageBackend};
use crate::error::BackendError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of undelivered signals a slow context may fall behind by.
const DEFAULT_SIGNAL_CAPACITY: usize = 256;

/// A medium decorator that announces mutations to the other attached contexts.
///
/// # Example
///
/// ```
/// use flashstore::backend::{MemoryBackend, SignalingBackend, StorageBackend};
///
/// let tab_a = SignalingBackend::new(MemoryBackend::new());
/// let tab_b = tab_a.attach();
///
/// tab_a.set("k", "v").unwrap();
/// assert_eq!(tab_b.get("k").unwrap(), Some("v".to_string()));
/// assert_ne!(tab_a.context(), tab_b.context());
/// ```
#[derive(Debug)]
pub struct SignalingBackend {
    inner: Arc<dyn StorageBackend>,
    tx: broadcast::Sender<Arc<MediumSignal>>,
    context: ContextId,
    next_context: Arc<AtomicU64>,
}

impl SignalingBackend {
    /// Wraps `inner` as the first context of a new shared medium.
    pub fn new(inner: impl StorageBackend + 'static) -> Self {
        Self::with_signal_capacity(inner, DEFAULT_SIGNAL_CAPACITY)
    }

    /// Like [`new`](Self::new) with an explicit signal buffer size.
    pub fn with_signal_capacity(inner: impl StorageBackend + 'static, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(inner),
            tx,
            context: 0,
            next_context: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attaches a new execution context to the same medium.
    pub fn attach(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            tx: self.tx.clone(),
            context: self.next_context.fetch_add(1, Ordering::Relaxed),
            next_context: Arc::clone(&self.next_context),
        }
    }

    /// This handle's context id.
    pub fn context(&self) -> ContextId {
        self.context
    }

    #[inline]
    fn has_listeners(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        let signal = MediumSignal {
            key: key.to_string(),
            old_value,
            new_value,
            source: self.context,
        };
        // No receivers left is not an error for the writer
        let delivered = self.tx.send(Arc::new(signal)).unwrap_or(0);
        trace!(key = %key, context = self.context, delivered = delivered, "Medium signal published");
    }
}

impl StorageBackend for SignalingBackend {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        if !self.has_listeners() {
            return self.inner.set(key, value);
        }
        let old = self.inner.get(key)?;
        self.inner.set(key, value)?;
        self.publish(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        if !self.has_listeners() {
            return self.inner.remove(key);
        }
        let old = self.inner.get(key)?;
        self.inner.remove(key)?;
        if old.is_some() {
            self.publish(key, old, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        self.inner.keys()
    }

    fn byte_len(&self, s: &str) -> usize {
        self.inner.byte_len(s)
    }

    fn probe(&self) -> Result<(), BackendError> {
        self.inner.probe()
    }

    fn watch(&self) -> Option<RemoteSignals> {
        Some(RemoteSignals::new(self.tx.subscribe(), self.context))
    }
}
