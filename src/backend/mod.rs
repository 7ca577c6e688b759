//! Storage Backend Module
//!
//! A backend is the raw persistent medium under a [`Store`](crate::Store): a flat,
//! synchronous, string-to-string map with a fixed capacity. Backends know nothing about
//! namespaces, expiry, metadata or value encoding.
//!
//! ## Implementations
//!
//! - [`MemoryBackend`]: in-process medium with an optional byte capacity
//! - [`FileBackend`]: JSON-file medium, saved atomically after each mutation
//! - [`SignalingBackend`]: decorator that publishes a [`MediumSignal`] for every
//!   mutation so other execution contexts sharing the medium can observe it
//!
//! ```text
//!   context A                        context B
//! ┌──────────────┐                 ┌──────────────┐
//! │    Store     │                 │    Store     │
//! └──────┬───────┘                 └──────▲───────┘
//!        │ set/remove                     │ RemoteSignals
//! ┌──────▼─────────────────────────────────┴───────┐
//! │            SignalingBackend (broadcast)        │
//! └──────────────────────┬─────────────────────────┘
//!                 ┌──────▼───────┐
//!                 │ MemoryBackend│
//!                 └──────────────┘
//! ```

pub mod file;
pub mod memory;
pub mod signaling;

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use signaling::SignalingBackend;

use crate::error::BackendError;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Key used to check that a medium accepts writes at all.
const PROBE_KEY: &str = "__flashstore_probe__";

/// The capability interface over a host persistent medium.
///
/// All primitives are assumed atomic at single-key granularity. A capacity failure
/// must be reported as [`BackendError::QuotaExceeded`]; every other error is treated
/// by the store as the medium becoming unavailable.
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Reads the raw string stored under `key`.
    fn get(&self, key: &str) -> Result<Option<String>, BackendError>;

    /// Writes `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<(), BackendError>;

    /// Removes `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Enumerates every physical key in the medium, in no particular order.
    fn keys(&self) -> Result<Vec<String>, BackendError>;

    /// Estimated number of bytes `s` occupies in the medium.
    fn byte_len(&self, s: &str) -> usize {
        s.len()
    }

    /// Checks once that the medium can be used.
    ///
    /// A full medium is still a usable medium, so a quota failure passes the probe.
    fn probe(&self) -> Result<(), BackendError> {
        match self.set(PROBE_KEY, PROBE_KEY) {
            Ok(()) => self.remove(PROBE_KEY),
            Err(e) if e.is_quota_exceeded() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Subscribes to mutations made by other execution contexts, when the medium has
    /// such a signal.
    fn watch(&self) -> Option<RemoteSignals> {
        None
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Arc<B> {
    fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, BackendError> {
        (**self).keys()
    }

    fn byte_len(&self, s: &str) -> usize {
        (**self).byte_len(s)
    }

    fn probe(&self) -> Result<(), BackendError> {
        (**self).probe()
    }

    fn watch(&self) -> Option<RemoteSignals> {
        (**self).watch()
    }
}

/// Identifies one execution context attached to a shared medium.
pub type ContextId = u64;

/// A physical mutation observed on the medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumSignal {
    /// Physical key that changed
    pub key: String,
    /// Raw value before the mutation
    pub old_value: Option<String>,
    /// Raw value after the mutation (`None` for a removal)
    pub new_value: Option<String>,
    /// Context that performed the mutation
    pub source: ContextId,
}

/// Receiver of medium signals produced by other contexts.
///
/// Signals produced by the receiving context itself are skipped, matching how a host
/// storage event is only delivered to the other contexts.
#[derive(Debug)]
pub struct RemoteSignals {
    rx: broadcast::Receiver<Arc<MediumSignal>>,
    context: ContextId,
}

impl RemoteSignals {
    pub(crate) fn new(rx: broadcast::Receiver<Arc<MediumSignal>>, context: ContextId) -> Self {
        Self { rx, context }
    }

    /// Waits for the next foreign signal. Returns `None` once the medium is gone.
    pub async fn recv(&mut self) -> Option<Arc<MediumSignal>> {
        loop {
            match self.rx.recv().await {
                Ok(signal) if signal.source == self.context => continue,
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed = missed, "Remote signal receiver lagged, signals dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
