//! Change notification.
//!
//! Local mutations are delivered synchronously, inside the call that made them.
//! Mutations made by other contexts arrive through the backend's [`RemoteSignals`]
//! and are republished from a background task with [`Origin::Remote`].

use super::now_ms;
use crate::backend::RemoteSignals;
use crate::keys::{KeyCodec, Record};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What happened to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Set,
    Remove,
    Clear,
}

/// Where a change was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// This store instance
    Local,
    /// Another execution context sharing the medium
    Remote,
}

/// A change to one entry. Values are the stored (encoded) strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub timestamp: u64,
    pub origin: Origin,
}

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// A list of callbacks for events of type `E`.
pub(crate) struct Registry<E> {
    callbacks: RwLock<Vec<(u64, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> fmt::Debug for Registry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("callbacks", &self.callbacks.read().len())
            .finish()
    }
}

impl<E: 'static> Registry<E> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn subscribe<F>(self: &Arc<Self>, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.write().push((id, Arc::new(callback)));

        let registry: Weak<Self> = Arc::downgrade(self);
        Subscription {
            id,
            cancel: Some(Box::new(move || {
                registry
                    .upgrade()
                    .map(|r| r.unsubscribe(id))
                    .unwrap_or(false)
            })),
        }
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(cid, _)| *cid != id);
        callbacks.len() != before
    }

    /// Invokes every callback. The list is copied first so a callback may subscribe
    /// or unsubscribe without deadlocking.
    pub(crate) fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = self
            .callbacks
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.read().len()
    }
}

/// Handle returned by `subscribe`. Dropping it keeps the callback registered;
/// call [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Removes the callback. Returns false if it was already gone.
    pub fn unsubscribe(mut self) -> bool {
        self.cancel.take().map(|cancel| cancel()).unwrap_or(false)
    }
}

/// Publishes [`ChangeEvent`]s to subscribers.
#[derive(Debug)]
pub(crate) struct ChangeNotifier {
    registry: Arc<Registry<ChangeEvent>>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        Self {
            registry: Registry::new(),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe(callback)
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    /// Delivers a local change synchronously.
    pub(crate) fn notify_local(
        &self,
        key: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        kind: ChangeKind,
    ) {
        let event = ChangeEvent {
            key: key.to_string(),
            old_value,
            new_value,
            kind,
            timestamp: now_ms(),
            origin: Origin::Local,
        };
        trace!(key = %key, kind = ?kind, "Local change");
        self.registry.emit(&event);
    }

    /// Starts republishing remote signals for this namespace.
    ///
    /// Needs a current tokio runtime; without one, remote changes are not observed.
    pub(crate) fn listen_remote(
        &self,
        signals: RemoteSignals,
        keys: KeyCodec,
    ) -> Option<JoinHandle<()>> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                debug!(prefix = %keys.prefix(), "No tokio runtime, remote change events disabled");
                return None;
            }
        };
        let registry = Arc::downgrade(&self.registry);
        Some(handle.spawn(remote_loop(signals, keys, registry)))
    }
}

/// Turns foreign medium signals into remote change events.
async fn remote_loop(
    mut signals: RemoteSignals,
    keys: KeyCodec,
    registry: Weak<Registry<ChangeEvent>>,
) {
    while let Some(signal) = signals.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };

        // Expiry/metadata records and other namespaces are not entry changes
        let Some(Record::Value(key)) = keys.classify(&signal.key) else {
            continue;
        };

        let kind = if signal.new_value.is_some() {
            ChangeKind::Set
        } else {
            ChangeKind::Remove
        };
        debug!(key = %key, kind = ?kind, source = signal.source, "Remote change");

        registry.emit(&ChangeEvent {
            key: key.to_string(),
            old_value: signal.old_value.clone(),
            new_value: signal.new_value.clone(),
            kind,
            timestamp: now_ms(),
            origin: Origin::Remote,
        });
    }
    debug!(prefix = %keys.prefix(), "Remote change listener stopped");
}
