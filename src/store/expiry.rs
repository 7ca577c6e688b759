//! Time-To-Live handling
//!
//! Entries with a TTL carry an expiry record holding an absolute epoch-millisecond
//! timestamp. Expired entries are removed in two ways:
//!
//! 1. **Lazy**: `get`/`has` check the expiry record and evict before answering
//! 2. **Active**: [`Store::cleanup_expired`] sweeps every expiry record of the
//!    namespace; [`Maintenance`] runs that sweep periodically in the background
//!
//! ## Adaptive Frequency
//!
//! If many entries are expiring, the maintenance task runs more frequently.
//! If few are, it backs off to save CPU.

use super::medium::Medium;
use super::{now_ms, Store};
use crate::error::StoreResult;
use crate::keys::{PhysicalKeys, Record};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Reads, writes and sweeps expiry records.
#[derive(Debug)]
pub(crate) struct TtlManager {
    medium: Arc<Medium>,
}

impl TtlManager {
    pub(crate) fn new(medium: Arc<Medium>) -> Self {
        Self { medium }
    }

    /// Expiry timestamp for a TTL starting now.
    pub(crate) fn deadline(ttl: Duration) -> u64 {
        now_ms().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
    }

    /// Reads the expiry timestamp of an entry.
    ///
    /// An unreadable record is logged and treated as "no expiry".
    pub(crate) fn expires_at(&self, keys: &PhysicalKeys) -> StoreResult<Option<u64>> {
        let Some(raw) = self.medium.get(&keys.expiry)? else {
            return Ok(None);
        };
        match raw.trim().parse::<u64>() {
            Ok(at) => Ok(Some(at)),
            Err(e) => {
                warn!(key = %keys.expiry, error = %e, "Corrupt expiry record ignored");
                Ok(None)
            }
        }
    }

    /// Returns true if the entry has an expiry that has passed.
    pub(crate) fn is_expired(&self, keys: &PhysicalKeys) -> StoreResult<bool> {
        Ok(self
            .expires_at(keys)?
            .map(|at| now_ms() > at)
            .unwrap_or(false))
    }

    /// Remaining lifetime of an entry, `None` if it never expires.
    pub(crate) fn remaining(&self, keys: &PhysicalKeys) -> StoreResult<Option<Duration>> {
        Ok(self
            .expires_at(keys)?
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms()))))
    }

    /// Removes every entry of the namespace whose expiry has passed.
    ///
    /// Returns the logical keys that were removed with their last stored value.
    pub(crate) fn sweep(&self) -> StoreResult<Vec<(String, Option<String>)>> {
        let now = now_ms();
        let codec = self.medium.keys();
        let mut removed = Vec::new();

        for physical in self.medium.namespace_keys()? {
            let Some(Record::Expiry(logical)) = codec.classify(&physical) else {
                continue;
            };
            let expired = self
                .medium
                .get(&physical)?
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .map(|at| now > at)
                .unwrap_or(false);
            if !expired {
                continue;
            }

            match codec.derive(logical) {
                Ok(keys) => {
                    let old = self.medium.get(&keys.value)?;
                    self.medium.remove_entry(&keys)?;
                    removed.push((logical.to_string(), old));
                }
                // A record this store could never have written
                Err(_) => self.medium.remove(&physical)?,
            }
        }

        if !removed.is_empty() {
            debug!(removed = removed.len(), "Expired entries swept");
        }
        Ok(removed)
    }
}

/// Configuration for the background maintenance task.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// Base interval between runs (default: 1s)
    pub base_interval: Duration,

    /// Minimum interval between runs (default: 100ms)
    pub min_interval: Duration,

    /// Maximum interval between runs (default: 30s)
    pub max_interval: Duration,

    /// If this fraction of entries expired in a run, speed up
    pub speedup_threshold: f64,

    /// If this fraction of entries expired in a run, slow down
    pub slowdown_threshold: f64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(1),
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            speedup_threshold: 0.25,  // Speed up if >25% of entries expired
            slowdown_threshold: 0.01, // Slow down if <1% of entries expired
        }
    }
}

/// A handle to the running maintenance task.
///
/// Each run sweeps expired entries and performs the deferred quota check.
/// When this handle is dropped, the task is stopped.
#[derive(Debug)]
pub struct Maintenance {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl Maintenance {
    /// Starts the maintenance task on the current tokio runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use flashstore::{Maintenance, MaintenanceConfig, Store, StoreConfig};
    /// use flashstore::backend::MemoryBackend;
    /// use std::sync::Arc;
    ///
    /// let store = Arc::new(Store::new(MemoryBackend::new(), StoreConfig::default())?);
    /// let maintenance = Maintenance::start(Arc::clone(&store), MaintenanceConfig::default());
    ///
    /// // Runs in the background...
    ///
    /// drop(maintenance);
    /// ```
    pub fn start(store: Arc<Store>, config: MaintenanceConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(maintenance_loop(store, config, shutdown_rx));

        info!("Background maintenance started");

        Self { shutdown_tx }
    }

    /// Stops the task. This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("Background maintenance stopped");
    }
}

impl Drop for Maintenance {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn maintenance_loop(
    store: Arc<Store>,
    config: MaintenanceConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Maintenance received shutdown signal");
                    return;
                }
            }
        }

        let entries_before = store.keys(None).len();
        let expired = store.cleanup_expired();
        store.check_quota();

        if entries_before > 0 {
            let expiry_rate = expired as f64 / entries_before as f64;

            if expiry_rate > config.speedup_threshold {
                current_interval = (current_interval / 2).max(config.min_interval);
                debug!(
                    expired = expired,
                    rate = %format!("{:.2}%", expiry_rate * 100.0),
                    new_interval_ms = current_interval.as_millis(),
                    "High expiry rate, speeding up maintenance"
                );
            } else if expiry_rate < config.slowdown_threshold && expired == 0 {
                current_interval = (current_interval * 2).min(config.max_interval);
                trace!(
                    new_interval_ms = current_interval.as_millis(),
                    "Low expiry rate, slowing down maintenance"
                );
            }
        }
    }
}
