//! Size and quota accounting.
//!
//! Usage is computed on demand by scanning the namespace; nothing is persisted.
//! After a successful write the recomputation is only scheduled, and runs on the
//! next [`Store::check_quota`](crate::Store::check_quota) (the maintenance task calls
//! it). A write refused for capacity triggers one expired-entry sweep and one retry.

use super::medium::Medium;
use super::notify::{Registry, Subscription};
use crate::error::StoreResult;
use crate::keys::Record;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Usage of one namespace at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub max_size_bytes: usize,
    pub warning_fraction: f64,
    /// Sum of key + value bytes over every record of the namespace
    pub current_size_bytes: usize,
    /// Number of entries (value records)
    pub item_count: usize,
    pub usage_percentage: f64,
    pub is_near_quota: bool,
}

impl QuotaState {
    fn new(max_size_bytes: usize, warning_fraction: f64, current_size_bytes: usize, item_count: usize) -> Self {
        let usage_percentage = current_size_bytes as f64 / max_size_bytes as f64 * 100.0;
        Self {
            max_size_bytes,
            warning_fraction,
            current_size_bytes,
            item_count,
            usage_percentage,
            is_near_quota: usage_percentage >= warning_fraction * 100.0,
        }
    }
}

/// Signals raised for quota observers.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaEvent {
    /// Usage crossed the warning fraction
    Warning(QuotaState),
    /// A write failed for capacity even after recovery
    Exceeded { key: String, state: QuotaState },
}

#[derive(Debug)]
pub(crate) struct QuotaMonitor {
    medium: Arc<Medium>,
    max_size_bytes: usize,
    warning_fraction: f64,
    observers: Arc<Registry<QuotaEvent>>,
    dirty: AtomicBool,
}

impl QuotaMonitor {
    pub(crate) fn new(medium: Arc<Medium>, max_size_bytes: usize, warning_fraction: f64) -> Self {
        Self {
            medium,
            max_size_bytes,
            warning_fraction,
            observers: Registry::new(),
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QuotaEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    /// State with nothing stored, reported while the store is disabled.
    pub(crate) fn empty_state(&self) -> QuotaState {
        QuotaState::new(self.max_size_bytes, self.warning_fraction, 0, 0)
    }

    /// Scans the namespace.
    pub(crate) fn compute_stats(&self) -> StoreResult<QuotaState> {
        let codec = self.medium.keys();
        let mut size = 0usize;
        let mut items = 0usize;

        for physical in self.medium.namespace_keys()? {
            let Some(value) = self.medium.get(&physical)? else {
                continue;
            };
            size += self.medium.byte_len(&physical) + self.medium.byte_len(&value);
            if matches!(codec.classify(&physical), Some(Record::Value(_))) {
                items += 1;
            }
        }

        Ok(QuotaState::new(self.max_size_bytes, self.warning_fraction, size, items))
    }

    /// Schedules a recomputation off the write path.
    #[inline]
    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Runs a scheduled recomputation, warning observers when near quota.
    pub(crate) fn run_deferred(&self) -> StoreResult<Option<QuotaState>> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(None);
        }
        let state = self.compute_stats()?;
        debug!(
            size = state.current_size_bytes,
            items = state.item_count,
            usage = %format!("{:.2}%", state.usage_percentage),
            "Quota recomputed"
        );
        if state.is_near_quota {
            warn!(usage = %format!("{:.2}%", state.usage_percentage), "Storage near quota");
            self.observers.emit(&QuotaEvent::Warning(state));
        }
        Ok(Some(state))
    }

    /// Writes `value` under `physical`; on a capacity failure sweeps expired entries
    /// once through `recover` and retries once.
    pub(crate) fn write<R>(&self, key: &str, physical: &str, value: &str, recover: R) -> StoreResult<()>
    where
        R: FnOnce() -> StoreResult<usize>,
    {
        let first = match self.medium.set(physical, value) {
            Err(e) if e.is_quota_exceeded() => e,
            other => return other,
        };
        warn!(key = %key, error = %first, "Quota exceeded, sweeping expired entries");

        let freed = match recover() {
            Ok(freed) => freed,
            Err(e) => {
                warn!(key = %key, error = %e, "Quota recovery sweep failed");
                0
            }
        };

        match self.medium.set(physical, value) {
            Ok(()) => {
                info!(key = %key, freed = freed, "Write succeeded after quota recovery");
                Ok(())
            }
            Err(e) => {
                if e.is_quota_exceeded() {
                    self.signal_exceeded(key);
                }
                Err(e)
            }
        }
    }

    fn signal_exceeded(&self, key: &str) {
        let state = self.compute_stats().unwrap_or_else(|_| self.empty_state());
        warn!(
            key = %key,
            usage = %format!("{:.2}%", state.usage_percentage),
            "Quota exceeded after recovery, write dropped"
        );
        self.observers.emit(&QuotaEvent::Exceeded {
            key: key.to_string(),
            state,
        });
    }
}
