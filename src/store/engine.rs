//! The namespaced store.
//!
//! [`Store`] is the public surface of the crate. Every operation is synchronous and
//! completes before returning. No error crosses this boundary: failures come back as
//! the documented fallback (`false`, the caller's default, `None`, `0`) and are logged.
//!
//! ## Value Path
//!
//! ```text
//! set:  key ─> KeyCodec ─> CodecPipeline::encode ─> QuotaMonitor::write ─> medium
//!                                                       │ (QuotaExceeded)
//!                                                       └─> sweep + one retry
//! get:  key ─> KeyCodec ─> TtlManager (lazy expiry) ─> medium ─> CodecPipeline::decode
//! ```

use super::expiry::TtlManager;
use super::medium::Medium;
use super::metadata::{EntryMetadata, MetadataTracker};
use super::notify::{ChangeEvent, ChangeKind, ChangeNotifier, Subscription};
use super::options::{ReadOptions, StoreConfig, WriteOptions};
use super::quota::{QuotaEvent, QuotaMonitor, QuotaState};
use crate::backend::StorageBackend;
use crate::codec::CodecPipeline;
use crate::error::{CodecError, StoreError, StoreResult};
use crate::keys::{KeyCodec, PhysicalKeys, Record};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A value together with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryWithMetadata {
    pub value: Value,
    pub metadata: EntryMetadata,
}

/// A namespaced key-value cache over a [`StorageBackend`].
///
/// Several stores may share one medium; each only ever touches physical keys that
/// start with its own prefix.
///
/// # Example
///
/// ```
/// use flashstore::{Store, StoreConfig};
/// use flashstore::backend::MemoryBackend;
///
/// let medium = MemoryBackend::new();
/// let a = Store::new(medium.clone(), StoreConfig::with_prefix("a_")).unwrap();
/// let b = Store::new(medium, StoreConfig::with_prefix("b_")).unwrap();
///
/// a.set("x", &1);
/// b.set("x", &2);
/// assert_eq!(a.get("x", 0), 1);
/// assert_eq!(b.get("x", 0), 2);
/// ```
pub struct Store {
    pub(super) config: StoreConfig,
    pub(super) medium: Arc<Medium>,
    pub(super) codec: CodecPipeline,
    pub(super) ttl: TtlManager,
    pub(super) metadata: MetadataTracker,
    pub(super) quota: QuotaMonitor,
    pub(super) notifier: ChangeNotifier,
    remote_listener: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("prefix", &self.config.prefix)
            .field("enabled", &self.is_enabled())
            .field("subscribers", &self.notifier.subscriber_count())
            .field("remote_listener", &self.remote_listener.is_some())
            .finish()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if let Some(listener) = self.remote_listener.take() {
            listener.abort();
        }
    }
}

impl Store {
    /// Creates a store with the default (base64) obfuscation stage.
    ///
    /// If the medium fails its probe the store is still returned, in the disabled
    /// state where every operation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `config` does not validate.
    pub fn new(backend: impl StorageBackend + 'static, config: StoreConfig) -> StoreResult<Self> {
        Self::with_codec(backend, config, CodecPipeline::default())
    }

    /// Creates a store with a custom codec pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfig`] if `config` does not validate.
    pub fn with_codec(
        backend: impl StorageBackend + 'static,
        config: StoreConfig,
        codec: CodecPipeline,
    ) -> StoreResult<Self> {
        config.validate()?;

        let keys = KeyCodec::new(config.prefix.clone());
        let medium = Arc::new(Medium::new(Arc::new(backend), keys.clone()));
        let notifier = ChangeNotifier::new();

        let remote_listener = if medium.is_disabled() {
            None
        } else {
            medium
                .watch()
                .and_then(|signals| notifier.listen_remote(signals, keys))
        };

        info!(
            prefix = %config.prefix,
            enabled = !medium.is_disabled(),
            remote = remote_listener.is_some(),
            "Store initialized"
        );

        Ok(Self {
            ttl: TtlManager::new(Arc::clone(&medium)),
            metadata: MetadataTracker::new(Arc::clone(&medium)),
            quota: QuotaMonitor::new(
                Arc::clone(&medium),
                config.max_size_bytes,
                config.warning_fraction,
            ),
            config,
            medium,
            codec,
            notifier,
            remote_listener,
        })
    }

    /// Returns false once the medium is unavailable.
    pub fn is_enabled(&self) -> bool {
        !self.medium.is_disabled()
    }

    /// The namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Unwraps an internal result into the public fallback value.
    pub(super) fn settle<T>(&self, op: &'static str, key: &str, result: StoreResult<T>, fallback: T) -> T {
        match result {
            Ok(value) => value,
            // Already logged when the store was disabled
            Err(StoreError::Disabled) => fallback,
            Err(e) => {
                warn!(op = op, key = %key, error = %e, "Store operation failed");
                fallback
            }
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Evicts the entry if its expiry has passed. Returns true if it was evicted.
    fn evict_if_expired(&self, key: &str, keys: &PhysicalKeys) -> StoreResult<bool> {
        if !self.ttl.is_expired(keys)? {
            return Ok(false);
        }
        let old = self.medium.get(&keys.value)?;
        self.medium.remove_entry(keys)?;
        self.quota.mark_dirty();
        debug!(key = %key, "Expired entry evicted on access");
        if old.is_some() {
            self.notifier.notify_local(key, old, None, ChangeKind::Remove);
        }
        Ok(true)
    }

    /// Reads the stored string of a live entry.
    fn read_stored(&self, key: &str, opts: &ReadOptions) -> StoreResult<Option<(PhysicalKeys, String)>> {
        self.medium.ensure_enabled()?;
        let keys = self.medium.keys().derive(key)?;
        if opts.check_expiry && self.evict_if_expired(key, &keys)? {
            return Ok(None);
        }
        Ok(self.medium.get(&keys.value)?.map(|stored| (keys, stored)))
    }

    fn try_get_value(&self, key: &str, opts: &ReadOptions) -> StoreResult<Option<Value>> {
        let Some((_, stored)) = self.read_stored(key, opts)? else {
            return Ok(None);
        };
        Ok(Some(self.codec.decode(&stored, opts.decrypt, opts.parse_json)?))
    }

    /// Reads and decodes a value. Returns `None` if the entry is missing, expired or
    /// cannot be decoded.
    pub fn get_value(&self, key: &str, opts: &ReadOptions) -> Option<Value> {
        self.settle("get", key, self.try_get_value(key, opts), None)
    }

    /// Reads a typed value with the configured read options, or `default`.
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get_with(key, default, &self.config.read)
    }

    /// Reads a typed value with explicit read options, or `default`.
    pub fn get_with<T: DeserializeOwned>(&self, key: &str, default: T, opts: &ReadOptions) -> T {
        let Some(value) = self.get_value(key, opts) else {
            return default;
        };
        match serde_json::from_value(value) {
            Ok(typed) => typed,
            Err(e) => {
                warn!(key = %key, error = %e, "Stored value does not match the requested type");
                default
            }
        }
    }

    /// Returns true if a live entry exists. Does not count as a metadata access.
    pub fn has(&self, key: &str) -> bool {
        let result = self
            .read_stored(key, &self.config.read)
            .map(|found| found.is_some());
        self.settle("has", key, result, false)
    }

    /// Reads several values with the configured read options.
    pub fn get_multiple<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, Option<Value>> {
        keys.iter()
            .map(|key| {
                let key = key.as_ref();
                (key.to_string(), self.get_value(key, &self.config.read))
            })
            .collect()
    }

    /// Remaining lifetime of a live entry; `None` if it is missing or never expires.
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        let result = self.read_stored(key, &self.config.read).and_then(|found| match found {
            Some((keys, _)) => self.ttl.remaining(&keys),
            None => Ok(None),
        });
        self.settle("ttl_remaining", key, result, None)
    }

    /// Logical keys of the namespace, optionally filtered by `pattern`.
    ///
    /// Entries are listed as stored; expired entries disappear on their next read or
    /// sweep.
    pub fn keys(&self, pattern: Option<&Regex>) -> Vec<String> {
        self.settle("keys", "*", self.try_keys(pattern), Vec::new())
    }

    fn try_keys(&self, pattern: Option<&Regex>) -> StoreResult<Vec<String>> {
        let codec = self.medium.keys();
        Ok(self
            .medium
            .namespace_keys()?
            .iter()
            .filter_map(|physical| codec.logical(physical))
            .filter(|key| pattern.map(|re| re.is_match(key)).unwrap_or(true))
            .map(str::to_string)
            .collect())
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    fn to_json<T: Serialize + ?Sized>(value: &T) -> StoreResult<Value> {
        Ok(serde_json::to_value(value).map_err(CodecError::from)?)
    }

    /// Writes value, expiry and metadata records of one entry.
    pub(super) fn write_entry(&self, key: &str, value: &Value, opts: &WriteOptions) -> StoreResult<PhysicalKeys> {
        self.medium.ensure_enabled()?;
        let keys = self.medium.keys().derive(key)?;
        let stored = self.codec.encode(value, opts.stringify, opts.encrypt)?;
        let old = self.medium.get(&keys.value)?;

        // The expiry goes in first so a refused write leaves the previous entry intact
        let old_expiry = match opts.ttl {
            Some(ttl) => {
                let previous = self.medium.get(&keys.expiry)?;
                let deadline = TtlManager::deadline(ttl).to_string();
                self.quota
                    .write(key, &keys.expiry, &deadline, || self.sweep_expired())?;
                Some(previous)
            }
            None => None,
        };

        if let Err(e) = self
            .quota
            .write(key, &keys.value, &stored, || self.sweep_expired())
        {
            if let Some(previous) = old_expiry {
                self.restore_expiry(key, &keys, previous);
            }
            return Err(e);
        }

        if opts.ttl.is_none() {
            self.medium.remove(&keys.expiry)?;
        }

        let size = self.medium.byte_len(&keys.value) + self.medium.byte_len(&stored);
        if let Err(e) = self.metadata.record_write(&keys, size, opts.ttl) {
            warn!(key = %key, error = %e, "Metadata not recorded");
        }

        self.quota.mark_dirty();
        self.notifier
            .notify_local(key, old, Some(stored), ChangeKind::Set);
        Ok(keys)
    }

    /// Puts back the expiry record an entry had before a refused write.
    fn restore_expiry(&self, key: &str, keys: &PhysicalKeys, previous: Option<String>) {
        let restored = match previous {
            Some(deadline) => self.medium.set(&keys.expiry, &deadline),
            None => self.medium.remove(&keys.expiry),
        };
        if let Err(e) = restored {
            warn!(key = %key, error = %e, "Expiry record not restored");
        }
    }

    /// Stores a value with the configured write options.
    ///
    /// Returns false if nothing was persisted; callers that must warn the user about a
    /// lost write check this.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        self.set_with(key, value, &self.config.write)
    }

    /// Stores a value with explicit write options.
    pub fn set_with<T: Serialize + ?Sized>(&self, key: &str, value: &T, opts: &WriteOptions) -> bool {
        match Self::to_json(value) {
            Ok(json) => self.set_value(key, &json, opts),
            Err(e) => self.settle("set", key, Err(e), false),
        }
    }

    /// Stores an untyped JSON value.
    pub fn set_value(&self, key: &str, value: &Value, opts: &WriteOptions) -> bool {
        let result = self.write_entry(key, value, opts).map(|_| true);
        self.settle("set", key, result, false)
    }

    /// Stores several values with the configured write options. Every entry is
    /// attempted; returns true only if all were stored.
    pub fn set_multiple<I, K, V>(&self, entries: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        self.set_multiple_with(entries, &self.config.write)
    }

    /// Like [`set_multiple`](Self::set_multiple) with explicit write options.
    pub fn set_multiple_with<I, K, V>(&self, entries: I, opts: &WriteOptions) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Serialize,
    {
        entries
            .into_iter()
            .fold(true, |ok, (key, value)| self.set_with(key.as_ref(), &value, opts) && ok)
    }

    fn try_remove(&self, key: &str) -> StoreResult<()> {
        self.medium.ensure_enabled()?;
        let keys = self.medium.keys().derive(key)?;
        let old = self.medium.get(&keys.value)?;
        self.medium.remove_entry(&keys)?;
        self.quota.mark_dirty();
        if old.is_some() {
            self.notifier.notify_local(key, old, None, ChangeKind::Remove);
        }
        Ok(())
    }

    /// Removes value, expiry and metadata of an entry.
    ///
    /// Returns true when the medium accepted the removal, whether or not the entry
    /// existed.
    pub fn remove(&self, key: &str) -> bool {
        self.settle("remove", key, self.try_remove(key).map(|_| true), false)
    }

    /// Removes several entries. Returns true only if every removal succeeded.
    pub fn remove_multiple<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        keys.iter()
            .fold(true, |ok, key| self.remove(key.as_ref()) && ok)
    }

    fn try_clear(&self, pattern: Option<&Regex>) -> StoreResult<usize> {
        let codec = self.medium.keys();
        let mut cleared = 0;

        for physical in self.medium.namespace_keys()? {
            let Some(record) = codec.classify(&physical) else {
                continue;
            };
            if !pattern.map(|re| re.is_match(record.logical())).unwrap_or(true) {
                continue;
            }
            match record {
                Record::Value(key) => {
                    let old = self.medium.get(&physical)?;
                    self.medium.remove(&physical)?;
                    cleared += 1;
                    self.notifier.notify_local(key, old, None, ChangeKind::Clear);
                }
                Record::Expiry(_) | Record::Meta(_) => self.medium.remove(&physical)?,
            }
        }

        if cleared > 0 {
            self.quota.mark_dirty();
        }
        debug!(cleared = cleared, "Namespace cleared");
        Ok(cleared)
    }

    /// Removes every entry of the namespace whose logical key matches `pattern`
    /// (all entries without a pattern). Keys of other namespaces are never touched.
    pub fn clear(&self, pattern: Option<&Regex>) -> bool {
        self.settle("clear", "*", self.try_clear(pattern).map(|_| true), false)
    }

    // ========================================================================
    // METADATA
    // ========================================================================

    fn try_get_with_metadata(&self, key: &str, opts: &ReadOptions) -> StoreResult<Option<EntryWithMetadata>> {
        let Some((keys, stored)) = self.read_stored(key, opts)? else {
            return Ok(None);
        };
        let value = self.codec.decode(&stored, opts.decrypt, opts.parse_json)?;
        let size = self.medium.byte_len(&keys.value) + self.medium.byte_len(&stored);
        let metadata = self
            .metadata
            .record_access(&keys, || EntryMetadata::new(size, None))?;
        Ok(Some(EntryWithMetadata { value, metadata }))
    }

    /// Reads a value and its metadata, counting one access.
    pub fn get_with_metadata(&self, key: &str, opts: &ReadOptions) -> Option<EntryWithMetadata> {
        self.settle(
            "get_with_metadata",
            key,
            self.try_get_with_metadata(key, opts),
            None,
        )
    }

    pub(super) fn try_set_with_metadata(
        &self,
        key: &str,
        value: &Value,
        metadata: &Map<String, Value>,
        opts: &WriteOptions,
    ) -> StoreResult<()> {
        // Reject a bad overlay before anything is written
        EntryMetadata::new(0, None).with_fields(metadata, true)?;

        let keys = self.write_entry(key, value, opts)?;
        let size = self.medium.byte_len(&keys.value);
        let overlay = self.metadata.read(&keys).and_then(|current| {
            let base = current.unwrap_or_else(|| EntryMetadata::new(size, opts.ttl));
            self.metadata.apply(&keys, &base, metadata)
        });
        // The value is stored at this point; a lost overlay does not undo it
        if let Err(e) = overlay {
            warn!(key = %key, error = %e, "Metadata overlay not recorded");
        }
        Ok(())
    }

    /// Stores a value and overlays `metadata` on its record. Supplied fields win over
    /// the defaults, timestamps and counters included.
    pub fn set_with_metadata<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        metadata: &Map<String, Value>,
        opts: &WriteOptions,
    ) -> bool {
        let result = Self::to_json(value)
            .and_then(|json| self.try_set_with_metadata(key, &json, metadata, opts))
            .map(|_| true);
        self.settle("set_with_metadata", key, result, false)
    }

    fn try_update_metadata(&self, key: &str, patch: &Map<String, Value>) -> StoreResult<bool> {
        let Some((keys, stored)) = self.read_stored(key, &self.config.read)? else {
            return Ok(false);
        };
        let size = self.medium.byte_len(&keys.value) + self.medium.byte_len(&stored);
        self.metadata
            .record_update(&keys, patch, || EntryMetadata::new(size, None))?;
        Ok(true)
    }

    /// Merges `patch` into an entry's metadata. Each call strictly increases
    /// `updatedAt` and adds one to `accessCount`. Returns false for a missing entry.
    pub fn update_metadata(&self, key: &str, patch: &Map<String, Value>) -> bool {
        self.settle(
            "update_metadata",
            key,
            self.try_update_metadata(key, patch),
            false,
        )
    }

    // ========================================================================
    // EXPIRY & QUOTA
    // ========================================================================

    fn sweep_expired(&self) -> StoreResult<usize> {
        let removed = self.ttl.sweep()?;
        if !removed.is_empty() {
            self.quota.mark_dirty();
        }
        let count = removed.len();
        for (key, old) in removed {
            if old.is_some() {
                self.notifier.notify_local(&key, old, None, ChangeKind::Remove);
            }
        }
        Ok(count)
    }

    /// Removes every expired entry now. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        self.settle("cleanup_expired", "*", self.sweep_expired(), 0)
    }

    /// Current usage of the namespace.
    pub fn get_stats(&self) -> QuotaState {
        let empty = self.quota.empty_state();
        self.settle("get_stats", "*", self.quota.compute_stats(), empty)
    }

    /// Runs the quota recomputation scheduled by earlier writes, if any.
    pub fn check_quota(&self) -> Option<QuotaState> {
        self.settle("check_quota", "*", self.quota.run_deferred(), None)
    }

    // ========================================================================
    // SUBSCRIPTIONS
    // ========================================================================

    /// Registers a change callback. Local changes are delivered inside the mutating
    /// call; changes from other contexts arrive from a background task.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    /// Registers a quota callback for warning and exceeded signals.
    pub fn on_quota<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QuotaEvent) + Send + Sync + 'static,
    {
        self.quota.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, SignalingBackend};
    use crate::store::notify::Origin;
    use parking_lot::Mutex;
    use serde_json::json;

    fn store() -> (Store, MemoryBackend) {
        let backend = MemoryBackend::new();
        let store = Store::new(backend.clone(), StoreConfig::default()).unwrap();
        (store, backend)
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn sorted(mut keys: Vec<String>) -> Vec<String> {
        keys.sort();
        keys
    }

    #[test]
    fn test_set_and_get() {
        let (store, _) = store();
        assert!(store.set("session_token", "abc123"));
        assert_eq!(store.get("session_token", String::new()), "abc123");
    }

    #[test]
    fn test_get_nonexistent() {
        let (store, _) = store();
        assert_eq!(store.get("missing", 7), 7);
        assert_eq!(store.get_value("missing", &ReadOptions::default()), None);
        assert!(!store.has("missing"));
    }

    #[test]
    fn test_round_trip_values() {
        let (store, _) = store();
        let values = [
            json!(null),
            json!(true),
            json!(-12.5),
            json!("text"),
            json!([1, "two", {"three": 3}]),
            json!({"nested": {"list": [1, 2], "empty": {}}}),
        ];
        for (i, value) in values.iter().enumerate() {
            let key = format!("k{i}");
            assert!(store.set(&key, value));
            assert_eq!(store.get_value(&key, &ReadOptions::default()).as_ref(), Some(value));
        }
    }

    #[test]
    fn test_physical_layout() {
        let (store, backend) = store();
        store.set_with("k", &1, &WriteOptions::with_ttl(Duration::from_secs(60)));

        let keys = sorted(backend.keys().unwrap());
        assert_eq!(keys, vec!["app_expiry_k", "app_k", "app_meta_k"]);
        assert_eq!(backend.get("app_k").unwrap(), Some("1".to_string()));
        let expiry: u64 = backend.get("app_expiry_k").unwrap().unwrap().parse().unwrap();
        assert!(expiry > super::super::now_ms());
    }

    #[test]
    fn test_lazy_expiry_removes_all_records() {
        let (store, backend) = store();
        store.set_with("k", &"v", &WriteOptions::with_ttl(Duration::from_millis(10)));
        assert_eq!(store.get("k", String::new()), "v");

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.get("k", "default".to_string()), "default");
        assert!(!store.has("k"));
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn test_expiry_check_can_be_skipped() {
        let (store, _) = store();
        store.set_with("k", &"v", &WriteOptions::with_ttl(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));

        let unchecked = ReadOptions {
            check_expiry: false,
            ..ReadOptions::default()
        };
        assert_eq!(store.get_with("k", String::new(), &unchecked), "v");
        assert_eq!(store.get("k", String::new()), "");
    }

    #[test]
    fn test_set_without_ttl_clears_old_expiry() {
        let (store, backend) = store();
        store.set_with("k", &1, &WriteOptions::with_ttl(Duration::from_millis(5)));
        store.set("k", &2);
        assert_eq!(backend.get("app_expiry_k").unwrap(), None);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("k", 0), 2);
        assert_eq!(store.ttl_remaining("k"), None);
    }

    #[test]
    fn test_ttl_remaining() {
        let (store, _) = store();
        store.set_with("k", &1, &WriteOptions::with_ttl(Duration::from_secs(60)));
        let left = store.ttl_remaining("k").unwrap();
        assert!(left > Duration::from_secs(55) && left <= Duration::from_secs(60));
    }

    #[test]
    fn test_encrypted_values() {
        let (store, backend) = store();
        store.set_with("secret", &json!({"pin": 1234}), &WriteOptions::encrypted());

        let raw = backend.get("app_secret").unwrap().unwrap();
        assert!(!raw.contains("pin"));

        let value = store.get_value("secret", &ReadOptions::decrypted());
        assert_eq!(value, Some(json!({"pin": 1234})));

        // Read without decryption: the obfuscated text comes back as a string
        assert_eq!(store.get_value("secret", &ReadOptions::default()), Some(json!(raw)));
    }

    #[test]
    fn test_decode_failure_returns_default() {
        let (store, backend) = store();
        backend.set("app_broken", "%%% not base64").unwrap();
        assert_eq!(
            store.get_with("broken", "fallback".to_string(), &ReadOptions::decrypted()),
            "fallback"
        );
        // A type mismatch is a decode failure too
        store.set("n", &"not a number");
        assert_eq!(store.get("n", 5_i64), 5);
    }

    #[test]
    fn test_raw_strings() {
        let (store, backend) = store();
        let raw = WriteOptions {
            stringify: false,
            ..WriteOptions::default()
        };
        store.set_with("plain", "hello world", &raw);
        assert_eq!(backend.get("app_plain").unwrap(), Some("hello world".to_string()));
        assert_eq!(store.get("plain", String::new()), "hello world");
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let (store, backend) = store();
        assert!(!store.set("meta_x", &1));
        assert!(!store.set("expiry_x", &1));
        assert!(!store.set("", &1));
        assert!(backend.is_empty());
        assert_eq!(store.get("meta_x", 0), 0);
    }

    #[test]
    fn test_remove() {
        let (store, backend) = store();
        store.set_with("k", &1, &WriteOptions::with_ttl(Duration::from_secs(60)));
        assert!(store.remove("k"));
        assert!(backend.is_empty());
        assert!(store.remove("k")); // removing a missing entry succeeds
    }

    #[test]
    fn test_namespace_isolation() {
        let medium = MemoryBackend::new();
        let a = Store::new(medium.clone(), StoreConfig::with_prefix("a_")).unwrap();
        let b = Store::new(medium.clone(), StoreConfig::with_prefix("b_")).unwrap();

        a.set("x", &"from a");
        b.set("x", &"from b");
        assert_eq!(a.get("x", String::new()), "from a");
        assert_eq!(b.get("x", String::new()), "from b");

        assert!(a.clear(None));
        assert_eq!(a.get("x", String::new()), "");
        assert_eq!(b.get("x", String::new()), "from b");
        assert!(medium.keys().unwrap().iter().all(|k| k.starts_with("b_")));
    }

    #[test]
    fn test_pattern_clear() {
        let (store, _) = store();
        for key in ["alpha", "beta", "alpha2"] {
            store.set(key, &1);
        }
        let pattern = Regex::new("^alpha").unwrap();
        assert!(store.clear(Some(&pattern)));
        assert_eq!(store.keys(None), vec!["beta".to_string()]);
    }

    #[test]
    fn test_keys_pattern() {
        let (store, _) = store();
        store.set("user:1", &1);
        store.set("user:2", &2);
        store.set_with("session", &3, &WriteOptions::with_ttl(Duration::from_secs(60)));

        assert_eq!(sorted(store.keys(None)), vec!["session", "user:1", "user:2"]);
        let users = Regex::new(r"^user:\d+$").unwrap();
        assert_eq!(sorted(store.keys(Some(&users))), vec!["user:1", "user:2"]);
    }

    #[test]
    fn test_multiple_operations() {
        let (store, _) = store();
        assert!(store.set_multiple([("a", 1), ("b", 2)]));
        assert_eq!(sorted(store.keys(None)), vec!["a", "b"]);

        let values = store.get_multiple(&["a", "b", "c"]);
        assert_eq!(values["a"], Some(json!(1)));
        assert_eq!(values["b"], Some(json!(2)));
        assert_eq!(values["c"], None);

        assert!(store.remove_multiple(&["a"]));
        assert_eq!(store.keys(None), vec!["b".to_string()]);
    }

    #[test]
    fn test_set_multiple_reports_partial_failure() {
        let (store, _) = store();
        assert!(!store.set_multiple([("ok", 1), ("meta_bad", 2), ("also_ok", 3)]));
        assert_eq!(sorted(store.keys(None)), vec!["also_ok", "ok"]);
    }

    #[test]
    fn test_get_with_metadata_counts_access() {
        let (store, _) = store();
        store.set("k", &"v");

        let first = store.get_with_metadata("k", &ReadOptions::default()).unwrap();
        assert_eq!(first.value, json!("v"));
        assert_eq!(first.metadata.access_count, 1);
        assert_eq!(first.metadata.approx_size_bytes, "app_k".len() + "\"v\"".len());

        // Plain reads do not count
        store.get("k", String::new());
        assert!(store.has("k"));

        let second = store.get_with_metadata("k", &ReadOptions::default()).unwrap();
        assert_eq!(second.metadata.access_count, 2);
        assert!(store.get_with_metadata("missing", &ReadOptions::default()).is_none());
    }

    #[test]
    fn test_metadata_monotonicity() {
        let (store, _) = store();
        store.set("k", &1);

        let mut last = store.get_with_metadata("k", &ReadOptions::default()).unwrap().metadata;
        for i in 0..5 {
            assert!(store.update_metadata("k", &fields(json!({"step": i}))));
            let meta = store.metadata.read(&store.medium.keys().derive("k").unwrap()).unwrap().unwrap();
            assert!(meta.updated_at > last.updated_at);
            assert_eq!(meta.access_count, last.access_count + 1);
            assert_eq!(meta.created_at, last.created_at);
            assert_eq!(meta.extra["step"], json!(i));
            last = meta;
        }

        assert!(!store.update_metadata("missing", &Map::new()));
    }

    #[test]
    fn test_set_with_metadata_overlays() {
        let (store, _) = store();
        let supplied = fields(json!({"createdAt": 1000, "source": "import"}));
        assert!(store.set_with_metadata("k", &[1, 2], &supplied, &WriteOptions::default()));

        let entry = store.get_with_metadata("k", &ReadOptions::default()).unwrap();
        assert_eq!(entry.value, json!([1, 2]));
        assert_eq!(entry.metadata.created_at, 1000);
        assert_eq!(entry.metadata.extra["source"], json!("import"));

        // A malformed overlay writes nothing
        let bad = fields(json!({"createdAt": "yesterday"}));
        assert!(!store.set_with_metadata("other", &1, &bad, &WriteOptions::default()));
        assert!(!store.has("other"));
    }

    #[test]
    fn test_cleanup_expired() {
        let (store, _) = store();
        let short = WriteOptions::with_ttl(Duration::from_millis(10));
        store.set_with("key1", &1, &short);
        store.set_with("key2", &2, &short);
        store.set("key3", &3);

        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.keys(None), vec!["key3".to_string()]);
        assert_eq!(store.cleanup_expired(), 0);
    }

    #[test]
    fn test_stats_arithmetic() {
        let (store, _) = store();
        store.set("a", &"x".repeat(100));
        store.set_with("b", &1, &WriteOptions::with_ttl(Duration::from_secs(60)));

        let stats = store.get_stats();
        assert_eq!(stats.item_count, store.keys(None).len());
        assert_eq!(stats.max_size_bytes, StoreConfig::default().max_size_bytes);
        let expected = stats.current_size_bytes as f64 / stats.max_size_bytes as f64 * 100.0;
        assert!((stats.usage_percentage - expected).abs() < 1e-9);
        assert!(stats.current_size_bytes > 100);
    }

    #[test]
    fn test_quota_exhaustion_and_recovery() {
        let capacity = 2_000;
        let medium = MemoryBackend::with_capacity(capacity);
        let store = Store::new(medium, StoreConfig::default().max_size_bytes(capacity)).unwrap();

        let exceeded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exceeded);
        let _sub = store.on_quota(move |event| {
            if let QuotaEvent::Exceeded { key, .. } = event {
                sink.lock().push(key.clone());
            }
        });

        // Fill past the warning threshold with short-lived entries
        let short = WriteOptions::with_ttl(Duration::from_millis(200));
        let mut i = 0;
        while store.get_stats().usage_percentage < 85.0 {
            assert!(store.set_with(&format!("fill{i}"), &"x".repeat(100), &short));
            i += 1;
        }

        assert!(!store.set("huge", &"y".repeat(capacity)));
        assert!(store.get_stats().is_near_quota);
        assert_eq!(*exceeded.lock(), vec!["huge".to_string()]);

        std::thread::sleep(Duration::from_millis(300));
        assert!(store.cleanup_expired() > 0);
        assert!(store.set("small", &"ok"));
        assert!(!store.get_stats().is_near_quota);
    }

    /// Bytes the medium holds after `fill` runs against a fresh store.
    fn footprint(fill: impl Fn(&Store)) -> usize {
        let backend = MemoryBackend::new();
        let store = Store::new(backend.clone(), StoreConfig::default()).unwrap();
        fill(&store);
        backend.used_bytes()
    }

    fn tight_store(capacity: usize) -> (Store, MemoryBackend) {
        let backend = MemoryBackend::with_capacity(capacity);
        let config = StoreConfig::default().max_size_bytes(capacity);
        (Store::new(backend.clone(), config).unwrap(), backend)
    }

    #[test]
    fn test_refused_expiry_keeps_previous_value() {
        // Room for a same-size overwrite, not for an expiry record
        let capacity = footprint(|s| {
            s.set("k", "a");
        }) + 10;
        let (store, backend) = tight_store(capacity);

        assert!(store.set("k", "a"));
        assert!(!store.set_with("k", "b", &WriteOptions::with_ttl(Duration::from_secs(60))));

        assert_eq!(store.get("k", String::new()), "a");
        assert_eq!(store.ttl_remaining("k"), None);
        assert_eq!(backend.get("app_expiry_k").unwrap(), None);
    }

    #[test]
    fn test_refused_value_restores_previous_expiry() {
        let ttl = WriteOptions::with_ttl(Duration::from_secs(60));
        let capacity = footprint(|s| {
            s.set_with("k", "a", &ttl);
        }) + 10;
        let (store, backend) = tight_store(capacity);

        assert!(store.set_with("k", "a", &ttl));
        let deadline = backend.get("app_expiry_k").unwrap();
        assert!(deadline.is_some());

        std::thread::sleep(Duration::from_millis(5));
        let longer = WriteOptions::with_ttl(Duration::from_secs(120));
        assert!(!store.set_with("k", &"b".repeat(50), &longer));

        assert_eq!(store.get("k", String::new()), "a");
        assert_eq!(backend.get("app_expiry_k").unwrap(), deadline);
    }

    #[test]
    fn test_lost_metadata_overlay_keeps_write() {
        let capacity = footprint(|s| {
            s.set("k", &1);
        }) + 50;
        let (store, _) = tight_store(capacity);

        let note = fields(json!({"note": "x".repeat(330)}));
        assert!(store.set_with_metadata("k", &1, &note, &WriteOptions::default()));
        assert_eq!(store.get("k", 0), 1);

        let entry = store.get_with_metadata("k", &ReadOptions::default()).unwrap();
        assert!(!entry.metadata.extra.contains_key("note"));
    }

    #[test]
    fn test_sweep_events_carry_old_value() {
        let (store, _) = store();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = store.subscribe(move |event| sink.lock().push(event.clone()));

        store.set_with("k", &1, &WriteOptions::with_ttl(Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(store.cleanup_expired(), 1);

        let events = events.lock();
        let last = events.last().unwrap();
        assert_eq!(last.kind, ChangeKind::Remove);
        assert_eq!(last.key, "k");
        assert_eq!(last.old_value.as_deref(), Some("1"));
        assert_eq!(last.new_value, None);
    }

    #[test]
    fn test_write_recovers_by_sweeping() {
        let capacity = 400;
        let medium = MemoryBackend::with_capacity(capacity);
        let store = Store::new(medium, StoreConfig::default().max_size_bytes(capacity)).unwrap();

        assert!(store.set_with("old", &"x".repeat(150), &WriteOptions::with_ttl(Duration::from_millis(10))));
        std::thread::sleep(Duration::from_millis(30));

        // Does not fit next to the expired entry, fits after the recovery sweep
        assert!(store.set("new", &"y".repeat(200)));
        assert_eq!(store.keys(None), vec!["new".to_string()]);
    }

    #[test]
    fn test_deferred_quota_check() {
        let capacity = 200;
        let store = Store::new(
            MemoryBackend::new(),
            StoreConfig::default().max_size_bytes(capacity),
        )
        .unwrap();
        let warnings = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&warnings);
        let _sub = store.on_quota(move |event| {
            if matches!(event, QuotaEvent::Warning(_)) {
                *sink.lock() += 1;
            }
        });

        assert_eq!(store.check_quota(), None);
        store.set("big", &"z".repeat(180));
        // Nothing is computed on the write path
        assert_eq!(*warnings.lock(), 0);

        let state = store.check_quota().unwrap();
        assert!(state.is_near_quota);
        assert_eq!(*warnings.lock(), 1);
        assert_eq!(store.check_quota(), None);
    }

    #[test]
    fn test_subscribe_is_synchronous() {
        let (store, _) = store();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let sub = store.subscribe(move |event| sink.lock().push(event.clone()));

        store.set("x", &1);
        {
            let events = events.lock();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].key, "x");
            assert_eq!(events[0].new_value.as_deref(), Some("1"));
            assert_eq!(events[0].kind, ChangeKind::Set);
            assert_eq!(events[0].origin, Origin::Local);
        }

        store.set("x", &2);
        store.remove("x");
        store.set("y", &3);
        store.clear(None);

        let kinds: Vec<_> = events.lock().iter().map(|e| (e.key.clone(), e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("x".to_string(), ChangeKind::Set),
                ("x".to_string(), ChangeKind::Set),
                ("x".to_string(), ChangeKind::Remove),
                ("y".to_string(), ChangeKind::Set),
                ("y".to_string(), ChangeKind::Clear),
            ]
        );
        assert_eq!(events.lock()[1].old_value.as_deref(), Some("1"));

        assert!(sub.unsubscribe());
        store.set("z", &4);
        assert_eq!(events.lock().len(), 5);
    }

    #[test]
    fn test_unavailable_medium_disables_store() {
        let store = Store::new(MemoryBackend::unavailable(), StoreConfig::default()).unwrap();
        assert!(!store.is_enabled());
        assert!(!store.set("k", &1));
        assert_eq!(store.get("k", 9), 9);
        assert!(!store.has("k"));
        assert!(!store.remove("k"));
        assert!(!store.clear(None));
        assert!(store.keys(None).is_empty());
        assert_eq!(store.cleanup_expired(), 0);
        assert_eq!(store.get_stats().item_count, 0);
    }

    #[test]
    fn test_medium_failure_downgrades_store() {
        let (store, backend) = store();
        assert!(store.set("k", &1));
        backend.set_available(false);
        assert!(!store.set("k", &2));
        backend.set_available(true);
        assert!(!store.is_enabled());
        assert_eq!(store.get("k", 0), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Store::new(MemoryBackend::new(), StoreConfig::with_prefix(""));
        assert!(matches!(result, Err(StoreError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_remote_changes_are_republished() {
        let tab_a = SignalingBackend::new(MemoryBackend::new());
        let tab_b = tab_a.attach();
        let store_a = Store::new(tab_a, StoreConfig::default()).unwrap();
        let store_b = Store::new(tab_b, StoreConfig::default()).unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = store_b.subscribe(move |event| sink.lock().push(event.clone()));

        store_a.set("x", &1);
        // Delivered asynchronously, never inside the writer's call
        assert!(events.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = events.lock().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "x");
        assert_eq!(events[0].new_value.as_deref(), Some("1"));
        assert_eq!(events[0].origin, Origin::Remote);
        assert_eq!(store_b.get("x", 0), 1);
    }
}
