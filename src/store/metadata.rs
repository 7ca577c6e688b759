//! Per-entry bookkeeping.
//!
//! Metadata lives in its own JSON record next to the value. It is never obfuscated and
//! never affects what `get` returns.

use super::medium::Medium;
use super::now_ms;
use crate::error::{CodecError, StoreResult};
use crate::keys::PhysicalKeys;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Fields the tracker maintains itself; a patch cannot set them.
const MANAGED_FIELDS: [&str; 2] = ["updatedAt", "accessCount"];

/// Metadata of one entry.
///
/// Unknown fields written through `update_metadata` are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    /// First write, epoch ms
    pub created_at: u64,
    /// Last write or metadata update, epoch ms
    pub updated_at: u64,
    /// Physical key length + stored value length
    #[serde(default)]
    pub approx_size_bytes: usize,
    /// Explicit metadata reads and updates
    #[serde(default)]
    pub access_count: u64,
    /// TTL the entry was written with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EntryMetadata {
    /// Fresh metadata for an entry written now.
    pub fn new(approx_size_bytes: usize, ttl: Option<Duration>) -> Self {
        let now = now_ms();
        Self {
            created_at: now,
            updated_at: now,
            approx_size_bytes,
            access_count: 0,
            ttl_ms: ttl.map(duration_ms),
            extra: Map::new(),
        }
    }

    /// Sets `updated_at` to now, strictly after its previous value.
    fn touch(&mut self) {
        self.updated_at = now_ms().max(self.updated_at.saturating_add(1));
    }

    /// Copy with `fields` merged over this metadata. Managed fields in `fields` are
    /// ignored unless `allow_managed` is set.
    pub(crate) fn with_fields(
        &self,
        fields: &Map<String, Value>,
        allow_managed: bool,
    ) -> Result<Self, CodecError> {
        let mut object = match serde_json::to_value(self)? {
            Value::Object(object) => object,
            _ => Map::new(),
        };
        for (field, value) in fields {
            if allow_managed || !MANAGED_FIELDS.contains(&field.as_str()) {
                object.insert(field.clone(), value.clone());
            }
        }
        Ok(serde_json::from_value(Value::Object(object))?)
    }

    /// This metadata as a JSON object.
    pub fn to_fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(object)) => object,
            _ => Map::new(),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Reads and writes metadata records.
#[derive(Debug)]
pub(crate) struct MetadataTracker {
    medium: Arc<Medium>,
}

impl MetadataTracker {
    pub(crate) fn new(medium: Arc<Medium>) -> Self {
        Self { medium }
    }

    /// Reads the metadata of an entry. A corrupt record is logged and treated as absent.
    pub(crate) fn read(&self, keys: &PhysicalKeys) -> StoreResult<Option<EntryMetadata>> {
        let Some(raw) = self.medium.get(&keys.meta)? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(key = %keys.meta, error = %e, "Corrupt metadata record ignored");
                Ok(None)
            }
        }
    }

    pub(crate) fn write(&self, keys: &PhysicalKeys, meta: &EntryMetadata) -> StoreResult<()> {
        let raw = serde_json::to_string(meta).map_err(CodecError::from)?;
        self.medium.set(&keys.meta, &raw)
    }

    /// Records a value write: creates defaults on first write, otherwise refreshes
    /// `updated_at`, size and ttl.
    pub(crate) fn record_write(
        &self,
        keys: &PhysicalKeys,
        approx_size_bytes: usize,
        ttl: Option<Duration>,
    ) -> StoreResult<EntryMetadata> {
        let meta = match self.read(keys)? {
            Some(mut meta) => {
                meta.touch();
                meta.approx_size_bytes = approx_size_bytes;
                meta.ttl_ms = ttl.map(duration_ms);
                meta
            }
            None => EntryMetadata::new(approx_size_bytes, ttl),
        };
        self.write(keys, &meta)?;
        Ok(meta)
    }

    /// Records one explicit metadata read.
    pub(crate) fn record_access(
        &self,
        keys: &PhysicalKeys,
        fallback: impl FnOnce() -> EntryMetadata,
    ) -> StoreResult<EntryMetadata> {
        let mut meta = self.read(keys)?.unwrap_or_else(fallback);
        meta.access_count += 1;
        self.write(keys, &meta)?;
        Ok(meta)
    }

    /// Merges `patch` into the metadata, bumping `updated_at` and `access_count`.
    pub(crate) fn record_update(
        &self,
        keys: &PhysicalKeys,
        patch: &Map<String, Value>,
        fallback: impl FnOnce() -> EntryMetadata,
    ) -> StoreResult<EntryMetadata> {
        let current = self.read(keys)?.unwrap_or_else(fallback);
        let mut meta = current.with_fields(patch, false)?;
        meta.updated_at = current.updated_at;
        meta.touch();
        meta.access_count = current.access_count + 1;
        self.write(keys, &meta)?;
        Ok(meta)
    }

    /// Overlays caller-supplied metadata on a fresh write, keeping every supplied
    /// field (including timestamps and counters) as given.
    pub(crate) fn apply(
        &self,
        keys: &PhysicalKeys,
        base: &EntryMetadata,
        supplied: &Map<String, Value>,
    ) -> StoreResult<EntryMetadata> {
        let meta = base.with_fields(supplied, true)?;
        self.write(keys, &meta)?;
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, StorageBackend};
    use crate::keys::KeyCodec;
    use serde_json::json;

    fn tracker(backend: MemoryBackend) -> (MetadataTracker, PhysicalKeys) {
        let medium = Arc::new(Medium::new(Arc::new(backend), KeyCodec::new("app_")));
        let keys = medium.keys().derive("k").unwrap();
        (MetadataTracker::new(medium), keys)
    }

    fn patch(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_first_write_defaults() {
        let (tracker, keys) = tracker(MemoryBackend::new());
        let meta = tracker.record_write(&keys, 12, None).unwrap();
        assert_eq!(meta.created_at, meta.updated_at);
        assert_eq!(meta.access_count, 0);
        assert_eq!(meta.approx_size_bytes, 12);
        assert_eq!(meta.ttl_ms, None);
        assert_eq!(tracker.read(&keys).unwrap(), Some(meta));
    }

    #[test]
    fn test_rewrite_keeps_creation_and_counter() {
        let (tracker, keys) = tracker(MemoryBackend::new());
        let first = tracker.record_write(&keys, 10, None).unwrap();
        tracker.record_access(&keys, || unreachable!()).unwrap();

        let second = tracker
            .record_write(&keys, 20, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.access_count, 1);
        assert_eq!(second.approx_size_bytes, 20);
        assert_eq!(second.ttl_ms, Some(1000));
    }

    #[test]
    fn test_update_merges_and_bumps() {
        let (tracker, keys) = tracker(MemoryBackend::new());
        tracker.record_write(&keys, 5, None).unwrap();

        let a = tracker
            .record_update(&keys, &patch(json!({"tag": "draft"})), || unreachable!())
            .unwrap();
        let b = tracker
            .record_update(&keys, &patch(json!({"owner": 7, "accessCount": 99})), || unreachable!())
            .unwrap();

        assert!(b.updated_at > a.updated_at);
        assert_eq!(a.access_count, 1);
        assert_eq!(b.access_count, 2);
        assert_eq!(b.extra.get("tag"), Some(&json!("draft")));
        assert_eq!(b.extra.get("owner"), Some(&json!(7)));
        assert_eq!(b.approx_size_bytes, 5);
    }

    #[test]
    fn test_corrupt_record_is_absent() {
        let backend = MemoryBackend::new();
        backend.set("app_meta_k", "{broken").unwrap();
        let (tracker, keys) = tracker(backend);
        assert_eq!(tracker.read(&keys).unwrap(), None);
    }

    #[test]
    fn test_json_layout() {
        let meta = EntryMetadata {
            created_at: 1,
            updated_at: 2,
            approx_size_bytes: 3,
            access_count: 4,
            ttl_ms: Some(5),
            extra: Map::new(),
        };
        assert_eq!(
            serde_json::to_value(&meta).unwrap(),
            json!({"createdAt": 1, "updatedAt": 2, "approxSizeBytes": 3, "accessCount": 4, "ttlMs": 5})
        );
    }
}
