//! Snapshot export and import.
//!
//! ## Document Format
//!
//! ```text
//! {
//!   "timestamp": 1718000000000,
//!   "version": "1.0",
//!   "data": {
//!     "<logical key>": { "value": <json>, "metadata": {...}, "expiresAt": <epoch ms> }
//!   }
//! }
//! ```
//!
//! `expiresAt` is only present for entries written with a TTL. Import restores the
//! remaining lifetime from it and skips entries that expired in the meantime.

use super::metadata::EntryMetadata;
use super::options::{ImportOptions, WriteOptions};
use super::{now_ms, Store};
use crate::error::{StoreError, StoreResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Version written into every snapshot. Import accepts any `1.x`.
pub const SNAPSHOT_VERSION: &str = "1.0";

/// An exported namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Export time, epoch ms
    pub timestamp: u64,
    pub version: String,
    pub data: BTreeMap<String, SnapshotEntry>,
}

/// One exported entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub value: Value,
    #[serde(default)]
    pub metadata: Option<EntryMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

/// Outcome of an import, entry by entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Entries written
    pub applied: usize,
    /// Entries left alone: already present without overwrite, or already expired
    pub skipped: usize,
    /// Entries that could not be decoded or written
    pub failed: usize,
}

impl Snapshot {
    /// Checks the document shape and returns its entries, undecoded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ImportFormat`] for anything but an object with a `data`
    /// object and, if present, a `1.x` version string.
    pub fn entries(document: &Value) -> StoreResult<&Map<String, Value>> {
        let Value::Object(root) = document else {
            return Err(StoreError::ImportFormat("snapshot is not an object".into()));
        };

        match root.get("version") {
            None => {}
            Some(Value::String(version)) if version.starts_with("1.") => {}
            Some(other) => {
                return Err(StoreError::ImportFormat(format!(
                    "unsupported snapshot version {other}"
                )))
            }
        }

        match root.get("data") {
            Some(Value::Object(data)) => Ok(data),
            Some(_) => Err(StoreError::ImportFormat("`data` is not an object".into())),
            None => Err(StoreError::ImportFormat("missing `data`".into())),
        }
    }
}

enum Applied {
    Written,
    Skipped,
}

impl Store {
    /// Exports the live entries of the namespace, optionally filtered by `pattern`.
    ///
    /// Values are read with the configured read options, so expired entries are
    /// evicted and left out. Reading metadata for the export does not count as an
    /// access.
    pub fn export_data(&self, pattern: Option<&Regex>) -> Snapshot {
        let mut data = BTreeMap::new();

        for key in self.keys(pattern) {
            let Some(value) = self.get_value(&key, &self.config.read) else {
                continue;
            };
            let entry = self.medium.keys().derive(&key).and_then(|keys| {
                Ok(SnapshotEntry {
                    value,
                    metadata: self.metadata.read(&keys)?,
                    expires_at: self.ttl.expires_at(&keys)?,
                })
            });
            match entry {
                Ok(entry) => {
                    data.insert(key, entry);
                }
                Err(e) => warn!(key = %key, error = %e, "Entry left out of export"),
            }
        }

        info!(prefix = %self.config.prefix, entries = data.len(), "Namespace exported");
        Snapshot {
            timestamp: now_ms(),
            version: SNAPSHOT_VERSION.to_string(),
            data,
        }
    }

    fn import_entry(&self, key: &str, raw: &Value, options: ImportOptions) -> StoreResult<Applied> {
        let entry: SnapshotEntry = serde_json::from_value(raw.clone())
            .map_err(|e| StoreError::ImportFormat(format!("entry {key:?}: {e}")))?;

        let ttl = match entry.expires_at {
            Some(at) => {
                let now = now_ms();
                if at <= now {
                    return Ok(Applied::Skipped);
                }
                Some(Duration::from_millis(at - now))
            }
            None => None,
        };

        if !options.overwrite && self.has(key) {
            return Ok(Applied::Skipped);
        }

        let opts = WriteOptions {
            ttl,
            ..self.config.write
        };
        match entry.metadata {
            Some(metadata) => {
                self.try_set_with_metadata(key, &entry.value, &metadata.to_fields(), &opts)?;
            }
            None => {
                self.write_entry(key, &entry.value, &opts)?;
            }
        }
        Ok(Applied::Written)
    }

    /// Imports a snapshot document, reporting what happened to each entry.
    ///
    /// The document shape is checked before anything is written. After that, entries
    /// are applied one by one; a bad entry is logged and counted, and the rest are
    /// still applied. Nothing is rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ImportFormat`] for a malformed document and
    /// [`StoreError::Disabled`] when the store is disabled.
    pub fn import_snapshot(&self, document: &Value, options: ImportOptions) -> StoreResult<ImportReport> {
        self.medium.ensure_enabled()?;
        let entries = Snapshot::entries(document)?;
        let mut report = ImportReport::default();

        for (key, raw) in entries {
            match self.import_entry(key, raw, options) {
                Ok(Applied::Written) => report.applied += 1,
                Ok(Applied::Skipped) => {
                    debug!(key = %key, "Import skipped entry");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Import entry failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "Snapshot imported"
        );
        Ok(report)
    }

    /// Imports a snapshot document. Returns false only if the document was rejected
    /// as a whole; see [`import_snapshot`](Self::import_snapshot) for per-entry
    /// results.
    pub fn import_data(&self, document: &Value, options: ImportOptions) -> bool {
        let result = self.import_snapshot(document, options).map(|_| true);
        self.settle("import", "*", result, false)
    }
}
