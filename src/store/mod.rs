//! Store Module
//!
//! The namespaced cache on top of a [`StorageBackend`](crate::backend::StorageBackend).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Store                             │
//! │                                                             │
//! │  value path:  KeyCodec ──> CodecPipeline ──> Medium         │
//! │                                                             │
//! │  side paths:  TtlManager   MetadataTracker   QuotaMonitor   │
//! │                                                             │
//! │  reporting:   ChangeNotifier (local sync / remote async)    │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │
//!              ┌─────────────┴─────────────┐
//!              │       Maintenance         │
//!              │  (Background Tokio Task)  │
//!              └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use flashstore::{Store, StoreConfig, WriteOptions};
//! use flashstore::backend::MemoryBackend;
//! use std::time::Duration;
//!
//! let store = Store::new(MemoryBackend::new(), StoreConfig::with_prefix("app_")).unwrap();
//!
//! assert!(store.set("session_token", "abc123"));
//! assert_eq!(store.get("session_token", String::new()), "abc123");
//!
//! store.set_with("prefs", &serde_json::json!({"theme": "dark"}), &WriteOptions::with_ttl(Duration::from_secs(1)));
//! assert!(store.has("prefs"));
//! ```

pub mod engine;
pub mod expiry;
pub(crate) mod medium;
pub mod metadata;
pub mod notify;
pub mod options;
pub mod quota;
pub mod snapshot;

pub use engine::{EntryWithMetadata, Store};
pub use expiry::{Maintenance, MaintenanceConfig};
pub use metadata::EntryMetadata;
pub use notify::{ChangeEvent, ChangeKind, Origin, Subscription};
pub use options::{ImportOptions, ReadOptions, StoreConfig, WriteOptions};
pub use quota::{QuotaEvent, QuotaState};
pub use snapshot::{ImportReport, Snapshot, SnapshotEntry};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
