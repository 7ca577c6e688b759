//! # FlashStore - A Namespaced Key-Value Cache over String Storage
//!
//! FlashStore is a key-value cache layered over a fixed-capacity, string-only
//! persistent medium (a browser-style per-origin store, a JSON file, an in-memory
//! map). Several caches can share one medium, each isolated by a key prefix.
//!
//! ## Features
//!
//! - **Typed Access**: values go through serde; a decode failure returns the caller's default
//! - **TTL Support**: entries can expire, with lazy eviction on read and active sweeps
//! - **Quota Accounting**: usage is tracked against a byte budget, with recovery on overflow
//! - **Metadata**: creation/update times, size and access count per entry
//! - **Snapshots**: versioned export and import of a whole namespace
//! - **Change Events**: synchronous local events plus events from other contexts on the medium
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              FlashStore                                 │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Store     │───>│  KeyCodec   │───>│ CodecPipeline│                 │
//! │  │ (public API)│    │ (namespace) │    │ JSON + base64│                 │
//! │  └──────┬──────┘    └─────────────┘    └──────┬──────┘                  │
//! │         │                                     │                         │
//! │         ▼                                     ▼                         │
//! │  ┌──────────────────────────┐    ┌──────────────────────────────────┐   │
//! │  │ TtlManager               │    │          StorageBackend          │   │
//! │  │ MetadataTracker          │───>│  ┌────────┐ ┌──────┐ ┌─────────┐ │   │
//! │  │ QuotaMonitor             │    │  │ Memory │ │ File │ │Signaling│ │   │
//! │  │ ChangeNotifier           │    │  └────────┘ └──────┘ └─────────┘ │   │
//! │  └──────────────────────────┘    └──────────────────────────────────┘   │
//! │         ▲                                                               │
//! │         │                                                               │
//! │  ┌──────┴──────────────────────────────────────────────────────────┐    │
//! │  │                  Maintenance (Background Tokio Task)            │    │
//! │  └─────────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use flashstore::{Maintenance, MaintenanceConfig, Store, StoreConfig, WriteOptions};
//! use flashstore::backend::FileBackend;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let medium = FileBackend::open("cache.json")?.with_capacity(5 * 1024 * 1024);
//!     let store = Arc::new(Store::new(medium, StoreConfig::with_prefix("app_"))?);
//!
//!     // Sweep expired entries and check the quota in the background
//!     let _maintenance = Maintenance::start(Arc::clone(&store), MaintenanceConfig::default());
//!
//!     let _sub = store.subscribe(|event| println!("{} {:?}", event.key, event.kind));
//!
//!     store.set_with("session", &"token", &WriteOptions::with_ttl(Duration::from_secs(3600)));
//!     let token: String = store.get("session", String::new());
//!     Ok(())
//! }
//! ```
//!
//! ## Physical Layout
//!
//! For logical key `K` under prefix `P`:
//!
//! - `P + K`: the encoded value
//! - `P + "expiry_" + K`: absolute expiry, epoch milliseconds
//! - `P + "meta_" + K`: JSON metadata
//!
//! Logical keys starting with `expiry_` or `meta_` are rejected so the three record
//! kinds never collide.
//!
//! ## Module Overview
//!
//! - [`backend`]: the string medium and its implementations
//! - [`keys`]: namespace prefixing and physical key derivation
//! - [`codec`]: JSON and obfuscation stages
//! - [`store`]: the cache itself
//! - [`error`]: error types of each layer
//!
//! ## Design Highlights
//!
//! ### No Errors Across the API
//!
//! Internally every layer returns `Result` and propagates with `?`. The public
//! operations of [`Store`] turn failures into their documented fallback (`false`,
//! the default, `None`) and log them. A medium that cannot be used switches the
//! store off instead of failing every call.
//!
//! ### Lazy + Active Expiry
//!
//! Entries with TTL are expired in two ways:
//! 1. **Lazy**: When an entry is read, we check if it's expired and remove all its records
//! 2. **Active**: [`Store::cleanup_expired`] (or the [`Maintenance`] task) sweeps the namespace
//!
//! This ensures space is reclaimed even for entries that are never read again.

pub mod backend;
pub mod codec;
pub mod error;
pub mod keys;
pub mod store;

// Re-export commonly used types for convenience
pub use backend::{FileBackend, MemoryBackend, SignalingBackend, StorageBackend};
pub use error::{BackendError, CodecError, StoreError, StoreResult};
pub use store::snapshot::SNAPSHOT_VERSION;
pub use store::{
    ChangeEvent, ChangeKind, EntryMetadata, EntryWithMetadata, ImportOptions, ImportReport,
    Maintenance, MaintenanceConfig, Origin, QuotaEvent, QuotaState, ReadOptions, Snapshot,
    SnapshotEntry, Store, StoreConfig, Subscription, WriteOptions,
};

/// Version of FlashStore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
