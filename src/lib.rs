//! # live-store — snapshot + op-log storage for real-time sync engines
//!
//! Lets a real-time collaborative-editing backend persist document snapshots
//! and their append-only operation histories in a generic revisioned keyed
//! document store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                       ┌──────────────┐
//! │ sync engine  │ ◄───────────────────► │  LiveStore   │
//! │ (OT/CRDT)    │   snapshots + ops     │  (adapter)   │
//! └──────────────┘                       └──────┬───────┘
//!                                               │ get / put-with-rev /
//!                                               │ multi_get / range_scan
//!                                        ┌──────┴───────┐
//!                                        │   Backend    │
//!                                        ├──────────────┤
//!                                        │ MemoryBackend│ (tests, embedding)
//!                                        │ RocksBackend │ (durable)
//!                                        └──────────────┘
//! ```
//!
//! Every document `(collection, docName)` is one current-state record plus a
//! gap-free, version-keyed operation log in the paired `_ops` collection.
//! The backend supplies per-key optimistic revisioning; this crate supplies
//! the casting, key-construction and conflict rules on top of it.
//!
//! ## Modules
//!
//! - [`store`] — the adapter itself ([`LiveStore`])
//! - [`snapshot`] — snapshot model and store-record casting
//! - [`oplog`] — composite-key scheme for the operation log
//! - [`backend`] — backing-store traits plus the bundled backends
//!
//! This is a library boundary only: no wire format, no CLI. Operational
//! transform of concurrent edits belongs to the calling engine, not here.

pub mod backend;
pub mod oplog;
pub mod snapshot;
pub mod store;

// Re-exports for convenience
pub use backend::memory::MemoryBackend;
pub use backend::rocks::{RocksBackend, RocksConfig};
pub use backend::{Backend, BackendError, Collection, ScanEntry, ScanOptions, StoredDoc};
pub use snapshot::{cast_to_doc, cast_to_snapshot, Snapshot, SnapshotMeta};
pub use store::{LiveStore, OpPayload, StoreConfig, StoreError};
