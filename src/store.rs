//! The snapshot + op-log storage adapter.
//!
//! ```text
//! ┌──────────────┐  get/write snapshot   ┌───────────────┐
//! │  sync engine │ ────────────────────► │   LiveStore   │
//! │  (caller)    │  write op / get ops   │               │
//! └──────────────┘  get version          │  casting      │
//!                                        │  key scheme   │
//!                                        │  guards       │
//!                                        └──────┬────────┘
//!                                               │ get / put / multi_get /
//!                                               │ range_scan
//!                                        ┌──────┴────────┐
//!                                        │  Backend      │
//!                                        │  "docs"       │ ← snapshots
//!                                        │  "docs_ops"   │ ← op log
//!                                        └───────────────┘
//! ```
//!
//! One logical document is a current-state record in its snapshot collection
//! plus a gap-free, version-keyed log of operations in the sibling `_ops`
//! collection. The adapter owns the translation between the two and the
//! conflict rules on top of the backend's per-key optimistic revisioning:
//!
//! - snapshot writes re-read the current revision token immediately before
//!   the put and surface a losing race as [`StoreError::WriteConflict`];
//! - op writes are insert-if-absent, and a duplicate-key conflict is treated
//!   as a successful redelivery, which is what makes at-least-once op
//!   delivery from the calling engine safe.
//!
//! This layer never retries and never reconciles drift between a snapshot's
//! stored version and the op-log; both are the calling engine's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::try_join_all;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::backend::{Backend, BackendError, Collection, ScanOptions};
use crate::oplog::{
    op_key, op_key_prefix, op_scan_end, op_version, strip_op_record, to_op_record,
    version_from_key, OP_VERSION_FIELD,
};
use crate::snapshot::{cast_to_doc, cast_to_snapshot, Snapshot};

/// An operation payload: arbitrary fields plus a numeric `v`.
pub type OpPayload = Map<String, Value>;

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Reserved suffix appended to a snapshot collection's name to derive its
    /// op-log collection. Names ending in this suffix are rejected on every
    /// public entry point.
    pub oplog_suffix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            // An underscore makes the pairing easy to spot in store tooling.
            oplog_suffix: "_ops".to_string(),
        }
    }
}

/// Adapter errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A reserved op-log collection name was used where disallowed.
    InvalidCollection(String),
    /// An op write carried no usable `v` field. Contract violation, rejected
    /// before any I/O.
    MissingVersion,
    /// The store was closed; no further I/O is attempted.
    Closed,
    /// A snapshot write lost the revision race; the caller must re-read and
    /// retry with a fresh snapshot.
    WriteConflict {
        collection: String,
        doc_name: String,
    },
    /// Backend failure, propagated verbatim.
    Backend(BackendError),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidCollection(name) => {
                write!(f, "invalid collection name '{name}'")
            }
            StoreError::MissingVersion => write!(f, "op is missing a version"),
            StoreError::Closed => write!(f, "store is closed"),
            StoreError::WriteConflict {
                collection,
                doc_name,
            } => write!(f, "write conflict on '{collection}/{doc_name}'"),
            StoreError::Backend(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BackendError> for StoreError {
    fn from(e: BackendError) -> Self {
        StoreError::Backend(e)
    }
}

/// Versioned snapshot + op-log store over a revisioned document backend.
pub struct LiveStore {
    backend: Arc<dyn Backend>,
    config: StoreConfig,
    /// Lazily populated collection-handle registry. Redundant opens under
    /// race are harmless because `Backend::collection` is idempotent.
    collections: RwLock<HashMap<String, Arc<dyn Collection>>>,
    closed: AtomicBool,
}

impl LiveStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_config(backend, StoreConfig::default())
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            collections: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Name of the op-log collection paired with `collection`.
    ///
    /// Pure and deterministic; all op-log access goes through this mapping.
    /// The suffix is configurable via [`StoreConfig`].
    pub fn oplog_collection_name(&self, collection: &str) -> String {
        format!("{collection}{}", self.config.oplog_suffix)
    }

    /// Close the store. Idempotent; any other call afterwards fails with
    /// [`StoreError::Closed`] before reaching the backend.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.collections.write().await.clear();
            log::debug!("live store closed");
        }
    }

    // ─── Snapshot methods ─────────────────────────────────────────────

    /// Read a document's current snapshot.
    ///
    /// A missing record is a normal outcome (`Ok(None)`), distinct from a
    /// backend failure. Tombstoned documents are returned as-is; callers
    /// decide existence from `doc_type`.
    pub async fn get_snapshot(
        &self,
        collection: &str,
        doc_name: &str,
    ) -> Result<Option<Snapshot>, StoreError> {
        self.ensure_open()?;
        self.check_collection_name(collection)?;

        let coll = self.handle(collection).await?;
        match coll.get(doc_name).await {
            Ok(doc) => Ok(Some(cast_to_snapshot(doc))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read snapshots for many documents across collections.
    ///
    /// One batched fetch per collection, collections fetched concurrently.
    /// Absent documents are omitted from the result map. Any single
    /// collection failing aborts the whole call — no partial results.
    pub async fn bulk_get_snapshot(
        &self,
        requests: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, HashMap<String, Snapshot>>, StoreError> {
        self.ensure_open()?;
        for collection in requests.keys() {
            self.check_collection_name(collection)?;
        }

        let fetches = requests.iter().map(|(collection, doc_names)| async move {
            let coll = self.handle(collection).await?;
            let records = coll.multi_get(doc_names).await?;
            let mut found = HashMap::new();
            for record in records.into_iter().flatten() {
                let snapshot = cast_to_snapshot(record);
                found.insert(snapshot.doc_name.clone(), snapshot);
            }
            Ok::<_, StoreError>((collection.clone(), found))
        });

        Ok(try_join_all(fetches).await?.into_iter().collect())
    }

    /// Write a document's snapshot.
    ///
    /// The backend enforces an optimistic revision token on every put, and
    /// the calling engine does not track that token across calls, so the
    /// current record is re-read immediately before the write to recover it.
    /// The read-then-write window is not transactional: a concurrent writer
    /// interleaving there makes the backend reject the put, surfaced as
    /// [`StoreError::WriteConflict`]. No retry happens here — the correct
    /// resolution is a re-merge against the newer snapshot, which is the
    /// calling engine's concern.
    pub async fn write_snapshot(
        &self,
        collection: &str,
        doc_name: &str,
        snapshot: &Snapshot,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.check_collection_name(collection)?;

        let coll = self.handle(collection).await?;
        let mut record = cast_to_doc(doc_name, snapshot);
        record.rev = match coll.get(doc_name).await {
            Ok(current) => current.rev,
            Err(e) if e.is_not_found() => None, // fresh insert
            Err(e) => return Err(e.into()),
        };

        match coll.put(record).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                log::warn!("snapshot write conflict on '{collection}/{doc_name}'");
                Err(StoreError::WriteConflict {
                    collection: collection.to_string(),
                    doc_name: doc_name.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    // ─── Op-log methods ───────────────────────────────────────────────

    /// Append one operation to a document's log.
    ///
    /// `op` must carry a non-negative integer `v`. A duplicate write for an
    /// existing `(doc, v)` key succeeds without storing anything: the calling
    /// engine may redeliver an op whose acknowledgement was lost, and that
    /// replay must be safe. Payloads are not compared, so a genuine version
    /// collision with divergent content is indistinguishable from redelivery
    /// at this layer.
    pub async fn write_op(
        &self,
        collection: &str,
        doc_name: &str,
        op: &OpPayload,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.check_collection_name(collection)?;
        let version = op_version(op).ok_or(StoreError::MissingVersion)?;

        let coll = self.oplog_handle(collection).await?;
        match coll.put(to_op_record(doc_name, version, op)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_conflict() => {
                log::debug!("duplicate op write for '{doc_name}' v{version}, treating as redelivery");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current version of a document: one past the highest version in its
    /// op-log, or 0 when no operation exists yet.
    ///
    /// Derived entirely from the op-log with a single descending limit-1
    /// scan — never from the snapshot's stored version.
    pub async fn get_version(&self, collection: &str, doc_name: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;
        self.check_collection_name(collection)?;

        let coll = self.oplog_handle(collection).await?;
        let entries = coll
            .range_scan(
                &op_key_prefix(doc_name),
                &op_scan_end(doc_name),
                ScanOptions {
                    limit: Some(1),
                    descending: true,
                    include_records: true,
                },
            )
            .await?;

        match entries.first() {
            None => Ok(0),
            Some(entry) => {
                let version = entry
                    .doc
                    .as_ref()
                    .and_then(|doc| doc.body.get(OP_VERSION_FIELD))
                    .and_then(Value::as_u64)
                    .or_else(|| version_from_key(&entry.key))
                    .ok_or_else(|| BackendError::Corrupt(entry.key.clone()))?;
                Ok(version + 1)
            }
        }
    }

    /// Read a document's operations over `[start, end)` in ascending version
    /// order. `end = None` means through the latest. `start == end` returns
    /// an empty sequence without touching the store.
    ///
    /// Returned ops carry their original payload (including `v`); the
    /// composite key and the denormalized document name are stripped.
    pub async fn get_ops(
        &self,
        collection: &str,
        doc_name: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Vec<OpPayload>, StoreError> {
        self.ensure_open()?;
        self.check_collection_name(collection)?;
        if let Some(end) = end {
            if end <= start {
                return Ok(Vec::new());
            }
        }

        let coll = self.oplog_handle(collection).await?;
        let start_key = op_key(doc_name, start);
        let end_key = match end {
            Some(end) => op_key(doc_name, end),
            None => op_scan_end(doc_name),
        };
        let entries = coll
            .range_scan(&start_key, &end_key, ScanOptions::default())
            .await?;

        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries {
            let doc = entry
                .doc
                .ok_or_else(|| BackendError::Corrupt(entry.key.clone()))?;
            ops.push(strip_op_record(doc));
        }
        Ok(ops)
    }

    // ─── Guards and plumbing ──────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    /// Reject op-log collection names on public entry points, before any
    /// store I/O. Treating an op-log collection as a snapshot collection (or
    /// vice versa) would corrupt the pairing between the two.
    fn check_collection_name(&self, collection: &str) -> Result<(), StoreError> {
        if collection.ends_with(&self.config.oplog_suffix) {
            return Err(StoreError::InvalidCollection(collection.to_string()));
        }
        Ok(())
    }

    async fn handle(&self, name: &str) -> Result<Arc<dyn Collection>, StoreError> {
        {
            let map = self.collections.read().await;
            if let Some(coll) = map.get(name) {
                return Ok(coll.clone());
            }
        }
        let coll = self.backend.collection(name).await?;
        log::debug!("opened collection handle '{name}'");
        let mut map = self.collections.write().await;
        Ok(map.entry(name.to_string()).or_insert(coll).clone())
    }

    async fn oplog_handle(&self, collection: &str) -> Result<Arc<dyn Collection>, StoreError> {
        self.handle(&self.oplog_collection_name(collection)).await
    }
}
