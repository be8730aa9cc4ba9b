//! Backing document-store abstraction.
//!
//! The adapter never talks to a concrete database directly; it goes through
//! the [`Backend`]/[`Collection`] traits, which model the four primitives a
//! revisioned keyed document store must provide:
//!
//! ```text
//! ┌───────────────┐   collection(name)   ┌──────────────────┐
//! │   Backend     │ ───────────────────► │   Collection     │
//! │ (whole store) │                      │ (one keyspace)   │
//! └───────────────┘                      │                  │
//!                                        │ get(key)         │
//!                                        │ put(doc, rev)    │
//!                                        │ multi_get(keys)  │
//!                                        │ range_scan(a, b) │
//!                                        └──────────────────┘
//! ```
//!
//! Every record carries an opaque revision token. `put` enforces optimistic
//! concurrency: the caller must present the token it last read (or none for a
//! fresh insert), and a mismatch is reported with the dedicated
//! [`BackendError::Conflict`] sentinel so upper layers can special-case it.
//!
//! Range scans order keys by strict lexical byte comparison, which is the
//! property the op-log key scheme in [`crate::oplog`] relies on.

pub mod memory;
pub mod rocks;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A store-facing record: primary key, opaque revision token, and a
/// structured body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDoc {
    /// Primary key within the collection.
    pub id: String,
    /// Revision token of the version this record was read at, or the token
    /// to present on a conditional write. `None` means "fresh insert".
    pub rev: Option<String>,
    /// Record fields.
    pub body: Map<String, Value>,
}

impl StoredDoc {
    /// Create a record with no revision token (a fresh insert candidate).
    pub fn new(id: impl Into<String>, body: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            body,
        }
    }

    /// Attach a revision token.
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }
}

/// Options for a bounded range scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Maximum number of entries to return (`None` = unbounded).
    pub limit: Option<usize>,
    /// Scan from the end of the range towards the start.
    pub descending: bool,
    /// Attach full records to the returned entries. When `false` only keys
    /// are returned, which lets backends skip value decoding.
    pub include_records: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            limit: None,
            descending: false,
            include_records: true,
        }
    }
}

/// One entry of a range scan result.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanEntry {
    /// The record's key.
    pub key: String,
    /// The record itself, present iff `include_records` was set.
    pub doc: Option<StoredDoc>,
}

/// Errors surfaced by backend implementations.
///
/// `Conflict` and `NotFound` are stable sentinels the adapter matches on;
/// everything else is opaque and propagated verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    /// No record exists under the requested key.
    NotFound(String),
    /// Conditional write rejected: the presented revision token does not
    /// match the current record (or an insert hit an existing key).
    Conflict(String),
    /// A stored record could not be decoded.
    Corrupt(String),
    /// Any other backend failure.
    Io(String),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::NotFound(key) => write!(f, "no record for key '{key}'"),
            BackendError::Conflict(key) => write!(f, "revision conflict on key '{key}'"),
            BackendError::Corrupt(key) => write!(f, "undecodable record at key '{key}'"),
            BackendError::Io(e) => write!(f, "backend error: {e}"),
        }
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    /// Whether this is the optimistic-concurrency conflict sentinel.
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }

    /// Whether this is the missing-key sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

/// One keyspace of the backing store.
#[async_trait]
pub trait Collection: Send + Sync {
    /// Point lookup. Absence is reported as [`BackendError::NotFound`].
    async fn get(&self, key: &str) -> Result<StoredDoc, BackendError>;

    /// Conditional write. `doc.rev` must hold the current revision token
    /// (`None` for a fresh insert); on success the new token is returned, on
    /// mismatch [`BackendError::Conflict`].
    async fn put(&self, doc: StoredDoc) -> Result<String, BackendError>;

    /// Batched point lookup. The result has one slot per requested key, in
    /// request order, with `None` for absent keys.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<StoredDoc>>, BackendError>;

    /// Ordered scan over `[start, end)` in lexical byte order of keys.
    async fn range_scan(
        &self,
        start: &str,
        end: &str,
        opts: ScanOptions,
    ) -> Result<Vec<ScanEntry>, BackendError>;
}

/// A whole backing store: a factory of collection handles.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open (or re-open) a collection handle. Idempotent and side-effect-free
    /// beyond first-use initialization, so redundant opens under race are
    /// harmless.
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, BackendError>;
}

/// Produce the revision token that follows `current` for a write to `key`.
///
/// Tokens are `generation-hash` strings: the generation counts writes to the
/// key, the hash suffix makes tokens from divergent histories distinguishable.
pub(crate) fn next_rev(key: &str, current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(gen, _)| gen.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    generation.hash(&mut hasher);
    current.hash(&mut hasher);
    format!("{generation}-{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_rev_generation_advances() {
        let r1 = next_rev("doc", None);
        assert!(r1.starts_with("1-"));

        let r2 = next_rev("doc", Some(&r1));
        assert!(r2.starts_with("2-"));

        let r3 = next_rev("doc", Some(&r2));
        assert!(r3.starts_with("3-"));
    }

    #[test]
    fn test_next_rev_garbage_token_restarts() {
        // An unparseable token degrades to generation 1 rather than panicking.
        let r = next_rev("doc", Some("not-a-rev"));
        assert!(r.starts_with("1-"));
    }

    #[test]
    fn test_error_sentinels() {
        assert!(BackendError::Conflict("k".into()).is_conflict());
        assert!(!BackendError::Conflict("k".into()).is_not_found());
        assert!(BackendError::NotFound("k".into()).is_not_found());
        assert!(!BackendError::Io("boom".into()).is_conflict());
    }

    #[test]
    fn test_error_display() {
        let e = BackendError::Conflict("doc1".into());
        assert!(e.to_string().contains("conflict"));
        let e = BackendError::NotFound("doc1".into());
        assert!(e.to_string().contains("doc1"));
    }

    #[test]
    fn test_scan_options_default() {
        let opts = ScanOptions::default();
        assert!(opts.limit.is_none());
        assert!(!opts.descending);
        assert!(opts.include_records);
    }
}
