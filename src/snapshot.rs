//! Snapshot model and store-record casting.
//!
//! A snapshot is the current materialized state of one document. Stored form
//! and domain form differ: object payloads are flattened field-for-field into
//! the record body, any other payload is wrapped under a single `data` key so
//! scalars and arrays survive a keyed store. The body additionally carries
//! the document type and version under reserved field names; the primary key
//! is always re-derived from the document name and never lives in the
//! payload.
//!
//! A `doc_type` of `None` is the tombstone marker: the document is logically
//! deleted but its record is retained so a later re-creation continues the
//! version sequence instead of restarting at 0.

use serde_json::{Map, Value};

use crate::backend::StoredDoc;

/// Reserved body field holding the document's type URI.
pub const TYPE_FIELD: &str = "_type";

/// Reserved body field holding the document version.
pub const VERSION_FIELD: &str = "_v";

/// Wrapper key for non-object payloads.
const DATA_FIELD: &str = "data";

/// Snapshot metadata. Carries at minimum the backing store's opaque revision
/// token, which `write_snapshot` refreshes on every write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Revision token of the stored record this snapshot was read from.
    pub rev: Option<String>,
}

/// Current materialized state of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Document name (the primary key within its collection).
    pub doc_name: String,
    /// OT type URI. `None` marks a tombstone.
    pub doc_type: Option<String>,
    /// Document version.
    pub version: u64,
    /// Document payload.
    pub data: Value,
    /// Store metadata.
    pub meta: SnapshotMeta,
}

impl Snapshot {
    pub fn new(
        doc_name: impl Into<String>,
        doc_type: Option<String>,
        version: u64,
        data: Value,
    ) -> Self {
        Self {
            doc_name: doc_name.into(),
            doc_type,
            version,
            data,
            meta: SnapshotMeta::default(),
        }
    }

    /// Whether this snapshot marks a logically deleted document.
    pub fn is_tombstone(&self) -> bool {
        self.doc_type.is_none()
    }
}

/// Cast a domain snapshot to its store-facing record.
///
/// The primary key is taken from `doc_name`, never from the payload; the
/// revision token travels in the record's `rev` slot.
pub fn cast_to_doc(doc_name: &str, snapshot: &Snapshot) -> StoredDoc {
    let mut body = match &snapshot.data {
        Value::Object(fields) => fields.clone(),
        other => {
            let mut wrapped = Map::new();
            wrapped.insert(DATA_FIELD.to_string(), other.clone());
            wrapped
        }
    };
    body.insert(
        TYPE_FIELD.to_string(),
        match &snapshot.doc_type {
            Some(uri) => Value::String(uri.clone()),
            None => Value::Null,
        },
    );
    body.insert(VERSION_FIELD.to_string(), Value::from(snapshot.version));

    StoredDoc {
        id: doc_name.to_string(),
        rev: snapshot.meta.rev.clone(),
        body,
    }
}

/// Cast a store record back to a domain snapshot.
///
/// Inverse of [`cast_to_doc`] for the fields `data`, `doc_type`, `version`,
/// `meta.rev` and `doc_name`. A body that is exactly one non-object `data`
/// field is unwrapped back to its scalar/array payload; an object payload
/// whose only field happens to be a non-object `data` is therefore
/// indistinguishable from a wrapped scalar (same ambiguity as the original
/// cast scheme, see DESIGN.md).
pub fn cast_to_snapshot(doc: StoredDoc) -> Snapshot {
    let StoredDoc { id, rev, mut body } = doc;

    let doc_type = match body.remove(TYPE_FIELD) {
        Some(Value::String(uri)) => Some(uri),
        _ => None,
    };
    let version = body
        .remove(VERSION_FIELD)
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let unwrap_payload =
        body.len() == 1 && body.get(DATA_FIELD).map(|v| !v.is_object()).unwrap_or(false);
    let data = if unwrap_payload {
        body.remove(DATA_FIELD).unwrap_or(Value::Null)
    } else {
        Value::Object(body)
    };

    Snapshot {
        doc_name: id,
        doc_type,
        version,
        data,
        meta: SnapshotMeta { rev },
    }
}
