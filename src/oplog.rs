//! Operation-log key scheme and record shaping.
//!
//! Every operation is stored under a composite key combining the document
//! name and the operation version:
//!
//! ```text
//! alice v00000000000000000000
//! alice v00000000000000000001
//! alice v00000000000000000009
//! alice v00000000000000000010   ← sorts after v9, unlike unpadded keys
//! ```
//!
//! Versions are encoded as fixed-width zero-padded decimals so lexical byte
//! order equals numeric order for the whole `u64` range. This deliberately
//! breaks key-level compatibility with stores written by the historical
//! unpadded `"{doc} v{n}"` scheme, whose ordering was wrong whenever versions
//! in one scanned range crossed a power-of-ten boundary.
//!
//! Stored op records denormalize the document name into a `name` field so
//! range scans can be verified against it; both the composite key and `name`
//! are stripped before ops are handed back to the caller.

use serde_json::{Map, Value};

use crate::backend::StoredDoc;

/// Digits in an encoded version (enough for the full `u64` range).
pub const VERSION_WIDTH: usize = 20;

/// Infix between the document name and the encoded version.
const VERSION_INFIX: &str = " v";

/// Denormalized document-name field on stored op records.
pub const NAME_FIELD: &str = "name";

/// Version field carried by every op payload.
pub const OP_VERSION_FIELD: &str = "v";

/// Composite key for one `(docName, version)` pair.
pub fn op_key(doc_name: &str, version: u64) -> String {
    format!("{doc_name}{VERSION_INFIX}{version:020}")
}

/// Smallest key of a document's op span (inclusive scan start).
pub fn op_key_prefix(doc_name: &str) -> String {
    format!("{doc_name}{VERSION_INFIX}")
}

/// Maximal sentinel key for open-ended scans over a document's op span.
/// `\u{fff0}` sorts after every encoded version digit.
pub fn op_scan_end(doc_name: &str) -> String {
    format!("{doc_name}{VERSION_INFIX}\u{fff0}")
}

/// Parse the version back out of a composite key.
pub fn version_from_key(key: &str) -> Option<u64> {
    let (_, encoded) = key.rsplit_once(VERSION_INFIX)?;
    if encoded.len() != VERSION_WIDTH {
        return None;
    }
    encoded.parse().ok()
}

/// Read the version an op payload declares, if any.
pub fn op_version(op: &Map<String, Value>) -> Option<u64> {
    op.get(OP_VERSION_FIELD)?.as_u64()
}

/// Shape an op payload into its stored record: composite key as the primary
/// key, document name denormalized into the body.
pub fn to_op_record(doc_name: &str, version: u64, op: &Map<String, Value>) -> StoredDoc {
    let mut body = op.clone();
    body.insert(NAME_FIELD.to_string(), Value::String(doc_name.to_string()));
    StoredDoc::new(op_key(doc_name, version), body)
}

/// Strip the storage-only fields off a scanned op record, leaving the
/// original payload (which keeps its own `v`).
pub fn strip_op_record(doc: StoredDoc) -> Map<String, Value> {
    let mut body = doc.body;
    body.remove(NAME_FIELD);
    body
}
