//! In-memory backend for tests and small deployments.
//!
//! Collections are `BTreeMap`s, so lexical key ordering — the contract range
//! scans depend on — falls out of the map itself. Each collection keeps call
//! counters so tests can assert that an operation did (or did not) reach the
//! store at all.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{next_rev, Backend, BackendError, Collection, ScanEntry, ScanOptions, StoredDoc};

/// Per-collection call counts, for observability in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: u64,
    pub puts: u64,
    pub multi_gets: u64,
    pub scans: u64,
}

impl CallCounts {
    /// Total number of store calls of any kind.
    pub fn total(&self) -> u64 {
        self.gets + self.puts + self.multi_gets + self.scans
    }
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    multi_gets: AtomicU64,
    scans: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CallCounts {
        CallCounts {
            gets: self.gets.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            multi_gets: self.multi_gets.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
        }
    }
}

/// One stored record: revision token plus body.
#[derive(Debug, Clone)]
struct Record {
    rev: String,
    body: Map<String, Value>,
}

/// A single in-memory keyspace.
struct MemoryCollection {
    docs: RwLock<BTreeMap<String, Record>>,
    counters: Counters,
}

impl MemoryCollection {
    fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            counters: Counters::default(),
        }
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    async fn get(&self, key: &str) -> Result<StoredDoc, BackendError> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let docs = self.docs.read().await;
        match docs.get(key) {
            Some(record) => Ok(StoredDoc {
                id: key.to_string(),
                rev: Some(record.rev.clone()),
                body: record.body.clone(),
            }),
            None => Err(BackendError::NotFound(key.to_string())),
        }
    }

    async fn put(&self, doc: StoredDoc) -> Result<String, BackendError> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        let mut docs = self.docs.write().await;
        let current = docs.get(&doc.id).map(|r| r.rev.clone());

        // The presented token must match the stored one exactly; a fresh
        // insert must not find an existing record.
        match (&doc.rev, &current) {
            (None, None) => {}
            (Some(presented), Some(stored)) if presented == stored => {}
            _ => return Err(BackendError::Conflict(doc.id)),
        }

        let new_rev = next_rev(&doc.id, current.as_deref());
        docs.insert(
            doc.id,
            Record {
                rev: new_rev.clone(),
                body: doc.body,
            },
        );
        Ok(new_rev)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<StoredDoc>>, BackendError> {
        self.counters.multi_gets.fetch_add(1, Ordering::Relaxed);
        let docs = self.docs.read().await;
        Ok(keys
            .iter()
            .map(|key| {
                docs.get(key).map(|record| StoredDoc {
                    id: key.clone(),
                    rev: Some(record.rev.clone()),
                    body: record.body.clone(),
                })
            })
            .collect())
    }

    async fn range_scan(
        &self,
        start: &str,
        end: &str,
        opts: ScanOptions,
    ) -> Result<Vec<ScanEntry>, BackendError> {
        self.counters.scans.fetch_add(1, Ordering::Relaxed);
        if start >= end {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().await;
        let range = docs.range::<str, _>((Bound::Included(start), Bound::Excluded(end)));

        let to_entry = |(key, record): (&String, &Record)| ScanEntry {
            key: key.clone(),
            doc: opts.include_records.then(|| StoredDoc {
                id: key.clone(),
                rev: Some(record.rev.clone()),
                body: record.body.clone(),
            }),
        };

        let limit = opts.limit.unwrap_or(usize::MAX);
        let entries: Vec<ScanEntry> = if opts.descending {
            range.rev().take(limit).map(to_entry).collect()
        } else {
            range.take(limit).map(to_entry).collect()
        };
        Ok(entries)
    }
}

/// In-memory [`Backend`]: a registry of [`MemoryCollection`]s.
#[derive(Default)]
pub struct MemoryBackend {
    collections: RwLock<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn open(&self, name: &str) -> Arc<MemoryCollection> {
        {
            let map = self.collections.read().await;
            if let Some(coll) = map.get(name) {
                return coll.clone();
            }
        }
        let mut map = self.collections.write().await;
        map.entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new()))
            .clone()
    }

    /// Call counts for one collection (zeroes if it was never opened).
    pub async fn call_counts(&self, name: &str) -> CallCounts {
        let map = self.collections.read().await;
        map.get(name)
            .map(|coll| coll.counters.snapshot())
            .unwrap_or_default()
    }

    /// Total store calls across every collection.
    pub async fn total_calls(&self) -> u64 {
        let map = self.collections.read().await;
        map.values().map(|coll| coll.counters.snapshot().total()).sum()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, BackendError> {
        let coll: Arc<dyn Collection> = self.open(name).await;
        Ok(coll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    async fn coll(backend: &MemoryBackend) -> Arc<dyn Collection> {
        backend.collection("test").await.unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        let rev = c
            .put(StoredDoc::new("a", body(&[("x", json!(1))])))
            .await
            .unwrap();
        assert!(rev.starts_with("1-"));

        let doc = c.get("a").await.unwrap();
        assert_eq!(doc.id, "a");
        assert_eq!(doc.rev.as_deref(), Some(rev.as_str()));
        assert_eq!(doc.body["x"], json!(1));
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;
        let err = c.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_insert_over_existing_conflicts() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        c.put(StoredDoc::new("a", body(&[("x", json!(1))])))
            .await
            .unwrap();
        let err = c
            .put(StoredDoc::new("a", body(&[("x", json!(2))])))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_with_current_rev() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        let rev1 = c
            .put(StoredDoc::new("a", body(&[("x", json!(1))])))
            .await
            .unwrap();
        let rev2 = c
            .put(StoredDoc::new("a", body(&[("x", json!(2))])).with_rev(rev1.clone()))
            .await
            .unwrap();
        assert_ne!(rev1, rev2);
        assert!(rev2.starts_with("2-"));

        // Writing again with the stale token must conflict.
        let err = c
            .put(StoredDoc::new("a", body(&[("x", json!(3))])).with_rev(rev1))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_stale_rev_for_missing_doc_conflicts() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;
        let err = c
            .put(StoredDoc::new("ghost", Map::new()).with_rev("1-deadbeef"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_multi_get_preserves_order_and_absents() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        c.put(StoredDoc::new("a", body(&[("n", json!("a"))])))
            .await
            .unwrap();
        c.put(StoredDoc::new("c", body(&[("n", json!("c"))])))
            .await
            .unwrap();

        let keys = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        let result = c.multi_get(&keys).await.unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].as_ref().unwrap().body["n"], json!("c"));
        assert!(result[1].is_none());
        assert_eq!(result[2].as_ref().unwrap().body["n"], json!("a"));
    }

    #[tokio::test]
    async fn test_range_scan_ascending_bounds() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        for key in ["a", "b", "c", "d"] {
            c.put(StoredDoc::new(key, Map::new())).await.unwrap();
        }

        let entries = c
            .range_scan("b", "d", ScanOptions::default())
            .await
            .unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]); // end is exclusive
    }

    #[tokio::test]
    async fn test_range_scan_descending_with_limit() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        for key in ["k1", "k2", "k3"] {
            c.put(StoredDoc::new(key, Map::new())).await.unwrap();
        }

        let entries = c
            .range_scan(
                "k",
                "l",
                ScanOptions {
                    limit: Some(1),
                    descending: true,
                    include_records: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "k3");
        assert!(entries[0].doc.is_some());
    }

    #[tokio::test]
    async fn test_range_scan_keys_only() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;
        c.put(StoredDoc::new("a", body(&[("x", json!(1))])))
            .await
            .unwrap();

        let entries = c
            .range_scan(
                "a",
                "b",
                ScanOptions {
                    include_records: false,
                    ..ScanOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].doc.is_none());
    }

    #[tokio::test]
    async fn test_range_scan_empty_and_inverted_ranges() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;
        c.put(StoredDoc::new("a", Map::new())).await.unwrap();

        assert!(c
            .range_scan("a", "a", ScanOptions::default())
            .await
            .unwrap()
            .is_empty());
        assert!(c
            .range_scan("z", "a", ScanOptions::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let backend = MemoryBackend::new();
        let c1 = backend.collection("one").await.unwrap();
        let c2 = backend.collection("two").await.unwrap();

        c1.put(StoredDoc::new("a", body(&[("from", json!("one"))])))
            .await
            .unwrap();
        assert!(c2.get("a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_call_counters() {
        let backend = MemoryBackend::new();
        let c = coll(&backend).await;

        c.put(StoredDoc::new("a", Map::new())).await.unwrap();
        let _ = c.get("a").await;
        let _ = c.get("missing").await;
        let _ = c.multi_get(&["a".to_string()]).await;
        let _ = c.range_scan("a", "z", ScanOptions::default()).await;

        let counts = backend.call_counts("test").await;
        assert_eq!(counts.puts, 1);
        assert_eq!(counts.gets, 2);
        assert_eq!(counts.multi_gets, 1);
        assert_eq!(counts.scans, 1);
        assert_eq!(counts.total(), 5);
        assert_eq!(backend.total_calls().await, 5);

        // A never-opened collection reports zeroes.
        assert_eq!(backend.call_counts("other").await, CallCounts::default());
    }
}
