//! RocksDB-backed durable backend.
//!
//! Logical collections are multiplexed into one database: every key is
//! prefixed with `collection\0`, so a collection occupies one contiguous,
//! lexically ordered key span and range scans stay cheap.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 RocksDB                       │
//! │                                              │
//! │  docs\0alice        → {rev, body}            │
//! │  docs\0bob          → {rev, body}            │
//! │  docs_ops\0alice v… → {rev, body}            │
//! │  docs_ops\0bob v…   → {rev, body}            │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Records are serialized with `serde_json` (bodies are arbitrary JSON maps,
//! which rules out non-self-describing codecs) and carry their revision token
//! inline. RocksDB has no compare-and-swap, so conditional puts run the
//! read-check-write sequence under a single writer mutex.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, DBCompressionType, DBWithThreadMode, Direction, IteratorMode,
    Options, SingleThreaded, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use super::{next_rev, Backend, BackendError, Collection, ScanEntry, ScanOptions, StoredDoc};

/// Separator between the collection prefix and the logical key.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("live_store_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl RocksConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk record layout: revision token plus body.
#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    rev: String,
    body: Map<String, Value>,
}

type Db = DBWithThreadMode<SingleThreaded>;

/// RocksDB-backed [`Backend`].
pub struct RocksBackend {
    db: Arc<Db>,
    config: RocksConfig,
    /// Serializes the read-check-write sequence of conditional puts.
    write_lock: Arc<Mutex<()>>,
}

impl RocksBackend {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: RocksConfig) -> Result<Self, BackendError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_write_buffer_size(config.write_buffer_size);
        db_opts.set_compression_type(DBCompressionType::Lz4);

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        db_opts.set_block_based_table_factory(&block_opts);

        let db = Db::open(&db_opts, &config.path)
            .map_err(|e| BackendError::Io(e.to_string()))?;

        log::info!("opened rocks store at {}", config.path.display());
        Ok(Self {
            db: Arc::new(db),
            config,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[async_trait]
impl Backend for RocksBackend {
    async fn collection(&self, name: &str) -> Result<Arc<dyn Collection>, BackendError> {
        if name.is_empty() || name.as_bytes().contains(&KEY_SEPARATOR) {
            return Err(BackendError::Io(format!(
                "invalid collection name '{name}'"
            )));
        }
        Ok(Arc::new(RocksCollection {
            db: self.db.clone(),
            name: name.to_string(),
            write_lock: self.write_lock.clone(),
            sync_writes: self.config.sync_writes,
        }))
    }
}

/// One logical collection inside the shared database.
struct RocksCollection {
    db: Arc<Db>,
    name: String,
    write_lock: Arc<Mutex<()>>,
    sync_writes: bool,
}

impl RocksCollection {
    /// Build the physical key: `collection\0key`.
    fn full_key(&self, key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 1 + key.len());
        out.extend_from_slice(self.name.as_bytes());
        out.push(KEY_SEPARATOR);
        out.extend_from_slice(key.as_bytes());
        out
    }

    /// Strip the collection prefix off a physical key.
    fn logical_key(&self, full: &[u8]) -> Option<String> {
        let prefix_len = self.name.len() + 1;
        if full.len() < prefix_len
            || &full[..self.name.len()] != self.name.as_bytes()
            || full[self.name.len()] != KEY_SEPARATOR
        {
            return None;
        }
        String::from_utf8(full[prefix_len..].to_vec()).ok()
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> Result<DiskRecord, BackendError> {
        serde_json::from_slice(bytes).map_err(|_| BackendError::Corrupt(key.to_string()))
    }

    fn encode(&self, record: &DiskRecord) -> Result<Vec<u8>, BackendError> {
        serde_json::to_vec(record).map_err(|e| BackendError::Io(e.to_string()))
    }

    fn read_current_rev(&self, key: &str) -> Result<Option<String>, BackendError> {
        let bytes = self
            .db
            .get(self.full_key(key))
            .map_err(|e| BackendError::Io(e.to_string()))?;
        match bytes {
            Some(bytes) => Ok(Some(self.decode(key, &bytes)?.rev)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Collection for RocksCollection {
    async fn get(&self, key: &str) -> Result<StoredDoc, BackendError> {
        let bytes = self
            .db
            .get(self.full_key(key))
            .map_err(|e| BackendError::Io(e.to_string()))?
            .ok_or_else(|| BackendError::NotFound(key.to_string()))?;
        let record = self.decode(key, &bytes)?;
        Ok(StoredDoc {
            id: key.to_string(),
            rev: Some(record.rev),
            body: record.body,
        })
    }

    async fn put(&self, doc: StoredDoc) -> Result<String, BackendError> {
        let _guard = self.write_lock.lock().await;

        let current = self.read_current_rev(&doc.id)?;
        match (&doc.rev, &current) {
            (None, None) => {}
            (Some(presented), Some(stored)) if presented == stored => {}
            _ => return Err(BackendError::Conflict(doc.id)),
        }

        let new_rev = next_rev(&doc.id, current.as_deref());
        let record = DiskRecord {
            rev: new_rev.clone(),
            body: doc.body,
        };
        let bytes = self.encode(&record)?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);
        self.db
            .put_opt(self.full_key(&doc.id), bytes, &write_opts)
            .map_err(|e| BackendError::Io(e.to_string()))?;
        Ok(new_rev)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<StoredDoc>>, BackendError> {
        let full_keys: Vec<Vec<u8>> = keys.iter().map(|k| self.full_key(k)).collect();
        let results = self.db.multi_get(full_keys);

        let mut out = Vec::with_capacity(keys.len());
        for (key, result) in keys.iter().zip(results) {
            let bytes = result.map_err(|e| BackendError::Io(e.to_string()))?;
            match bytes {
                Some(bytes) => {
                    let record = self.decode(key, &bytes)?;
                    out.push(Some(StoredDoc {
                        id: key.clone(),
                        rev: Some(record.rev),
                        body: record.body,
                    }));
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    async fn range_scan(
        &self,
        start: &str,
        end: &str,
        opts: ScanOptions,
    ) -> Result<Vec<ScanEntry>, BackendError> {
        if start >= end {
            return Ok(Vec::new());
        }
        let full_start = self.full_key(start);
        let full_end = self.full_key(end);
        let limit = opts.limit.unwrap_or(usize::MAX);

        let mode = if opts.descending {
            // Reverse iteration seeks to the last key <= full_end; the
            // exclusive bound itself is skipped below.
            IteratorMode::From(&full_end, Direction::Reverse)
        } else {
            IteratorMode::From(&full_start, Direction::Forward)
        };

        let mut entries = Vec::new();
        for item in self.db.iterator(mode) {
            let (key, value) = item.map_err(|e| BackendError::Io(e.to_string()))?;
            if opts.descending {
                if key.as_ref() >= full_end.as_slice() {
                    continue;
                }
                if key.as_ref() < full_start.as_slice() {
                    break;
                }
            } else if key.as_ref() >= full_end.as_slice() {
                break;
            }

            let logical = match self.logical_key(&key) {
                Some(k) => k,
                None => break, // walked out of this collection's span
            };
            let doc = if opts.include_records {
                let record = self.decode(&logical, &value)?;
                Some(StoredDoc {
                    id: logical.clone(),
                    rev: Some(record.rev),
                    body: record.body,
                })
            } else {
                None
            };
            entries.push(ScanEntry { key: logical, doc });
            if entries.len() >= limit {
                break;
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_test_backend(dir: &tempfile::TempDir) -> RocksBackend {
        RocksBackend::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn body(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let c = backend.collection("docs").await.unwrap();

        let rev = c
            .put(StoredDoc::new("alice", body(&[("greeting", json!("hi"))])))
            .await
            .unwrap();

        let doc = c.get("alice").await.unwrap();
        assert_eq!(doc.rev.as_deref(), Some(rev.as_str()));
        assert_eq!(doc.body["greeting"], json!("hi"));
    }

    #[tokio::test]
    async fn test_missing_key_not_found() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let c = backend.collection("docs").await.unwrap();
        assert!(c.get("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_conditional_put_conflicts() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let c = backend.collection("docs").await.unwrap();

        let rev1 = c.put(StoredDoc::new("a", Map::new())).await.unwrap();

        // Insert over existing record.
        assert!(c
            .put(StoredDoc::new("a", Map::new()))
            .await
            .unwrap_err()
            .is_conflict());

        // Update with current token succeeds, with stale token conflicts.
        let rev2 = c
            .put(StoredDoc::new("a", Map::new()).with_rev(rev1.clone()))
            .await
            .unwrap();
        assert_ne!(rev1, rev2);
        assert!(c
            .put(StoredDoc::new("a", Map::new()).with_rev(rev1))
            .await
            .unwrap_err()
            .is_conflict());
    }

    #[tokio::test]
    async fn test_collections_share_db_but_not_keys() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let docs = backend.collection("docs").await.unwrap();
        let ops = backend.collection("docs_ops").await.unwrap();

        docs.put(StoredDoc::new("alice", body(&[("kind", json!("doc"))])))
            .await
            .unwrap();
        ops.put(StoredDoc::new("alice", body(&[("kind", json!("op"))])))
            .await
            .unwrap();

        assert_eq!(docs.get("alice").await.unwrap().body["kind"], json!("doc"));
        assert_eq!(ops.get("alice").await.unwrap().body["kind"], json!("op"));
    }

    #[tokio::test]
    async fn test_range_scan_stays_inside_collection() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let docs = backend.collection("docs").await.unwrap();
        let other = backend.collection("docsz").await.unwrap();

        docs.put(StoredDoc::new("k1", Map::new())).await.unwrap();
        docs.put(StoredDoc::new("k2", Map::new())).await.unwrap();
        other.put(StoredDoc::new("k1", Map::new())).await.unwrap();

        let entries = docs
            .range_scan("k", "l", ScanOptions::default())
            .await
            .unwrap();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2"]);
    }

    #[tokio::test]
    async fn test_range_scan_descending_limit() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let c = backend.collection("docs").await.unwrap();

        for key in ["a1", "a2", "a3"] {
            c.put(StoredDoc::new(key, Map::new())).await.unwrap();
        }

        let entries = c
            .range_scan(
                "a",
                "b",
                ScanOptions {
                    limit: Some(1),
                    descending: true,
                    include_records: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "a3");
    }

    #[tokio::test]
    async fn test_multi_get_order_and_absents() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        let c = backend.collection("docs").await.unwrap();

        c.put(StoredDoc::new("x", body(&[("v", json!(1))])))
            .await
            .unwrap();

        let result = c
            .multi_get(&["missing".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert!(result[0].is_none());
        assert_eq!(result[1].as_ref().unwrap().body["v"], json!(1));
    }

    #[tokio::test]
    async fn test_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let backend = RocksBackend::open(RocksConfig::for_testing(&path)).unwrap();
            let c = backend.collection("docs").await.unwrap();
            c.put(StoredDoc::new("persist", body(&[("ok", json!(true))])))
                .await
                .unwrap();
        }

        let backend = RocksBackend::open(RocksConfig::for_testing(&path)).unwrap();
        let c = backend.collection("docs").await.unwrap();
        assert_eq!(c.get("persist").await.unwrap().body["ok"], json!(true));
    }

    #[tokio::test]
    async fn test_invalid_collection_name() {
        let dir = tempdir().unwrap();
        let backend = open_test_backend(&dir).await;
        assert!(backend.collection("").await.is_err());
        assert!(backend.collection("bad\0name").await.is_err());
    }
}
