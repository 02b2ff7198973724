//! Content-addressed asset cache
//!
//! Metadata lives in an in-memory index keyed by content hash; bytes live on
//! disk under `blobs/<first two chars>/<hash>`. The index is written to
//! `index.json` by [`AssetStore::flush`] and reloaded by [`AssetStore::open`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

const INDEX_FILE: &str = "index.json";
const BLOB_DIR: &str = "blobs";
const PART_SUFFIX: &str = ".part";

/// Metadata for one cached asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Content hash, also the lookup key
    pub hash: String,

    /// Location of the bytes on disk
    pub file_path: PathBuf,

    pub mime_type: String,

    /// Size in bytes
    pub size: u64,

    /// Last upload or download
    pub last_touched: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Options for [`AssetStore::remove`]
#[derive(Debug, Clone, Copy)]
pub struct RemoveOptions {
    /// Also delete the blob file
    pub remove_file: bool,
}

/// Check that a hash is safe to use as a file name.
///
/// Accepts 8 to 128 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_hash(hash: &str) -> bool {
    (8..=128).contains(&hash.len())
        && hash
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Asset cache rooted at a directory.
#[derive(Debug)]
pub struct AssetStore {
    root: PathBuf,
    index: DashMap<String, AssetRecord>,
    dirty: AtomicBool,
    uploads: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AssetStore {
    /// Open (or create) the store at `root`.
    ///
    /// Reloads `index.json`, drops records whose blob is gone, and deletes
    /// blobs nobody indexes along with leftover partial uploads.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, String> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOB_DIR))
            .map_err(|e| format!("Failed to create asset directory {}: {}", root.display(), e))?;

        let store = Self {
            root,
            index: DashMap::new(),
            dirty: AtomicBool::new(false),
            uploads: DashMap::new(),
        };
        store.load_index()?;
        store.reconcile();
        Ok(store)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    fn load_index(&self) -> Result<(), String> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;

        let records: Vec<AssetRecord> = match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                // A corrupt index only loses metadata; the blobs get swept below.
                log::warn!("Ignoring unreadable asset index {}: {}", path.display(), e);
                return Ok(());
            }
        };

        for mut record in records {
            if !is_valid_hash(&record.hash) {
                continue;
            }
            record.file_path = self.path_for(&record.hash);
            if record.file_path.is_file() {
                self.index.insert(record.hash.clone(), record);
            } else {
                self.dirty.store(true, Ordering::Relaxed);
            }
        }

        log::info!("Loaded {} asset record(s) from {}", self.index.len(), path.display());
        Ok(())
    }

    /// Delete blobs missing from the index and stale partial uploads.
    fn reconcile(&self) {
        let blob_root = self.root.join(BLOB_DIR);
        let mut removed = 0usize;

        for entry in WalkDir::new(&blob_root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let name = entry.file_name().to_string_lossy();
            let orphan = name.ends_with(PART_SUFFIX) || !self.index.contains_key(name.as_ref());
            if orphan {
                if let Err(e) = fs::remove_file(entry.path()) {
                    log::warn!("Failed to remove orphan asset {}: {}", entry.path().display(), e);
                } else {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            log::info!("Removed {} orphan asset file(s)", removed);
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic blob location for a hash.
    pub fn path_for(&self, hash: &str) -> PathBuf {
        let shard: String = hash.chars().take(2).collect();
        self.root.join(BLOB_DIR).join(shard).join(hash)
    }

    /// Unique temporary path for an in-flight upload of `hash`.
    pub fn part_path_for(&self, hash: &str) -> PathBuf {
        let final_path = self.path_for(hash);
        final_path.with_file_name(format!(
            "{}.{}{}",
            hash,
            uuid::Uuid::new_v4().simple(),
            PART_SUFFIX
        ))
    }

    /// Per-hash lock serializing uploads of the same asset.
    pub fn upload_slot(&self, hash: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.uploads.entry(hash.to_string()).or_default().clone()
    }

    /// Forget the slot for `hash` once no upload holds or awaits it.
    pub fn release_upload_slot(&self, hash: &str) {
        self.uploads
            .remove_if(hash, |_, slot| Arc::strong_count(slot) == 1);
    }

    pub fn has(&self, hash: &str) -> bool {
        self.index.contains_key(hash)
    }

    /// Record exists and its blob is on disk.
    pub fn file_present(&self, hash: &str) -> bool {
        self.index
            .get(hash)
            .map(|record| record.file_path.is_file())
            .unwrap_or(false)
    }

    pub fn get(&self, hash: &str) -> Option<AssetRecord> {
        self.index.get(hash).map(|r| r.value().clone())
    }

    /// Look up several hashes, preserving order. Unknown hashes map to `None`.
    pub fn get_many<S: AsRef<str>>(&self, hashes: &[S]) -> Vec<(String, Option<AssetRecord>)> {
        hashes
            .iter()
            .map(|hash| {
                let hash = hash.as_ref();
                (hash.to_string(), self.get(hash))
            })
            .collect()
    }

    /// All records, most recently touched first.
    pub fn list(&self) -> Vec<AssetRecord> {
        let mut records: Vec<AssetRecord> = self.index.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.last_touched.cmp(&a.last_touched));
        records
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: AssetRecord) {
        self.index.insert(record.hash.clone(), record);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Refresh `last_touched` without reading the blob.
    pub fn touch(&self, hash: &str) {
        if let Some(mut record) = self.index.get_mut(hash) {
            record.last_touched = Utc::now();
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    /// Drop a record, optionally deleting its blob.
    pub fn remove(&self, hash: &str, options: RemoveOptions) -> Option<AssetRecord> {
        let removed = self.index.remove(hash).map(|(_, record)| record);
        if let Some(record) = &removed {
            self.dirty.store(true, Ordering::Relaxed);
            if options.remove_file {
                if let Err(e) = fs::remove_file(&record.file_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to delete asset file {}: {}", record.file_path.display(), e);
                    }
                }
            }
        }
        removed
    }

    /// Remove records untouched for longer than `ttl`. Returns the count.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let ttl = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => ttl,
            Err(_) => return 0,
        };
        // A TTL reaching before the representable range never expires anything
        let Some(cutoff) = now.checked_sub_signed(ttl) else {
            return 0;
        };

        let expired: Vec<String> = self
            .index
            .iter()
            .filter(|r| r.value().last_touched < cutoff)
            .map(|r| r.key().clone())
            .collect();

        for hash in &expired {
            self.remove(hash, RemoveOptions { remove_file: true });
        }

        if !expired.is_empty() {
            log::info!("Swept {} expired asset(s)", expired.len());
        }
        expired.len()
    }

    /// Persist the index if it changed since the last flush.
    pub fn flush(&self) -> Result<(), String> {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return Ok(());
        }

        let records = self.list();
        let content = serde_json::to_string_pretty(&records)
            .map_err(|e| format!("Failed to serialize asset index: {}", e))?;

        let path = self.index_path();
        let tmp_path = path.with_extension("json.tmp");
        let result = fs::write(&tmp_path, content)
            .and_then(|_| fs::rename(&tmp_path, &path))
            .map_err(|e| format!("Failed to write asset index {}: {}", path.display(), e));

        if result.is_err() {
            self.dirty.store(true, Ordering::Relaxed);
        }
        result
    }
}
