//! Local durable cache: a string-keyed key/value store.
//!
//! Two backends are available:
//!   - **Memory**: process-local, for tests and ephemeral sessions.
//!   - **JSON file**: loads entirely into memory, flushed atomically via temp+rename.
//!
//! Both enforce an optional byte quota over keys plus values. A write that
//! would exceed the quota is rejected rather than silently evicting.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("quota exceeded writing {key}: {needed} bytes needed, limit {limit}")]
    QuotaExceeded { key: String, needed: u64, limit: u64 },

    #[error("cache file {path}: {reason}")]
    Io { path: String, reason: String },
}

impl From<CacheError> for examsync_core::SyncError {
    fn from(e: CacheError) -> Self {
        examsync_core::SyncError::LocalCacheFailure(e.to_string())
    }
}

/// Trait for local cache backends.
pub trait LocalCache: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: String) -> Result<(), CacheError>;
    fn remove(&mut self, key: &str);
    fn keys(&self) -> Vec<String>;
    /// Push pending changes to durable storage.
    fn flush(&mut self) -> Result<(), CacheError>;
    /// Bytes currently used by keys plus values.
    fn used_bytes(&self) -> u64;
}

/// Quota-checked map shared by both backends.
#[derive(Debug, Default)]
struct Entries {
    map: BTreeMap<String, String>,
    used: u64,
    max_bytes: u64,
}

impl Entries {
    fn new(map: BTreeMap<String, String>, max_bytes: u64) -> Self {
        let used = map.iter().map(|(k, v)| entry_size(k, v)).sum();
        Entries {
            map,
            used,
            max_bytes,
        }
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), CacheError> {
        let old = self.map.get(key).map(|v| entry_size(key, v)).unwrap_or(0);
        let needed = self.used - old + entry_size(key, &value);
        if self.max_bytes > 0 && needed > self.max_bytes {
            return Err(CacheError::QuotaExceeded {
                key: key.to_string(),
                needed,
                limit: self.max_bytes,
            });
        }
        self.map.insert(key.to_string(), value);
        self.used = needed;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(v) => {
                self.used -= entry_size(key, &v);
                true
            }
            None => false,
        }
    }
}

fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// In-memory cache; `flush` is a no-op.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Entries,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(max_bytes: u64) -> Self {
        MemoryCache {
            entries: Entries::new(BTreeMap::new(), max_bytes),
        }
    }
}

impl LocalCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.map.get(key).cloned()
    }
    fn set(&mut self, key: &str, value: String) -> Result<(), CacheError> {
        self.entries.set(key, value)
    }
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }
    fn keys(&self) -> Vec<String> {
        self.entries.map.keys().cloned().collect()
    }
    fn flush(&mut self) -> Result<(), CacheError> {
        Ok(())
    }
    fn used_bytes(&self) -> u64 {
        self.entries.used
    }
}

/// Cache persisted to a single JSON file.
pub struct JsonFileCache {
    /// Path to the JSON file on disk
    path: PathBuf,
    entries: Entries,
    /// Whether there are unsaved changes
    dirty: bool,
}

impl JsonFileCache {
    /// Load or create a cache at the given path.
    /// If the file doesn't exist, starts empty.
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self, CacheError> {
        let map = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
            serde_json::from_str(&content).map_err(|e| CacheError::Io {
                path: path.display().to_string(),
                reason: format!("parsing: {e}"),
            })?
        } else {
            BTreeMap::new()
        };

        Ok(JsonFileCache {
            path: path.to_path_buf(),
            entries: Entries::new(map, max_bytes),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LocalCache for JsonFileCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.map.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), CacheError> {
        self.entries.set(key, value)?;
        self.dirty = true;
        Ok(())
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key) {
            self.dirty = true;
        }
    }

    fn keys(&self) -> Vec<String> {
        self.entries.map.keys().cloned().collect()
    }

    /// Flush dirty changes using an atomic write (write then rename).
    fn flush(&mut self) -> Result<(), CacheError> {
        if !self.dirty {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let json = serde_json::to_string_pretty(&self.entries.map).map_err(|e| CacheError::Io {
            path: self.path.display().to_string(),
            reason: format!("serializing: {e}"),
        })?;

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &json).map_err(|e| io_err(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| io_err(&self.path, e))?;

        self.dirty = false;
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.entries.used
    }
}

impl Drop for JsonFileCache {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::warn!("failed to flush local cache on drop: {e}");
            }
        }
    }
}

fn io_err(path: &Path, e: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_nonexistent_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonFileCache::open(&dir.path().join("cache.json"), 0).unwrap();
        assert!(cache.keys().is_empty());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn set_get_flush_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cache.json");

        let mut cache = JsonFileCache::open(&path, 0).unwrap();
        cache.set("snapshot/students", "{\"1\":{}}".into()).unwrap();
        cache.set("sync/last-sync", "2024-01-01T00:00:00Z".into()).unwrap();
        cache.flush().unwrap();

        let cache2 = JsonFileCache::open(&path, 0).unwrap();
        assert_eq!(cache2.get("snapshot/students").as_deref(), Some("{\"1\":{}}"));
        assert_eq!(cache2.keys().len(), 2);
        assert_eq!(cache2.used_bytes(), cache.used_bytes());
    }

    #[test]
    fn drop_flushes_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        {
            let mut cache = JsonFileCache::open(&path, 0).unwrap();
            cache.set("k", "v".into()).unwrap();
        }
        let cache = JsonFileCache::open(&path, 0).unwrap();
        assert_eq!(cache.get("k").as_deref(), Some("v"));
    }

    #[test]
    fn remove_entry() {
        let mut cache = MemoryCache::new();
        cache.set("a", "1234".into()).unwrap();
        assert_eq!(cache.used_bytes(), 5);
        cache.remove("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.used_bytes(), 0);
        // Removing a missing key is a no-op
        cache.remove("a");
    }

    #[test]
    fn quota_rejects_oversized_write() {
        let mut cache = MemoryCache::with_quota(10);
        cache.set("k", "12345".into()).unwrap();
        let err = cache.set("k2", "123456789".into()).unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { limit: 10, .. }));
        // Failed write leaves the old state intact
        assert!(cache.get("k2").is_none());
        assert_eq!(cache.used_bytes(), 6);
        // Overwriting an existing key accounts for the replaced value
        cache.set("k", "123456789".into()).unwrap();
        assert_eq!(cache.used_bytes(), 10);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(JsonFileCache::open(&path, 0).is_err());
    }

    #[test]
    fn flush_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = JsonFileCache::open(&dir.path().join("cache.json"), 0).unwrap();
        cache.flush().unwrap();
        cache.flush().unwrap();
    }
}
