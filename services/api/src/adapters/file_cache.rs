//! services/api/src/adapters/file_cache.rs
//!
//! A durable `LocalCacheStore` that keeps one JSON document per key under a
//! cache directory. Every key is loaded into memory when the store opens;
//! writes replace the in-memory copy and the file together, going through a
//! temporary file and a rename so a crash never leaves a half-written key.

use classroom_core::ports::{LocalCacheStore, PortError, PortResult};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};

const EXTENSION: &str = "json";

pub struct FileCacheStore {
    dir: PathBuf,
    entries: RwLock<HashMap<String, Value>>,
}

impl FileCacheStore {
    /// Opens (creating if needed) the cache directory and loads every key.
    /// Unreadable files are skipped with a warning and treated as absent.
    pub fn open(dir: impl Into<PathBuf>) -> PortResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| storage_error(&dir, e))?;

        let mut entries = HashMap::new();
        for entry in fs::read_dir(&dir).map_err(|e| storage_error(&dir, e))? {
            let path = entry.map_err(|e| storage_error(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match read_value(&path) {
                Ok(value) => {
                    entries.insert(key, value);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache file"),
            }
        }

        info!(dir = %dir.display(), keys = entries.len(), "Local cache loaded.");
        Ok(Self {
            dir,
            entries: RwLock::new(entries),
        })
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.{}", name, EXTENSION))
    }

    fn write(&self, key: &str, value: Value) -> PortResult<()> {
        let path = self.file_for(key);
        let tmp = path.with_extension(format!("{}.tmp", EXTENSION));
        let bytes = serde_json::to_vec(&value)?;

        // The lock is held across the file write so two writers never race
        // on the same temporary file.
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        fs::write(&tmp, bytes).map_err(|e| storage_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| storage_error(&path, e))?;
        entries.insert(key.to_string(), value);
        debug!(key, "Local cache key written");
        Ok(())
    }

    fn read(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }
}

impl LocalCacheStore for FileCacheStore {
    fn get_collection(&self, key: &str) -> Vec<Value> {
        match self.read(key) {
            Some(Value::Array(records)) => records,
            _ => Vec::new(),
        }
    }

    fn set_collection(&self, key: &str, records: Vec<Value>) -> PortResult<()> {
        self.write(key, Value::Array(records))
    }

    fn get_singleton(&self, key: &str) -> Option<Value> {
        self.read(key).filter(|v| !v.is_null())
    }

    fn set_singleton(&self, key: &str, value: Value) -> PortResult<()> {
        self.write(key, value)
    }
}

fn read_value(path: &Path) -> PortResult<Value> {
    let bytes = fs::read(path).map_err(|e| storage_error(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn storage_error(path: &Path, e: std::io::Error) -> PortError {
    PortError::Storage(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        assert!(store.get_collection("users").is_empty());
        assert!(store.get_singleton("settings").is_none());
    }

    #[test]
    fn test_writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCacheStore::open(dir.path()).unwrap();
            store
                .set_collection("users", vec![json!({"id": "CS2A-2025-00046"})])
                .unwrap();
            store
                .set_singleton("settings", json!({"maxResubmissionAttempts": 3}))
                .unwrap();
        }

        let reopened = FileCacheStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_collection("users"), vec![json!({"id": "CS2A-2025-00046"})]);
        assert_eq!(
            reopened.get_singleton("settings"),
            Some(json!({"maxResubmissionAttempts": 3}))
        );
    }

    #[test]
    fn test_set_collection_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        store.set_collection("album", vec![json!({"id": "a"}), json!({"id": "b"})]).unwrap();
        store.set_collection("album", vec![json!({"id": "c"})]).unwrap();
        assert_eq!(store.get_collection("album"), vec![json!({"id": "c"})]);
        assert!(!dir.path().join("album.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("schedule.json"), b"{not json").unwrap();
        fs::write(dir.path().join("campaigns.json"), b"[{\"id\":\"x\"}]").unwrap();

        let store = FileCacheStore::open(dir.path()).unwrap();
        assert!(store.get_collection("schedule").is_empty());
        assert_eq!(store.get_collection("campaigns").len(), 1);
    }

    #[test]
    fn test_key_names_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCacheStore::open(dir.path()).unwrap();
        store.set_collection("../escape", vec![json!({"id": "x"})]).unwrap();
        assert!(dir.path().join("___escape.json").exists());
        assert_eq!(store.get_collection("../escape").len(), 1);
    }
}
