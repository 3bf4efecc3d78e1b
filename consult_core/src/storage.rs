//! Namespaced snapshot persistence over a pluggable key-value store.
//!
//! The adapter never lets a persistence failure escape into the caller:
//! load and save problems are logged and reported as `None`/`false` so
//! the consultation flow keeps working from memory.

use crate::types::StorageEstimate;
use crate::{Error, Result};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;

/// Key-value persistence backend
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
    /// Best-effort capacity reading; `None` when the backend cannot tell
    fn estimate(&self) -> Option<StorageEstimate>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store, mainly for tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    quota: Option<u64>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report capacity against a fixed quota in bytes
    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Make every subsequent write fail, as a full disk would
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    fn used_bytes(entries: &BTreeMap<String, String>) -> u64 {
        entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if *self.fail_writes.lock() {
            return Err(Error::Storage("quota exceeded".into()));
        }
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota {
            let existing = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0) as u64;
            let projected = Self::used_bytes(&entries) - existing + (key.len() + value.len()) as u64;
            if projected > quota {
                return Err(Error::Storage(format!(
                    "quota exceeded: {} of {} bytes",
                    projected, quota
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    fn estimate(&self) -> Option<StorageEstimate> {
        let quota = self.quota?;
        let used = Self::used_bytes(&self.entries.lock());
        Some(StorageEstimate {
            used,
            available: quota.saturating_sub(used),
        })
    }
}

// ============================================================================
// Directory-backed store
// ============================================================================

/// One file per key inside a directory
///
/// Writes go to a temp file in the same directory that is synced and then
/// renamed over the target, so a crash never leaves a half-written value.
pub struct FileStore {
    dir: PathBuf,
}

const FILE_EXT: &str = "json";

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), FILE_EXT))
    }

    fn used_bytes(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(&path)?;
        file.lock_shared()?;
        let mut contents = String::new();
        let read = std::io::BufReader::new(&file).read_to_string(&mut contents);
        let _ = file.unlock();
        read?;

        Ok(Some(contents))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let temp = NamedTempFile::new_in(&self.dir)?;
        temp.as_file().lock_exclusive()?;
        {
            let mut writer = std::io::BufWriter::new(temp.as_file());
            writer.write_all(value.as_bytes())?;
            writer.flush()?;
        }
        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        let path = self.path_for(key);
        temp.persist(&path).map_err(|e| Error::Io(e.error))?;
        tracing::debug!("Wrote {} ({} bytes)", path.display(), value.len());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXT) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn estimate(&self) -> Option<StorageEstimate> {
        let probe = if self.dir.exists() {
            self.dir.as_path()
        } else {
            self.dir.parent()?
        };
        let available = fs2::available_space(probe).ok()?;
        Some(StorageEstimate {
            used: self.used_bytes(),
            available,
        })
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]` so keys map to safe file names
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

// ============================================================================
// Adapter
// ============================================================================

/// Loads and saves the application snapshot under `<namespace>:state`
#[derive(Clone)]
pub struct StorageAdapter {
    store: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl StorageAdapter {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn state_key(&self) -> String {
        format!("{}:state", self.namespace)
    }

    fn owns(&self, key: &str) -> bool {
        key.strip_prefix(self.namespace.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    /// Read the stored snapshot. Missing, unreadable and corrupt snapshots all yield `None`.
    pub fn load_state<T: DeserializeOwned>(&self) -> Option<T> {
        let key = self.state_key();
        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                tracing::info!("No stored state under {}, starting fresh", key);
                return None;
            }
            Err(e) => {
                tracing::warn!("Unable to read {}: {}. Starting fresh.", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => {
                tracing::debug!("Loaded state from {}", key);
                Some(state)
            }
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}. Starting fresh.", key, e);
                None
            }
        }
    }

    /// Write the snapshot. Returns whether it was stored.
    pub fn save_state<T: Serialize>(&self, state: &T) -> bool {
        let key = self.state_key();
        let contents = match serde_json::to_string(state) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::error!("Failed to serialize state: {}", e);
                return false;
            }
        };
        match self.store.set(&key, &contents) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to save state to {}: {}", key, e);
                false
            }
        }
    }

    /// Best-effort capacity reading; zeros when the backend cannot tell
    pub fn storage_info(&self) -> StorageEstimate {
        self.store.estimate().unwrap_or_default()
    }

    /// The stored snapshot as pretty-printed JSON
    pub fn export_state(&self) -> Result<Option<String>> {
        let Some(raw) = self.store.get(&self.state_key())? else {
            return Ok(None);
        };
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        Ok(Some(serde_json::to_string_pretty(&value)?))
    }

    /// Remove every key in the namespace. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.keys()?.into_iter().filter(|k| self.owns(k)) {
            self.store.remove(&key)?;
            removed += 1;
        }
        tracing::info!("Cleared {} key(s) in namespace {}", removed, self.namespace);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Snapshot {
        revision: u64,
        note: String,
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            revision: 7,
            note: "follow up in two weeks".into(),
        }
    }

    #[test]
    fn test_save_and_load_through_file_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let adapter = StorageAdapter::new(Arc::new(FileStore::new(temp_dir.path())), "consult");

        assert!(adapter.save_state(&snapshot()));
        let loaded: Snapshot = adapter.load_state().unwrap();
        assert_eq!(loaded, snapshot());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let adapter = StorageAdapter::new(Arc::new(FileStore::new(temp_dir.path().join("absent"))), "consult");
        assert!(adapter.load_state::<Snapshot>().is_none());
    }

    #[test]
    fn test_corrupted_state_returns_none() {
        let store = Arc::new(MemoryStore::new());
        store.set("consult:state", "{ invalid json }").unwrap();
        let adapter = StorageAdapter::new(store, "consult");
        assert!(adapter.load_state::<Snapshot>().is_none());
    }

    #[test]
    fn test_failed_write_is_reported_not_raised() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_writes(true);
        let adapter = StorageAdapter::new(store, "consult");
        assert!(!adapter.save_state(&snapshot()));
    }

    #[test]
    fn test_memory_quota_enforced() {
        let store = MemoryStore::with_quota(32);
        assert!(store.set("k", "small").is_ok());
        assert!(store.set("k", &"x".repeat(64)).is_err());

        let estimate = store.estimate().unwrap();
        assert_eq!(estimate.used, 6);
        assert_eq!(estimate.quota(), 32);
    }

    #[test]
    fn test_atomic_save_leaves_no_temp_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(temp_dir.path());
        store.set("consult:state", "{}").unwrap();
        store.set("consult:state", "{\"a\":1}").unwrap();

        let names: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["consult%3Astate.json".to_string()]);
        assert_eq!(store.keys().unwrap(), vec!["consult:state".to_string()]);
    }

    #[test]
    fn test_clear_only_touches_namespace() {
        let store = Arc::new(MemoryStore::new());
        store.set("consult:state", "{}").unwrap();
        store.set("consult:drafts", "{}").unwrap();
        store.set("consultant:state", "{}").unwrap();
        store.set("other:state", "{}").unwrap();

        let adapter = StorageAdapter::new(store.clone(), "consult");
        assert_eq!(adapter.clear().unwrap(), 2);
        assert_eq!(
            store.keys().unwrap(),
            vec!["consultant:state".to_string(), "other:state".to_string()]
        );
    }

    #[test]
    fn test_export_is_pretty_json() {
        let store = Arc::new(MemoryStore::new());
        let adapter = StorageAdapter::new(store, "consult");
        assert!(adapter.export_state().unwrap().is_none());

        adapter.save_state(&snapshot());
        let exported = adapter.export_state().unwrap().unwrap();
        assert!(exported.contains("\n  \"revision\": 7"));
    }

    #[test]
    fn test_file_store_estimate_reports_space() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(temp_dir.path());
        store.set("consult:state", "{}").unwrap();
        let estimate = store.estimate().unwrap();
        assert_eq!(estimate.used, 2);
        assert!(estimate.available > 0);
    }

    #[test]
    fn test_key_encoding_reversible() {
        let key = "consult:state/v2 draft";
        assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
    }
}
