//! Fallback key-value backend.
//!
//! [`KeyValueStore`] is a synchronous, string-only persistent map with a fixed
//! capacity, persisted as a single JSON file. [`FallbackStore`] layers the
//! record contract on top of it, storing each record as JSON text under the
//! key `"{collection}_{id}"`. There are no transactions and no indexes;
//! `get_all` is a prefix scan over every key.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::local_db_model::{Collection, JsonRecord};
use crate::record_store::RecordStore;
use crate::store_error::{Result, StoreError};

struct KvState {
    entries: BTreeMap<String, String>,
    used_bytes: usize,
}

/// String-keyed persistent store with a byte quota over keys plus values.
pub struct KeyValueStore {
    path: Option<PathBuf>,
    quota_bytes: usize,
    state: Mutex<KvState>,
}

impl KeyValueStore {
    /// Opens the store backed by `path`, loading any existing contents.
    ///
    /// A file that cannot be parsed is logged and replaced by an empty store
    /// on the next write.
    pub fn open(path: impl Into<PathBuf>, quota_bytes: usize) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, String>>(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Fallback store at {} is unreadable, starting empty: {e}", path.display());
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Fallback store opened at {} ({} keys)", path.display(), entries.len());
        Ok(Self::from_entries(Some(path), quota_bytes, entries))
    }

    /// A store that lives only as long as the process.
    pub fn in_memory(quota_bytes: usize) -> Self {
        Self::from_entries(None, quota_bytes, BTreeMap::new())
    }

    fn from_entries(path: Option<PathBuf>, quota_bytes: usize, entries: BTreeMap<String, String>) -> Self {
        let used_bytes = entries.iter().map(|(k, v)| k.len() + v.len()).sum();
        Self {
            path,
            quota_bytes,
            state: Mutex::new(KvState { entries, used_bytes }),
        }
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.state.lock().entries.get(key).cloned()
    }

    /// Fails with `QuotaExceeded` when the write would push usage past the
    /// quota; the store is left unchanged in that case.
    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        let previous = state.entries.get(key).map_or(0, |old| key.len() + old.len());
        let projected = state.used_bytes - previous + key.len() + value.len();
        if projected > self.quota_bytes {
            return Err(StoreError::QuotaExceeded(format!(
                "writing '{key}' needs {projected} bytes, quota is {}",
                self.quota_bytes
            )));
        }

        let old_value = state.entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist(&state.entries) {
            match old_value {
                Some(old) => state.entries.insert(key.to_string(), old),
                None => state.entries.remove(key),
            };
            return Err(e);
        }
        state.used_bytes = projected;
        Ok(())
    }

    /// Returns whether the key existed.
    pub fn remove_item(&self, key: &str) -> Result<bool> {
        self.remove_where(|k| k == key).map(|removed| removed > 0)
    }

    /// Removes every key for which `predicate` holds and returns how many
    /// went away. A single persist covers the whole batch.
    pub fn remove_where(&self, predicate: impl Fn(&str) -> bool) -> Result<usize> {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state.entries.keys().filter(|k| predicate(k.as_str())).cloned().collect();
        if doomed.is_empty() {
            return Ok(0);
        }

        let mut next = state.entries.clone();
        for key in &doomed {
            next.remove(key);
        }
        self.persist(&next)?;

        state.used_bytes = next.iter().map(|(k, v)| k.len() + v.len()).sum();
        state.entries = next;
        Ok(doomed.len())
    }

    /// Every `(key, value)` whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used_bytes
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the whole map to a sibling temp file, then renames it over the
    /// real one.
    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string(entries)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Record adapter over [`KeyValueStore`].
pub struct FallbackStore {
    kv: KeyValueStore,
}

impl FallbackStore {
    pub fn new(kv: KeyValueStore) -> Self {
        Self { kv }
    }

    pub fn key_for(collection: Collection, id: &str) -> String {
        format!("{}_{id}", collection.name())
    }

    fn prefix_for(collection: Collection) -> String {
        format!("{}_", collection.name())
    }

    pub fn kv(&self) -> &KeyValueStore {
        &self.kv
    }
}

#[async_trait]
impl RecordStore for FallbackStore {
    async fn save(&self, collection: Collection, record: &JsonRecord) -> Result<()> {
        let id = collection.key_of(record).ok_or_else(|| {
            StoreError::Validation(format!(
                "Record for '{collection}' is missing '{}'",
                collection.primary_key()
            ))
        })?;

        let json = serde_json::to_string(record)?;
        let key = Self::key_for(collection, &id);
        if let Err(e) = self.kv.set_item(&key, &json) {
            warn!("Fallback write of {key} failed: {e}");
            return Err(e);
        }

        debug!("Saved {key} to fallback store");
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<JsonRecord>> {
        let key = Self::key_for(collection, id);
        let Some(text) = self.kv.get_item(&key) else {
            return Ok(None);
        };

        match serde_json::from_str::<JsonRecord>(&text) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Discarding corrupt fallback entry {key}: {e}");
                Ok(None)
            }
        }
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<JsonRecord>> {
        let records = self
            .kv
            .scan_prefix(&Self::prefix_for(collection))
            .into_iter()
            .filter_map(|(key, text)| match serde_json::from_str::<JsonRecord>(&text) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("Skipping corrupt fallback entry {key}: {e}");
                    None
                }
            })
            .collect();
        Ok(records)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let key = Self::key_for(collection, id);
        self.kv.remove_item(&key).inspect_err(|e| {
            warn!("Fallback delete of {key} failed: {e}");
        })
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        let prefix = Self::prefix_for(collection);
        let removed = self
            .kv
            .remove_where(|key| key.starts_with(&prefix))
            .inspect_err(|e| warn!("Fallback clear of {collection} failed: {e}"))?;
        debug!("Cleared {removed} fallback entries for {collection}");
        Ok(())
    }

    fn disk_usage(&self) -> u64 {
        self.kv
            .path()
            .and_then(|path| std::fs::metadata(path).ok())
            .map_or(self.kv.used_bytes() as u64, |meta| meta.len())
    }

    fn backend_name(&self) -> &'static str {
        "fallback-kv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_encoding() {
        assert_eq!(FallbackStore::key_for(Collection::Seeds, "x"), "seeds_x");
        assert_eq!(FallbackStore::key_for(Collection::UserData, "u1"), "userData_u1");
    }

    #[test]
    fn test_quota_rejects_and_leaves_store_unchanged() {
        let kv = KeyValueStore::in_memory(16);
        kv.set_item("a", "1234").unwrap();
        let err = kv.set_item("b", "0123456789abcdef").unwrap_err();
        assert!(err.is_quota_exceeded());
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.used_bytes(), 5);
    }

    #[test]
    fn test_overwrite_counts_only_new_value() {
        let kv = KeyValueStore::in_memory(10);
        kv.set_item("k", "12345678").unwrap();
        kv.set_item("k", "87654321").unwrap();
        assert_eq!(kv.used_bytes(), 9);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kv.json");
        {
            let kv = KeyValueStore::open(&path, 1024).unwrap();
            kv.set_item("seeds_1", "{\"id\":\"1\"}").unwrap();
        }
        let kv = KeyValueStore::open(&path, 1024).unwrap();
        assert_eq!(kv.get_item("seeds_1").as_deref(), Some("{\"id\":\"1\"}"));
    }

    #[test]
    fn test_corrupt_file_opens_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "not json").unwrap();
        let kv = KeyValueStore::open(&path, 1024).unwrap();
        assert!(kv.is_empty());
    }
}
