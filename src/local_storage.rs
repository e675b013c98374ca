//! Unified storage API over the embedded store and the fallback store.
//!
//! Every verb tries the embedded store first. When it is unavailable or the
//! operation fails, the same operation is retried on the fallback store and
//! that result is returned. Callers never see an error: each verb has a
//! sentinel (`false`, `None`, empty `Vec`) for the case where both backends
//! fail, and the failure is logged where it happens.
//!
//! A write the embedded store rejects lands in the fallback even while the
//! embedded store is ready, so reads, deletes and clears consult both
//! backends in that state. The embedded copy wins when a key is in both.
//!
//! ```no_run
//! use seed_exchange_store::local_storage::LocalStorage;
//! use seed_exchange_store::local_db_model::{Collection, JsonRecord};
//! use seed_exchange_store::storage_config::StorageConfig;
//! use serde_json::json;
//!
//! # async fn demo() {
//! let storage = LocalStorage::from_config(&StorageConfig::in_dir("/tmp/seeds"));
//! storage.init().await;
//!
//! let record: JsonRecord = serde_json::from_value(json!({"id": "s1", "name": "Maíz"})).unwrap();
//! assert!(storage.save(Collection::Seeds, &record).await);
//! assert!(storage.get(Collection::Seeds, "s1").await.is_some());
//! # }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::local_db_model::{now_iso, Collection, JsonRecord};
use crate::local_db_state::EmbeddedStore;
use crate::local_kv_store::{FallbackStore, KeyValueStore};
use crate::record_store::RecordStore;
use crate::storage_config::StorageConfig;
use crate::store_error::Result;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Record count and approximate JSON size of one collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStats {
    pub collection: Collection,
    pub count: usize,
    pub size_kb: f64,
}

/// On-disk usage of both backends against the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

impl StorageEstimate {
    pub fn is_over_quota(&self) -> bool {
        self.usage_bytes > self.quota_bytes
    }
}

pub struct LocalStorage {
    embedded: Arc<EmbeddedStore>,
    fallback: Arc<dyn RecordStore>,
    max_total_storage_bytes: u64,
}

impl LocalStorage {
    pub fn new(embedded: Arc<EmbeddedStore>, fallback: Arc<dyn RecordStore>, max_total_storage_bytes: u64) -> Self {
        Self {
            embedded,
            fallback,
            max_total_storage_bytes,
        }
    }

    /// Builds both backends from `config`. If the fallback file cannot be
    /// opened the fallback runs in memory for this session.
    pub fn from_config(config: &StorageConfig) -> Self {
        let embedded = Arc::new(EmbeddedStore::new(config.database_path(), config.map_size_bytes));
        let kv = KeyValueStore::open(config.fallback_path(), config.fallback_quota_bytes).unwrap_or_else(|e| {
            warn!("Fallback store file unusable, keeping fallback in memory: {e}");
            KeyValueStore::in_memory(config.fallback_quota_bytes)
        });

        Self::new(embedded, Arc::new(FallbackStore::new(kv)), config.max_total_storage_bytes)
    }

    /// Opens the embedded store and, when it is usable, moves records left
    /// behind in the fallback store into it. Returns whether the embedded
    /// store is ready.
    pub async fn init(&self) -> bool {
        if !self.embedded.open().await {
            warn!("Local storage running on fallback store only");
            return false;
        }

        let promoted = self.promote_fallback_records().await;
        if promoted > 0 {
            info!("Moved {promoted} records from fallback store into embedded store");
        }
        true
    }

    pub fn is_ready(&self) -> bool {
        self.embedded.is_ready()
    }

    pub fn embedded(&self) -> &EmbeddedStore {
        &self.embedded
    }

    /// Runs `op` on the embedded store, then on the fallback store if the
    /// first attempt failed.
    async fn attempt<'a, T>(
        &'a self,
        verb: &'static str,
        collection: Collection,
        op: impl Fn(&'a dyn RecordStore) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let primary: &'a dyn RecordStore = &*self.embedded;
        match op(primary).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_backend_unavailable() => {
                debug!("{verb} on {collection}: embedded store unavailable, using fallback");
            }
            Err(e) => warn!("{verb} on {collection} failed in embedded store, retrying on fallback: {e}"),
        }

        op(&*self.fallback).await.inspect_err(|e| {
            error!("{verb} on {collection} failed in both backends: {e}");
        })
    }

    /// Stores `record`; false when its primary key is missing or empty, or
    /// when both backends reject the write.
    pub async fn save(&self, collection: Collection, record: &JsonRecord) -> bool {
        if collection.key_of(record).is_none() {
            warn!(
                "Refusing to save {collection} record without '{}'",
                collection.primary_key()
            );
            return false;
        }

        self.attempt("save", collection, |store| store.save(collection, record))
            .await
            .is_ok()
    }

    /// Looks in the embedded store first; while it is ready, a miss there
    /// still checks the fallback, which holds writes the embedded store
    /// rejected (a full map, for instance).
    pub async fn get(&self, collection: Collection, id: &str) -> Option<JsonRecord> {
        let found = self
            .attempt("get", collection, |store| store.get(collection, id))
            .await
            .ok()
            .flatten();
        if found.is_some() || !self.is_ready() {
            return found;
        }

        self.fallback
            .get(collection, id)
            .await
            .inspect_err(|e| warn!("get on {collection}: fallback lookup failed: {e}"))
            .ok()
            .flatten()
    }

    /// Every record in `collection` across both backends; the embedded copy
    /// wins when a key exists in both. Empty on total failure.
    pub async fn get_all(&self, collection: Collection) -> Vec<JsonRecord> {
        let records = self
            .attempt("get_all", collection, |store| store.get_all(collection))
            .await
            .unwrap_or_default();
        self.with_fallback_records(collection, records, |_| true).await
    }

    /// Appends fallback records matching `keep` whose key is not already in
    /// `records`. No-op until the embedded store is ready, since the fallback
    /// is then the only backend answering.
    async fn with_fallback_records(
        &self,
        collection: Collection,
        mut records: Vec<JsonRecord>,
        keep: impl Fn(&JsonRecord) -> bool,
    ) -> Vec<JsonRecord> {
        if !self.is_ready() {
            return records;
        }

        let leftovers = match self.fallback.get_all(collection).await {
            Ok(leftovers) => leftovers,
            Err(e) => {
                warn!("Cannot read fallback {collection}: {e}");
                return records;
            }
        };
        if leftovers.is_empty() {
            return records;
        }

        let known: HashSet<String> = records.iter().filter_map(|r| collection.key_of(r)).collect();
        records.extend(leftovers.into_iter().filter(|record| {
            keep(record) && collection.key_of(record).is_some_and(|key| !known.contains(&key))
        }));
        records
    }

    /// Shallow-merges `partial` over the stored record and stamps
    /// `updatedAt`. The primary key cannot be changed through `partial`.
    /// False when the record does not exist.
    pub async fn update(&self, collection: Collection, id: &str, partial: JsonRecord) -> bool {
        let Some(mut record) = self.get(collection, id).await else {
            warn!("Cannot update {collection}/{id}: not found");
            return false;
        };

        record.extend(partial);
        record.insert(collection.primary_key().to_string(), JsonValue::String(id.to_string()));
        record.insert("updatedAt".to_string(), JsonValue::String(now_iso()));
        self.save(collection, &record).await
    }

    /// Removes `id` from every backend holding it. False when nothing was
    /// stored under `id` or the removal failed.
    pub async fn delete(&self, collection: Collection, id: &str) -> bool {
        let removed = self
            .attempt("delete", collection, |store| store.delete(collection, id))
            .await
            .unwrap_or(false);
        if !self.is_ready() {
            return removed;
        }

        match self.fallback.delete(collection, id).await {
            Ok(from_fallback) => removed || from_fallback,
            Err(e) => {
                warn!("delete on {collection}: fallback copy of {id} kept: {e}");
                removed
            }
        }
    }

    pub async fn clear(&self, collection: Collection) -> bool {
        let cleared = self
            .attempt("clear", collection, |store| store.clear(collection))
            .await
            .is_ok();
        if !self.is_ready() {
            return cleared;
        }

        match self.fallback.clear(collection).await {
            Ok(()) => cleared,
            Err(e) => {
                warn!("clear on {collection}: fallback entries kept: {e}");
                false
            }
        }
    }

    /// Records whose `field` equals `value`. Uses the embedded store's index
    /// when possible and a filtered scan otherwise.
    pub async fn find_by_index(&self, collection: Collection, field: &str, value: &JsonValue) -> Vec<JsonRecord> {
        let matches = |record: &JsonRecord| record.get(field) == Some(value);
        match self.embedded.find_by_index(collection, field, value).await {
            Ok(records) => return self.with_fallback_records(collection, records, matches).await,
            Err(e) if e.is_backend_unavailable() => {}
            Err(e) => warn!("Index lookup {collection}.{field} failed, scanning instead: {e}"),
        }

        self.get_all(collection)
            .await
            .into_iter()
            .filter(|record| matches(record))
            .collect()
    }

    /// Records whose string `field` lies within the inclusive bounds.
    pub async fn range_by_index(
        &self,
        collection: Collection,
        field: &str,
        lower: Option<&str>,
        upper: Option<&str>,
    ) -> Vec<JsonRecord> {
        let in_range = |record: &JsonRecord| match record.get(field).and_then(JsonValue::as_str) {
            Some(value) => lower.map_or(true, |l| value >= l) && upper.map_or(true, |u| value <= u),
            None => false,
        };

        let lower_json = lower.map(|l| JsonValue::String(l.to_string()));
        let upper_json = upper.map(|u| JsonValue::String(u.to_string()));
        match self
            .embedded
            .range_by_index(collection, field, lower_json.as_ref(), upper_json.as_ref())
            .await
        {
            Ok(records) => return self.with_fallback_records(collection, records, in_range).await,
            Err(e) if e.is_backend_unavailable() => {}
            Err(e) => warn!("Range scan {collection}.{field} failed, scanning instead: {e}"),
        }

        self.get_all(collection)
            .await
            .into_iter()
            .filter(|record| in_range(record))
            .collect()
    }

    /// Copies every fallback record into the embedded store and removes it
    /// from the fallback. Records that fail to copy stay where they are.
    pub async fn promote_fallback_records(&self) -> usize {
        let mut promoted = 0;
        for collection in Collection::ALL {
            let records = match self.fallback.get_all(collection).await {
                Ok(records) => records,
                Err(e) => {
                    warn!("Cannot read fallback {collection} for promotion: {e}");
                    continue;
                }
            };

            for record in records {
                let Some(id) = collection.key_of(&record) else {
                    continue;
                };
                if let Err(e) = self.embedded.save(collection, &record).await {
                    warn!("Promotion of {collection}/{id} failed: {e}");
                    continue;
                }
                if let Err(e) = self.fallback.delete(collection, &id).await {
                    warn!("Promoted {collection}/{id} but could not remove fallback copy: {e}");
                }
                promoted += 1;
            }
        }
        promoted
    }

    /// Count and approximate size per collection.
    pub async fn storage_stats(&self) -> Vec<CollectionStats> {
        let mut stats = Vec::with_capacity(Collection::ALL.len());
        for collection in Collection::ALL {
            let records = self.get_all(collection).await;
            let bytes = serde_json::to_string(&records).map_or(0, |json| json.len());
            stats.push(CollectionStats {
                collection,
                count: records.len(),
                size_kb: (bytes as f64 / 1024.0 * 100.0).round() / 100.0,
            });
        }
        stats
    }

    /// Advisory usage figure for deciding whether to prune.
    pub fn estimate_usage(&self) -> StorageEstimate {
        StorageEstimate {
            usage_bytes: self.embedded.disk_usage() + self.fallback.disk_usage(),
            quota_bytes: self.max_total_storage_bytes,
        }
    }
}
