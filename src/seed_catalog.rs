//! Typed helpers for seeds, exchanges, the cached profile and drafts.
//!
//! This is the validation boundary: records going in must satisfy their
//! schema, and stored objects coming out are parsed back into typed records
//! (anything that no longer parses is logged and skipped). Like the storage
//! API underneath, helpers report failure through `false`, `None` or an
//! empty list.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::local_db_model::{
    from_json_record, now_iso, to_json_record, Collection, ExchangeRecord, ExchangeStatus, JsonRecord, SeedCategory,
    SeedRecord, SyncStatus, TempRecord, UserCacheRecord,
};
use crate::local_storage::LocalStorage;
use crate::store_error::{Result, StoreError};

/// Exchanges involving one user, split by the role they play.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserExchanges {
    /// Exchanges the user asked for.
    pub requested: Vec<ExchangeRecord>,
    /// Exchanges asking for one of the user's seeds.
    pub received: Vec<ExchangeRecord>,
    pub all: Vec<ExchangeRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStats {
    pub total_seeds: usize,
    pub available_seeds: usize,
    pub categories: BTreeMap<SeedCategory, usize>,
    pub total_exchanges: usize,
    pub pending_exchanges: usize,
    pub accepted_exchanges: usize,
    pub rejected_exchanges: usize,
    pub completed_exchanges: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineCounts {
    pub seeds: usize,
    pub exchanges: usize,
    pub user_data: usize,
    pub temp_data: usize,
    pub total: usize,
}

pub struct SeedCatalog {
    storage: Arc<LocalStorage>,
    auto_cleanup_days: i64,
}

impl SeedCatalog {
    pub fn new(storage: Arc<LocalStorage>, auto_cleanup_days: i64) -> Self {
        Self {
            storage,
            auto_cleanup_days,
        }
    }

    pub fn storage(&self) -> &LocalStorage {
        &self.storage
    }

    async fn save_typed<T: Serialize>(&self, collection: Collection, record: &T) -> bool {
        match to_json_record(record) {
            Ok(json) => self.storage.save(collection, &json).await,
            Err(e) => {
                warn!("Cannot serialize {collection} record: {e}");
                false
            }
        }
    }

    async fn get_typed<T: for<'de> Deserialize<'de>>(&self, collection: Collection, id: &str) -> Option<T> {
        let record = self.storage.get(collection, id).await?;
        parse_record(collection, record)
    }

    // ---- seeds ----

    /// Stores a seed after validating `id`, `name` and `ownerId`. Fills in
    /// `createdAt` when absent and always stamps `updatedAt`.
    pub async fn save_seed(&self, mut seed: SeedRecord) -> bool {
        if let Err(e) = seed.validate() {
            warn!("Rejected seed '{}': {e}", seed.id);
            return false;
        }

        let now = Utc::now();
        seed.created_at.get_or_insert(now);
        seed.updated_at = Some(now);
        self.save_typed(Collection::Seeds, &seed).await
    }

    pub async fn get_seed(&self, id: &str) -> Option<SeedRecord> {
        self.get_typed(Collection::Seeds, id).await
    }

    /// Every active seed, newest first.
    pub async fn get_all_seeds(&self) -> Vec<SeedRecord> {
        let records = self.storage.get_all(Collection::Seeds).await;
        let mut seeds: Vec<SeedRecord> = parse_all::<SeedRecord>(Collection::Seeds, records)
            .into_iter()
            .filter(|seed| seed.is_active)
            .collect();
        sort_newest_first(&mut seeds);
        seeds
    }

    pub async fn get_seeds_by_owner(&self, owner_id: &str) -> Vec<SeedRecord> {
        let mut seeds = self.owner_seeds(owner_id).await;
        seeds.retain(|seed| seed.is_active);
        seeds
    }

    pub async fn get_seeds_by_category(&self, category: SeedCategory) -> Vec<SeedRecord> {
        let mut seeds = self
            .seeds_by_index("category", JsonValue::String(category.as_str().to_string()))
            .await;
        seeds.retain(|seed| seed.is_active);
        seeds
    }

    /// Owner's seeds including soft-deleted ones.
    async fn owner_seeds(&self, owner_id: &str) -> Vec<SeedRecord> {
        self.seeds_by_index("ownerId", JsonValue::String(owner_id.to_string()))
            .await
    }

    async fn seeds_by_index(&self, field: &str, value: JsonValue) -> Vec<SeedRecord> {
        let records = self.storage.find_by_index(Collection::Seeds, field, &value).await;
        let mut seeds = parse_all(Collection::Seeds, records);
        sort_newest_first(&mut seeds);
        seeds
    }

    /// Case-insensitive substring search over name, description and variety.
    /// A blank term returns every seed.
    pub async fn search_seeds(&self, term: &str) -> Vec<SeedRecord> {
        let term = term.trim().to_lowercase();
        let seeds = self.get_all_seeds().await;
        if term.is_empty() {
            return seeds;
        }
        seeds.into_iter().filter(|seed| seed.matches_term(&term)).collect()
    }

    /// Seeds open for exchange, optionally leaving out one owner's listings.
    pub async fn get_available_seeds(&self, exclude_owner_id: Option<&str>) -> Vec<SeedRecord> {
        self.get_all_seeds()
            .await
            .into_iter()
            .filter(|seed| seed.is_available_for_exchange)
            .filter(|seed| exclude_owner_id != Some(seed.owner_id.as_str()))
            .collect()
    }

    /// Applies `partial` to a seed owned by `user_id`, bumps `version` and
    /// queues the seed for sync. `id`, `ownerId`, `version` and `createdAt`
    /// in `partial` are ignored.
    pub async fn update_seed(&self, id: &str, mut partial: JsonRecord, user_id: &str) -> Result<SeedRecord> {
        let current = self.owned_seed(id, user_id).await?;

        for protected in ["id", "ownerId", "version", "createdAt"] {
            partial.remove(protected);
        }
        partial.insert("version".to_string(), JsonValue::from(current.version.max(1) + 1));
        partial.insert("syncStatus".to_string(), serde_json::to_value(SyncStatus::Pending)?);

        let mut merged = to_json_record(&current)?;
        merged.extend(partial.clone());
        from_json_record::<SeedRecord>(merged)?.validate()?;

        self.write_seed_changes(id, partial).await
    }

    /// Soft-deletes a seed owned by `user_id`. The record stays stored with
    /// `isActive = false` and drops out of every listing.
    pub async fn delete_seed(&self, id: &str, user_id: &str) -> Result<SeedRecord> {
        self.owned_seed(id, user_id).await?;

        let mut partial = JsonRecord::new();
        partial.insert("isActive".to_string(), JsonValue::Bool(false));
        partial.insert("deletedAt".to_string(), JsonValue::String(now_iso()));
        partial.insert("syncStatus".to_string(), serde_json::to_value(SyncStatus::Pending)?);
        self.write_seed_changes(id, partial).await
    }

    async fn owned_seed(&self, id: &str, user_id: &str) -> Result<SeedRecord> {
        let seed = self
            .get_seed(id)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("seed '{id}'")))?;
        if seed.owner_id != user_id {
            return Err(StoreError::PermissionDenied(format!(
                "seed '{id}' belongs to another user"
            )));
        }
        Ok(seed)
    }

    async fn write_seed_changes(&self, id: &str, partial: JsonRecord) -> Result<SeedRecord> {
        if !self.storage.update(Collection::Seeds, id, partial).await {
            return Err(StoreError::Database(format!("could not write seed '{id}'")));
        }
        self.get_seed(id)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("seed '{id}'")))
    }

    // ---- exchanges ----

    /// Stores an exchange after validating its ids. New exchanges start
    /// `pending` unless the record says otherwise.
    pub async fn save_exchange(&self, mut exchange: ExchangeRecord) -> bool {
        if let Err(e) = exchange.validate() {
            warn!("Rejected exchange '{}': {e}", exchange.id);
            return false;
        }

        let now = Utc::now();
        exchange.created_at.get_or_insert(now);
        exchange.updated_at = Some(now);
        self.save_typed(Collection::Exchanges, &exchange).await
    }

    pub async fn get_exchange(&self, id: &str) -> Option<ExchangeRecord> {
        self.get_typed(Collection::Exchanges, id).await
    }

    pub async fn get_all_exchanges(&self) -> Vec<ExchangeRecord> {
        parse_all(Collection::Exchanges, self.storage.get_all(Collection::Exchanges).await)
    }

    pub async fn get_exchanges_by_user(&self, user_id: &str) -> UserExchanges {
        let mut split = UserExchanges::default();
        for exchange in self.get_all_exchanges().await {
            if !exchange.involves(user_id) {
                continue;
            }
            if exchange.requester_id == user_id {
                split.requested.push(exchange.clone());
            }
            if exchange.owner_id == user_id {
                split.received.push(exchange.clone());
            }
            split.all.push(exchange);
        }
        split
    }

    /// Moves an exchange along the status graph. The status string must be
    /// one of `pending`, `accepted`, `rejected`, `completed`.
    pub async fn update_exchange_status(&self, id: &str, new_status: &str) -> bool {
        match self.transition_exchange(id, new_status).await {
            Ok(exchange) => {
                debug!("Exchange {id} is now {}", exchange.status);
                true
            }
            Err(e) => {
                warn!("Status update of exchange {id} rejected: {e}");
                false
            }
        }
    }

    /// Same as [`update_exchange_status`](Self::update_exchange_status) but
    /// reports why a transition was refused.
    pub async fn transition_exchange(&self, id: &str, new_status: &str) -> Result<ExchangeRecord> {
        let next: ExchangeStatus = new_status.parse()?;
        let current = self
            .get_exchange(id)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("exchange '{id}'")))?;

        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: current.status.to_string(),
                to: next.to_string(),
            });
        }

        let mut partial = JsonRecord::new();
        partial.insert("status".to_string(), JsonValue::String(next.as_str().to_string()));
        partial.insert(
            "syncStatus".to_string(),
            serde_json::to_value(SyncStatus::Pending)?,
        );
        if !self.storage.update(Collection::Exchanges, id, partial).await {
            return Err(StoreError::Database(format!("could not write exchange '{id}'")));
        }

        self.get_exchange(id)
            .await
            .ok_or_else(|| StoreError::NotFound(format!("exchange '{id}'")))
    }

    /// Exchanges in `status`, optionally only those involving `user_id`,
    /// most recently updated first.
    pub async fn get_exchanges_by_status(&self, status: ExchangeStatus, user_id: Option<&str>) -> Vec<ExchangeRecord> {
        let records = self
            .storage
            .find_by_index(Collection::Exchanges, "status", &JsonValue::String(status.as_str().to_string()))
            .await;
        let mut exchanges: Vec<ExchangeRecord> = parse_all::<ExchangeRecord>(Collection::Exchanges, records)
            .into_iter()
            .filter(|exchange| user_id.map_or(true, |user| exchange.involves(user)))
            .collect();
        exchanges.sort_by_key(|exchange| Reverse(exchange.updated_at));
        exchanges
    }

    // ---- user profile ----

    /// Caches a profile under its `userId`. Profiles have their own key
    /// field, so this checks `userId` rather than `id`.
    pub async fn save_user_data(&self, profile: &UserCacheRecord) -> bool {
        if let Err(e) = profile.validate() {
            warn!("Rejected profile: {e}");
            return false;
        }
        self.save_typed(Collection::UserData, profile).await
    }

    pub async fn get_user_data(&self, user_id: &str) -> Option<UserCacheRecord> {
        if user_id.trim().is_empty() {
            return None;
        }
        self.get_typed(Collection::UserData, user_id).await
    }

    // ---- drafts ----

    fn draft_id(kind: &str) -> String {
        format!("draft_{kind}")
    }

    /// Saves the in-progress draft of `kind`, replacing any previous one.
    pub async fn save_draft(&self, kind: &str, payload: JsonValue) -> bool {
        let draft = TempRecord {
            id: Self::draft_id(kind),
            kind: kind.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        };
        if let Err(e) = draft.validate() {
            warn!("Rejected draft: {e}");
            return false;
        }
        self.save_typed(Collection::TempData, &draft).await
    }

    pub async fn get_draft(&self, kind: &str) -> Option<TempRecord> {
        self.get_typed(Collection::TempData, &Self::draft_id(kind)).await
    }

    /// Drops the draft once its flow has completed.
    pub async fn clear_draft(&self, kind: &str) -> bool {
        self.storage.delete(Collection::TempData, &Self::draft_id(kind)).await
    }

    /// Temp records of one type, oldest first.
    pub async fn get_temp_by_type(&self, kind: &str) -> Vec<TempRecord> {
        let records = self
            .storage
            .find_by_index(Collection::TempData, "type", &JsonValue::String(kind.to_string()))
            .await;
        let mut temps: Vec<TempRecord> = parse_all(Collection::TempData, records);
        temps.sort_by_key(|temp| temp.timestamp);
        temps
    }

    // ---- aggregates ----

    /// Seed and exchange counts, recomputed on every call.
    pub async fn get_catalog_stats(&self) -> CatalogStats {
        let seeds = self.get_all_seeds().await;
        let exchanges = self.get_all_exchanges().await;

        let mut stats = CatalogStats {
            total_seeds: seeds.len(),
            available_seeds: seeds.iter().filter(|seed| seed.is_available_for_exchange).count(),
            total_exchanges: exchanges.len(),
            ..Default::default()
        };
        for seed in &seeds {
            *stats.categories.entry(seed.category).or_insert(0) += 1;
        }
        for exchange in &exchanges {
            match exchange.status {
                ExchangeStatus::Pending => stats.pending_exchanges += 1,
                ExchangeStatus::Accepted => stats.accepted_exchanges += 1,
                ExchangeStatus::Rejected => stats.rejected_exchanges += 1,
                ExchangeStatus::Completed => stats.completed_exchanges += 1,
            }
        }
        stats
    }

    pub async fn offline_counts(&self) -> OfflineCounts {
        let seeds = self.storage.get_all(Collection::Seeds).await.len();
        let exchanges = self.storage.get_all(Collection::Exchanges).await.len();
        let user_data = self.storage.get_all(Collection::UserData).await.len();
        let temp_data = self.storage.get_all(Collection::TempData).await.len();
        OfflineCounts {
            seeds,
            exchanges,
            user_data,
            temp_data,
            total: seeds + exchanges + user_data + temp_data,
        }
    }

    // ---- sync bookkeeping ----

    /// The user's seeds that still need to reach the remote backend.
    /// Soft-deleted seeds are included so the deletion reaches the remote.
    pub async fn pending_seeds(&self, owner_id: &str) -> Vec<SeedRecord> {
        self.owner_seeds(owner_id)
            .await
            .into_iter()
            .filter(|seed| seed.sync_status == SyncStatus::Pending)
            .collect()
    }

    /// Exchanges involving the user that still need to reach the remote
    /// backend.
    pub async fn pending_exchanges(&self, user_id: &str) -> Vec<ExchangeRecord> {
        self.get_exchanges_by_user(user_id)
            .await
            .all
            .into_iter()
            .filter(|exchange| exchange.sync_status == SyncStatus::Pending)
            .collect()
    }

    /// Records the outcome of a push. Goes through `update`, so `updatedAt`
    /// is restamped.
    pub async fn mark_sync_status(&self, collection: Collection, id: &str, status: SyncStatus) -> bool {
        let mut partial = JsonRecord::new();
        match serde_json::to_value(status) {
            Ok(value) => {
                partial.insert("syncStatus".to_string(), value);
            }
            Err(e) => {
                warn!("Cannot encode sync status: {e}");
                return false;
            }
        }
        self.storage.update(collection, id, partial).await
    }

    // ---- pruning ----

    /// Deletes completed exchanges last updated before `cutoff`.
    pub async fn prune_completed_exchanges(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for exchange in self.get_exchanges_by_status(ExchangeStatus::Completed, None).await {
            let stale = exchange.updated_at.is_some_and(|updated| updated < cutoff);
            if stale && self.storage.delete(Collection::Exchanges, &exchange.id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Prunes old completed exchanges when local usage is over quota.
    pub async fn prune_if_needed(&self) -> usize {
        let estimate = self.storage.estimate_usage();
        if !estimate.is_over_quota() {
            return 0;
        }

        let cutoff = Utc::now() - Duration::days(self.auto_cleanup_days);
        let removed = self.prune_completed_exchanges(cutoff).await;
        info!(
            "Storage at {} of {} bytes; pruned {removed} completed exchanges",
            estimate.usage_bytes, estimate.quota_bytes
        );
        removed
    }
}

fn parse_record<T: for<'de> Deserialize<'de>>(collection: Collection, record: JsonRecord) -> Option<T> {
    let key = collection.key_of(&record).unwrap_or_default();
    from_json_record(record)
        .inspect_err(|e| warn!("Skipping malformed {collection} record '{key}': {e}"))
        .ok()
}

fn parse_all<T: for<'de> Deserialize<'de>>(collection: Collection, records: Vec<JsonRecord>) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| parse_record(collection, record))
        .collect()
}

fn sort_newest_first(seeds: &mut [SeedRecord]) {
    seeds.sort_by_key(|seed| Reverse(seed.created_at));
}
