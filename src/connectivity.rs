//! Connectivity and readiness coordination.
//!
//! Two independent flags drive everything here: whether the network is
//! reachable and whether the embedded store finished opening. Their
//! combination picks the data strategy the rest of the app follows, and a
//! network transition from offline to online starts a reconciliation pass
//! that re-pushes the signed-in user's pending local records.
//!
//! Reconciliation is last-write-wins: a pending local record overwrites
//! whatever the remote backend holds for the same id.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::local_db_model::{to_json_record, Collection, JsonRecord, SeedRecord, SyncStatus, UserCacheRecord};
use crate::remote_backend::{RemoteBackend, RemoteError, RemoteProfile};
use crate::seed_catalog::SeedCatalog;
use crate::store_error::{Result, StoreError};

const REMOTE_USERS: &str = "users";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    pub is_online: bool,
    pub is_storage_ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    OnlineReady,
    OnlineLimited,
    OfflineReady,
    OfflineLimited,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::OnlineReady => "online-ready",
            ConnectionStatus::OnlineLimited => "online-limited",
            ConnectionStatus::OfflineReady => "offline-ready",
            ConnectionStatus::OfflineLimited => "offline-limited",
        }
    }
}

impl Display for ConnectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where reads and writes should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStrategy {
    /// Network only; no durable local capacity beyond the fallback.
    Remote,
    Local,
    /// Both are available; prefer the network and cache locally.
    Hybrid,
}

impl ConnectivityState {
    pub fn status(self) -> ConnectionStatus {
        match (self.is_online, self.is_storage_ready) {
            (true, true) => ConnectionStatus::OnlineReady,
            (true, false) => ConnectionStatus::OnlineLimited,
            (false, true) => ConnectionStatus::OfflineReady,
            (false, false) => ConnectionStatus::OfflineLimited,
        }
    }

    pub fn strategy(self) -> DataStrategy {
        match self.status() {
            ConnectionStatus::OnlineReady => DataStrategy::Hybrid,
            ConnectionStatus::OnlineLimited => DataStrategy::Remote,
            ConnectionStatus::OfflineReady | ConnectionStatus::OfflineLimited => DataStrategy::Local,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// There was nothing to push.
    Nothing,
    Clean,
    Partial,
    Failed,
}

/// Aggregate result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// `None` when no profile was cached for the user.
    pub profile_synced: Option<bool>,
    pub pushed: usize,
    pub failed: usize,
    /// Records that could not be encoded for the push.
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn status(&self) -> SyncOutcome {
        let succeeded = self.pushed + usize::from(self.profile_synced == Some(true));
        let failed = self.failed + self.skipped + usize::from(self.profile_synced == Some(false));
        match (succeeded, failed) {
            (0, 0) => SyncOutcome::Nothing,
            (_, 0) => SyncOutcome::Clean,
            (0, _) => SyncOutcome::Failed,
            _ => SyncOutcome::Partial,
        }
    }
}

/// Owns the connectivity state and runs reconciliation. Build one at the
/// composition root and share it.
pub struct SyncCoordinator {
    catalog: Arc<SeedCatalog>,
    remote: Arc<dyn RemoteBackend>,
    state: watch::Sender<ConnectivityState>,
    current_user: Mutex<Option<String>>,
}

impl SyncCoordinator {
    pub fn new(catalog: Arc<SeedCatalog>, remote: Arc<dyn RemoteBackend>, initially_online: bool) -> Self {
        let (state, _) = watch::channel(ConnectivityState {
            is_online: initially_online,
            is_storage_ready: false,
        });
        Self {
            catalog,
            remote,
            state,
            current_user: Mutex::new(None),
        }
    }

    /// Opens local storage and records whether the embedded store is usable.
    pub async fn start(&self) -> ConnectionStatus {
        let ready = self.catalog.storage().init().await;
        self.storage_opened(ready);
        self.connection_status()
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state().status()
    }

    pub fn data_strategy(&self) -> DataStrategy {
        self.state().strategy()
    }

    pub fn should_use_offline(&self) -> bool {
        let state = self.state();
        !state.is_online || !state.is_storage_ready
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online
    }

    /// Signal from the embedded store's open completing or failing.
    pub fn storage_opened(&self, ready: bool) {
        let mut next = self.state();
        next.is_storage_ready = ready;
        self.state.send_replace(next);
        info!("Local storage {}; status {}", if ready { "ready" } else { "limited" }, next.status());
    }

    /// Signal from the platform's online/offline events. Coming back online
    /// with a signed-in user runs a reconciliation pass and returns its
    /// report.
    pub async fn set_online(&self, online: bool) -> Option<ReconcileReport> {
        let mut next = self.state();
        next.is_online = online;
        let previous = self.state.send_replace(next);

        if previous.is_online == online {
            return None;
        }
        if !online {
            info!("Connection lost; status {}", next.status());
            return None;
        }

        info!("Connection restored; status {}", next.status());
        let user_id = self.current_user_id()?;
        Some(self.reconcile(&user_id).await)
    }

    pub fn set_current_user(&self, user_id: Option<String>) {
        *self.current_user.lock() = user_id;
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.current_user.lock().clone()
    }

    // ---- session ----

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<UserCacheRecord> {
        if !self.is_online() {
            return Err(StoreError::Offline);
        }
        let profile = self.remote.authenticate(email, password).await?;
        Ok(self.remember_profile(&profile).await)
    }

    pub async fn sign_up(&self, email: &str, password: &str) -> Result<UserCacheRecord> {
        if !self.is_online() {
            return Err(StoreError::Offline);
        }
        let profile = self.remote.register(email, password).await?;
        Ok(self.remember_profile(&profile).await)
    }

    /// Mirrors a profile-change event into the local cache.
    pub async fn refresh_profile(&self, profile: &RemoteProfile) -> bool {
        let cached = profile.to_cache_record(Utc::now());
        self.catalog.save_user_data(&cached).await
    }

    async fn remember_profile(&self, profile: &RemoteProfile) -> UserCacheRecord {
        let cached = profile.to_cache_record(Utc::now());
        if !self.catalog.save_user_data(&cached).await {
            warn!("Signed in as {} but could not cache the profile locally", cached.user_id);
        }
        self.set_current_user(Some(cached.user_id.clone()));
        cached
    }

    /// Forgets the current user. The cached profile stays on disk.
    pub fn sign_out(&self) {
        self.set_current_user(None);
    }

    /// The signed-in user's profile, answered from the local cache.
    pub async fn current_profile(&self) -> Option<UserCacheRecord> {
        let user_id = self.current_user_id()?;
        self.catalog.get_user_data(&user_id).await
    }

    // ---- writes that prefer the network ----

    /// Registers a seed. When online it is pushed first and stored as
    /// `synced`; offline, or after a transient failure, it is stored as
    /// `pending` for the next reconciliation. Returns the stored status, or
    /// `None` when the local write failed.
    pub async fn register_seed(&self, mut seed: SeedRecord) -> Option<SyncStatus> {
        if let Err(e) = seed.validate() {
            warn!("Rejected seed '{}': {e}", seed.id);
            return None;
        }

        seed.sync_status = if self.is_online() {
            self.push_seed(&seed).await
        } else {
            SyncStatus::Pending
        };

        let status = seed.sync_status;
        self.catalog.save_seed(seed).await.then_some(status)
    }

    async fn push_seed(&self, seed: &SeedRecord) -> SyncStatus {
        let mut outgoing = seed.clone();
        outgoing.sync_status = SyncStatus::Synced;
        let fields = match to_json_record(&outgoing) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Cannot encode seed {}: {e}", seed.id);
                return SyncStatus::Error;
            }
        };

        match self.remote.upsert_document(Collection::Seeds.name(), &seed.id, &fields).await {
            Ok(_) => SyncStatus::Synced,
            Err(e) => status_after_failure(&e),
        }
    }

    /// Uploads an image for a seed listing. Requires connectivity.
    pub async fn upload_seed_image(&self, bytes: &[u8], content_type: &str) -> Result<String> {
        if !self.is_online() {
            return Err(StoreError::Offline);
        }
        Ok(self.remote.upload_blob(bytes, content_type).await?)
    }

    // ---- reconciliation ----

    /// Runs a pass for the current user if there is one and the network is up.
    pub async fn reconcile_now(&self) -> Option<ReconcileReport> {
        if !self.is_online() {
            return None;
        }
        let user_id = self.current_user_id()?;
        Some(self.reconcile(&user_id).await)
    }

    /// Pushes the cached profile and every pending seed and exchange of
    /// `user_id`. Each record succeeds or fails on its own.
    pub async fn reconcile(&self, user_id: &str) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        if let Some(profile) = self.catalog.get_user_data(user_id).await {
            report.profile_synced = Some(match to_json_record(&profile) {
                Ok(fields) => match self.remote.upsert_document(REMOTE_USERS, user_id, &fields).await {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("Profile push for {user_id} failed: {e}");
                        false
                    }
                },
                Err(e) => {
                    warn!("Cannot encode profile {user_id}: {e}");
                    false
                }
            });
        }

        for seed in self.catalog.pending_seeds(user_id).await {
            let mut outgoing = seed.clone();
            outgoing.sync_status = SyncStatus::Synced;
            self.push_record(Collection::Seeds, &seed.id, to_json_record(&outgoing), &mut report)
                .await;
        }

        for exchange in self.catalog.pending_exchanges(user_id).await {
            let mut outgoing = exchange.clone();
            outgoing.sync_status = SyncStatus::Synced;
            self.push_record(Collection::Exchanges, &exchange.id, to_json_record(&outgoing), &mut report)
                .await;
        }

        info!(
            "Reconciliation for {user_id}: {} pushed, {} failed, {} skipped ({:?})",
            report.pushed,
            report.failed,
            report.skipped,
            report.status()
        );
        report
    }

    async fn push_record(
        &self,
        collection: Collection,
        id: &str,
        fields: Result<JsonRecord>,
        report: &mut ReconcileReport,
    ) {
        let fields = match fields {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Cannot encode {collection}/{id}: {e}");
                report.skipped += 1;
                return;
            }
        };

        match self.remote.upsert_document(collection.name(), id, &fields).await {
            Ok(_) => {
                if self.catalog.mark_sync_status(collection, id, SyncStatus::Synced).await {
                    report.pushed += 1;
                } else {
                    warn!("Pushed {collection}/{id} but could not mark it synced");
                    report.failed += 1;
                }
            }
            Err(e) => {
                let status = status_after_failure(&e);
                if status == SyncStatus::Error {
                    self.catalog.mark_sync_status(collection, id, status).await;
                }
                debug!("Push of {collection}/{id} failed ({status:?}): {e}");
                report.failed += 1;
            }
        }
    }
}

/// Transient failures keep the record pending so the next reconnect retries
/// it; anything else marks it as an error.
fn status_after_failure(error: &RemoteError) -> SyncStatus {
    if error.is_transient() {
        SyncStatus::Pending
    } else {
        SyncStatus::Error
    }
}
