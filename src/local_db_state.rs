//! LMDB-backed embedded document store.
//!
//! Each collection is a named LMDB database holding JSON documents keyed by
//! the collection's primary key. Secondary indexes are separate databases
//! named `{collection}.by_{field}` whose keys are `{value}\0{id}`, so every
//! index lookup or range scan is a cursor walk over sorted keys.
//!
//! # Schema
//!
//! The schema version lives in the `__meta` database. Opening an environment
//! whose stored version is older than [`SCHEMA_VERSION`] runs the upgrade
//! hook, which creates only the databases that are missing; opening one at
//! the current version touches nothing. A newer stored version makes the
//! store unavailable rather than risking a downgrade.
//!
//! # Connection
//!
//! [`EmbeddedStore::open`] is memoized: the first caller starts the open on
//! a blocking thread and every caller, including concurrent ones that arrive
//! while it is still in flight, awaits that same attempt. A failed open is
//! memoized too and leaves the store permanently unavailable for this
//! instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags};
use log::{debug, info, warn};
use serde_json::Value as JsonValue;
use tokio::sync::OnceCell;

use crate::local_db_model::{Collection, JsonRecord};
use crate::record_store::RecordStore;
use crate::store_error::{Result, StoreError};

pub const SCHEMA_VERSION: u32 = 1;

const META_DB: &str = "__meta";
const SCHEMA_VERSION_KEY: &str = "schema_version";
const MAX_DBS: u32 = 16;
const INDEX_SEPARATOR: char = '\0';

/// What happened while opening the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    /// Schema version found on disk; 0 for a fresh environment.
    pub previous_version: u32,
    /// Databases the upgrade hook had to create.
    pub created: Vec<String>,
}

struct CollectionDbs {
    records: Database,
    indexes: Vec<(&'static str, Database)>,
}

struct LmdbHandle {
    env: Environment,
    collections: HashMap<Collection, CollectionDbs>,
    report: OpenReport,
}

impl LmdbHandle {
    fn open(path: &Path, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let env = Environment::new()
            .set_max_dbs(MAX_DBS)
            .set_map_size(map_size)
            .open(path)?;

        let meta = env.create_db(Some(META_DB), DatabaseFlags::empty())?;
        let previous_version = read_schema_version(&env, meta)?;
        if previous_version > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: previous_version,
                supported: SCHEMA_VERSION,
            });
        }

        let created = if previous_version < SCHEMA_VERSION {
            upgrade_schema(&env, meta, previous_version)?
        } else {
            Vec::new()
        };

        let mut collections = HashMap::new();
        for collection in Collection::ALL {
            let records = env.open_db(Some(collection.name()))?;
            let mut indexes = Vec::new();
            for field in collection.indexes() {
                indexes.push((*field, env.open_db(Some(index_db_name(collection, field).as_str()))?));
            }
            collections.insert(collection, CollectionDbs { records, indexes });
        }

        Ok(Self {
            env,
            collections,
            report: OpenReport {
                previous_version,
                created,
            },
        })
    }

    fn dbs(&self, collection: Collection) -> Result<&CollectionDbs> {
        self.collections
            .get(&collection)
            .ok_or_else(|| StoreError::BackendUnavailable(format!("Collection '{collection}' is not open")))
    }

    fn save(&self, collection: Collection, record: &JsonRecord) -> Result<()> {
        let id = collection.key_of(record).ok_or_else(|| {
            StoreError::Validation(format!(
                "Record for '{collection}' is missing '{}'",
                collection.primary_key()
            ))
        })?;
        let dbs = self.dbs(collection)?;
        let bytes = serde_json::to_vec(record)?;

        let mut txn = self.env.begin_rw_txn()?;
        if let Some(previous) = read_record(&txn, dbs.records, &id)? {
            remove_index_entries(&mut txn, dbs, &previous, &id)?;
        }
        txn.put(dbs.records, &id, &bytes, WriteFlags::empty())?;
        for (field, db) in &dbs.indexes {
            if let Some(value) = record.get(*field).and_then(index_value) {
                txn.put(*db, &index_key(&value, &id), &id, WriteFlags::empty())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<JsonRecord>> {
        let dbs = self.dbs(collection)?;
        let txn = self.env.begin_ro_txn()?;
        read_record(&txn, dbs.records, id)
    }

    fn get_all(&self, collection: Collection) -> Result<Vec<JsonRecord>> {
        let dbs = self.dbs(collection)?;
        let txn = self.env.begin_ro_txn()?;
        let mut records = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(dbs.records)?;
            for (_, value) in cursor.iter() {
                records.push(serde_json::from_slice::<JsonRecord>(value)?);
            }
        }
        Ok(records)
    }

    fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let dbs = self.dbs(collection)?;
        let mut txn = self.env.begin_rw_txn()?;
        let Some(previous) = read_record(&txn, dbs.records, id)? else {
            txn.abort();
            return Ok(false);
        };

        remove_index_entries(&mut txn, dbs, &previous, id)?;
        txn.del(dbs.records, &id, None)?;
        txn.commit()?;
        Ok(true)
    }

    fn clear(&self, collection: Collection) -> Result<()> {
        let dbs = self.dbs(collection)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(dbs.records)?;
        for (_, db) in &dbs.indexes {
            txn.clear_db(*db)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Records whose indexed `field` lies within the inclusive bounds, in
    /// index order.
    fn range(
        &self,
        collection: Collection,
        field: &str,
        lower: Option<&str>,
        upper: Option<&str>,
        exact: bool,
    ) -> Result<Vec<JsonRecord>> {
        let dbs = self.dbs(collection)?;
        let index_db = dbs
            .indexes
            .iter()
            .find(|(name, _)| *name == field)
            .map(|(_, db)| *db)
            .ok_or_else(|| StoreError::Validation(format!("No index on '{field}' in '{collection}'")))?;

        let txn = self.env.begin_ro_txn()?;
        let mut ids = Vec::new();
        {
            // `iter()` starts from an unpositioned cursor, so an empty index
            // or a lower bound past the last key yields nothing.
            let mut cursor = txn.open_ro_cursor(index_db)?;
            for (key, id) in cursor.iter() {
                let Some(value) = std::str::from_utf8(key)
                    .ok()
                    .and_then(|key| key.split(INDEX_SEPARATOR).next())
                else {
                    continue;
                };
                if lower.is_some_and(|lower| value < lower) {
                    continue;
                }
                if exact && Some(value) != lower {
                    break;
                }
                if upper.is_some_and(|upper| value > upper) {
                    break;
                }
                ids.push(String::from_utf8_lossy(id).into_owned());
            }
        }

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = read_record(&txn, dbs.records, &id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn index_db_name(collection: Collection, field: &str) -> String {
    format!("{}.by_{field}", collection.name())
}

/// Index form of a field value. Unsigned integers are zero-padded so that
/// byte order matches numeric order; objects, arrays and null are not indexed.
fn index_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(match n.as_u64() {
            Some(u) => format!("{u:020}"),
            None => n.to_string(),
        }),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn index_key(value: &str, id: &str) -> String {
    format!("{value}{INDEX_SEPARATOR}{id}")
}

fn read_record<T: Transaction>(txn: &T, db: Database, id: &str) -> Result<Option<JsonRecord>> {
    match txn.get(db, &id) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_index_entries(
    txn: &mut RwTransaction<'_>,
    dbs: &CollectionDbs,
    record: &JsonRecord,
    id: &str,
) -> Result<()> {
    for (field, db) in &dbs.indexes {
        if let Some(value) = record.get(*field).and_then(index_value) {
            match txn.del(*db, &index_key(&value, id), None) {
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn read_schema_version(env: &Environment, meta: Database) -> Result<u32> {
    let txn = env.begin_ro_txn()?;
    let version = match txn.get(meta, &SCHEMA_VERSION_KEY) {
        Ok(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|text| text.parse::<u32>().ok())
            .ok_or_else(|| StoreError::Database("Stored schema version is unreadable".to_string()))?,
        Err(lmdb::Error::NotFound) => 0,
        Err(e) => return Err(e.into()),
    };
    Ok(version)
}

/// Upgrade hook: creates whatever databases the current schema needs and
/// are not there yet, then records the new version.
fn upgrade_schema(env: &Environment, meta: Database, from_version: u32) -> Result<Vec<String>> {
    info!("Upgrading local schema from v{from_version} to v{SCHEMA_VERSION}");

    let mut created = Vec::new();
    for collection in Collection::ALL {
        let mut names = vec![collection.name().to_string()];
        names.extend(collection.indexes().iter().map(|field| index_db_name(collection, field)));

        for name in names {
            match env.open_db(Some(name.as_str())) {
                Ok(_) => {}
                Err(lmdb::Error::NotFound) => {
                    env.create_db(Some(name.as_str()), DatabaseFlags::empty())?;
                    created.push(name);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    let mut txn = env.begin_rw_txn()?;
    txn.put(meta, &SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_string(), WriteFlags::empty())?;
    txn.commit()?;

    info!("Schema v{SCHEMA_VERSION} ready ({} databases created)", created.len());
    Ok(created)
}

/// The primary backend. Construct one per application and share it.
pub struct EmbeddedStore {
    path: PathBuf,
    map_size: usize,
    connection: OnceCell<Option<Arc<LmdbHandle>>>,
    open_attempts: AtomicUsize,
}

impl EmbeddedStore {
    pub fn new(path: impl Into<PathBuf>, map_size: usize) -> Self {
        Self {
            path: path.into(),
            map_size,
            connection: OnceCell::new(),
            open_attempts: AtomicUsize::new(0),
        }
    }

    /// A store for platforms without an embedded database; every operation
    /// reports `BackendUnavailable`.
    pub fn unsupported() -> Self {
        Self {
            path: PathBuf::new(),
            map_size: 0,
            connection: OnceCell::new_with(Some(None)),
            open_attempts: AtomicUsize::new(0),
        }
    }

    /// Opens the environment once and returns whether it is usable.
    pub async fn open(&self) -> bool {
        self.connection().await.is_ok()
    }

    /// True once an open has completed successfully.
    pub fn is_ready(&self) -> bool {
        matches!(self.connection.get(), Some(Some(_)))
    }

    /// How many times an open was actually started.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn open_report(&self) -> Option<OpenReport> {
        self.connection
            .get()
            .and_then(|handle| handle.as_ref())
            .map(|handle| handle.report.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connection(&self) -> Result<Arc<LmdbHandle>> {
        let handle = self
            .connection
            .get_or_init(|| async {
                self.open_attempts.fetch_add(1, Ordering::SeqCst);
                let path = self.path.clone();
                let map_size = self.map_size;
                info!("Opening embedded store at {}", path.display());

                match tokio::task::spawn_blocking(move || LmdbHandle::open(&path, map_size)).await {
                    Ok(Ok(handle)) => {
                        info!("Embedded store ready (schema v{SCHEMA_VERSION})");
                        Some(Arc::new(handle))
                    }
                    Ok(Err(e)) => {
                        warn!("Embedded store unavailable, using fallback: {e}");
                        None
                    }
                    Err(e) => {
                        warn!("Embedded store open task failed: {e}");
                        None
                    }
                }
            })
            .await;

        handle
            .clone()
            .ok_or_else(|| StoreError::BackendUnavailable("embedded store failed to open".to_string()))
    }

    /// Records whose `field` index equals `value`.
    pub async fn find_by_index(
        &self,
        collection: Collection,
        field: &str,
        value: &JsonValue,
    ) -> Result<Vec<JsonRecord>> {
        let handle = self.connection().await?;
        let Some(value) = index_value(value) else {
            return Ok(Vec::new());
        };
        handle.range(collection, field, Some(&value), Some(&value), true)
    }

    /// Records whose `field` index lies within the inclusive bounds.
    pub async fn range_by_index(
        &self,
        collection: Collection,
        field: &str,
        lower: Option<&JsonValue>,
        upper: Option<&JsonValue>,
    ) -> Result<Vec<JsonRecord>> {
        let handle = self.connection().await?;
        let lower = lower.and_then(index_value);
        let upper = upper.and_then(index_value);
        handle.range(collection, field, lower.as_deref(), upper.as_deref(), false)
    }
}

#[async_trait]
impl RecordStore for EmbeddedStore {
    async fn save(&self, collection: Collection, record: &JsonRecord) -> Result<()> {
        let handle = self.connection().await?;
        handle.save(collection, record)?;
        debug!("Saved {collection} record to embedded store");
        Ok(())
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<JsonRecord>> {
        self.connection().await?.get(collection, id)
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<JsonRecord>> {
        self.connection().await?.get_all(collection)
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        self.connection().await?.delete(collection, id)
    }

    async fn clear(&self, collection: Collection) -> Result<()> {
        self.connection().await?.clear(collection)
    }

    fn disk_usage(&self) -> u64 {
        if !self.is_ready() {
            return 0;
        }
        std::fs::metadata(self.path.join("data.mdb")).map_or(0, |meta| meta.len())
    }

    fn backend_name(&self) -> &'static str {
        "lmdb"
    }
}
