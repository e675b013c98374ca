//! # Seed Exchange Store
//!
//! Offline-first storage and sync core for a community seed-exchange app.
//! Built on LMDB (Lightning Memory-Mapped Database) with a small JSON
//! key-value file as the fallback when the embedded store cannot be opened.
//!
//! ## Layers
//!
//! - [`local_db_state`]: the embedded LMDB document store, four collections
//!   with secondary indexes and a versioned schema
//! - [`local_kv_store`]: the fallback key-value store, keyed `{collection}_{id}`
//! - [`local_storage`]: the unified API, primary first with transparent
//!   fallback and sentinel results instead of errors
//! - [`seed_catalog`]: typed helpers for seeds, exchanges, the cached
//!   profile and drafts
//! - [`connectivity`]: online/readiness state, data strategy and
//!   reconciliation against a [`remote_backend::RemoteBackend`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use seed_exchange_store::local_db_model::{SeedCategory, SeedRecord};
//! use seed_exchange_store::local_storage::LocalStorage;
//! use seed_exchange_store::seed_catalog::SeedCatalog;
//! use seed_exchange_store::storage_config::StorageConfig;
//!
//! # async fn demo() {
//! let config = StorageConfig::in_dir("/var/lib/seeds");
//! let storage = Arc::new(LocalStorage::from_config(&config));
//! storage.init().await;
//!
//! let catalog = SeedCatalog::new(storage, config.auto_cleanup_days);
//! catalog
//!     .save_seed(SeedRecord::new("s1", "Quinoa Roja", SeedCategory::Cereales, "u1"))
//!     .await;
//! assert_eq!(catalog.search_seeds("quinoa").await.len(), 1);
//! # }
//! ```

pub mod connectivity;
pub mod local_db_model;
pub mod local_db_state;
pub mod local_kv_store;
pub mod local_storage;
pub mod record_store;
pub mod remote_backend;
pub mod seed_catalog;
pub mod storage_config;
pub mod store_error;

pub use connectivity::{ConnectionStatus, DataStrategy, ReconcileReport, SyncCoordinator};
pub use local_storage::LocalStorage;
pub use seed_catalog::SeedCatalog;
pub use storage_config::StorageConfig;
pub use store_error::{Result, StoreError};
