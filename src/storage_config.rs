//! Storage configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//!
//! ```rust
//! use seed_exchange_store::storage_config::StorageConfig;
//!
//! let config = StorageConfig::from_toml_str(r#"
//!     data_dir = "/var/lib/seeds"
//!     fallback_quota_bytes = 1048576
//! "#)?;
//! assert_eq!(config.database_name, "seed_exchange");
//! assert_eq!(config.fallback_quota_bytes, 1024 * 1024);
//! # Ok::<(), seed_exchange_store::store_error::StoreError>(())
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::store_error::{Result, StoreError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding both backends' files.
    pub data_dir: PathBuf,
    pub database_name: String,
    /// LMDB map size; writes beyond it fail with `QuotaExceeded`.
    pub map_size_bytes: usize,
    /// Capacity of the fallback key-value store (keys plus values).
    pub fallback_quota_bytes: usize,
    /// Usage above this triggers pruning of old completed exchanges.
    pub max_total_storage_bytes: u64,
    pub auto_cleanup_days: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            database_name: "seed_exchange".to_string(),
            map_size_bytes: 64 * 1024 * 1024,
            fallback_quota_bytes: 5 * 1024 * 1024,
            max_total_storage_bytes: 50 * 1024 * 1024,
            auto_cleanup_days: 30,
        }
    }
}

impl StorageConfig {
    /// Default config rooted at `data_dir`.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StorageConfig = toml::from_str(text)
            .map_err(|e| StoreError::Validation(format!("Invalid storage config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_name.trim().is_empty() {
            return Err(StoreError::Validation("database_name must not be empty".to_string()));
        }
        if self.map_size_bytes == 0 || self.fallback_quota_bytes == 0 {
            return Err(StoreError::Validation("storage sizes must be positive".to_string()));
        }
        if self.auto_cleanup_days < 0 {
            return Err(StoreError::Validation("auto_cleanup_days must not be negative".to_string()));
        }
        Ok(())
    }

    /// Directory of the LMDB environment.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.lmdb", self.database_name))
    }

    /// JSON file backing the fallback key-value store.
    pub fn fallback_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.kv.json", self.database_name))
    }
}
