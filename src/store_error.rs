//! Error taxonomy shared by both storage backends, the unified API and the
//! connectivity coordinator.
//!
//! Adapters return [`StoreError`] through `Result`; the unified API never lets
//! one escape and converts it into the verb's sentinel after logging.

use std::io;

use thiserror::Error;

use crate::remote_backend::RemoteError;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The embedded store never opened or failed to open.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller does not own the record it tried to change.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A write would exceed the backend's capacity.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk schema is newer than this build understands.
    #[error("Schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: u32, supported: u32 },

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Operation requires connectivity")]
    Offline,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<lmdb::Error> for StoreError {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::MapFull => {
                StoreError::QuotaExceeded(format!("LMDB map is full: {err}"))
            }
            lmdb::Error::NotFound => StoreError::NotFound(format!("LMDB key not found: {err}")),
            lmdb::Error::Corrupted | lmdb::Error::Panic | lmdb::Error::VersionMismatch => {
                StoreError::BackendUnavailable(format!("LMDB environment unusable: {err}"))
            }
            _ => StoreError::Database(format!("LMDB error: {err}")),
        }
    }
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded(_))
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, StoreError::BackendUnavailable(_))
    }
}
