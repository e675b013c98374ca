//! Contract of the cloud auth/database/object-storage service.
//!
//! The storage core never talks to the network itself; it is handed an
//! implementation of [`RemoteBackend`] and treats every call as fallible.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::local_db_model::{JsonRecord, UserCacheRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Transport-level failure; the call may succeed later.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    /// The backend refused the request (permissions, invalid data).
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

/// Identity returned by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProfile {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub email_verified: bool,
    pub photo_url: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
    pub last_sign_in_time: Option<DateTime<Utc>>,
}

impl RemoteProfile {
    /// Snapshot for the local profile cache, stamped with `saved_at`.
    pub fn to_cache_record(&self, saved_at: DateTime<Utc>) -> UserCacheRecord {
        UserCacheRecord {
            user_id: self.uid.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            email_verified: self.email_verified,
            photo_url: self.photo_url.clone(),
            created_at: self.creation_time.unwrap_or(saved_at),
            last_login_at: self.last_sign_in_time.unwrap_or(saved_at),
            saved_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub collection: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDocument {
    pub id: String,
    pub fields: JsonRecord,
}

/// Equality filter on one document field. Used by [`RemoteBackend::query_documents`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFilter {
    pub field: String,
    pub value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOrdering {
    pub field: String,
    pub descending: bool,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn authenticate(&self, email: &str, password: &str) -> Result<RemoteProfile, RemoteError>;

    async fn register(&self, email: &str, password: &str) -> Result<RemoteProfile, RemoteError>;

    async fn upsert_document(&self, collection: &str, id: &str, fields: &JsonRecord) -> Result<DocumentRef, RemoteError>;

    /// Filtered listing for hosts that browse the remote catalog directly.
    /// Reconciliation only pushes, so nothing in this crate calls it.
    async fn query_documents(
        &self,
        collection: &str,
        filters: &[QueryFilter],
        ordering: Option<&QueryOrdering>,
    ) -> Result<Vec<RemoteDocument>, RemoteError>;

    /// Stores a blob and returns its public URL.
    async fn upload_blob(&self, bytes: &[u8], content_type: &str) -> Result<String, RemoteError>;
}
