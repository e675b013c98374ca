//! The backend seam shared by the embedded store and the fallback store.
//!
//! [`LocalStorage`](crate::local_storage::LocalStorage) composes two
//! `RecordStore`s, trying the primary first and the secondary on any error.

use async_trait::async_trait;

use crate::local_db_model::{Collection, JsonRecord};
use crate::store_error::Result;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces `record` under its primary key.
    async fn save(&self, collection: Collection, record: &JsonRecord) -> Result<()>;

    /// `Ok(None)` when no record has that key.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<JsonRecord>>;

    async fn get_all(&self, collection: Collection) -> Result<Vec<JsonRecord>>;

    /// Returns whether a record was removed.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;

    async fn clear(&self, collection: Collection) -> Result<()>;

    /// Bytes this backend occupies on disk, for the usage estimate.
    fn disk_usage(&self) -> u64 {
        0
    }

    fn backend_name(&self) -> &'static str;
}
