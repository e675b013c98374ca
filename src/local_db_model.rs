//! Record schemas for the four local collections.
//!
//! Storage backends move untyped JSON objects ([`JsonRecord`]) keyed by the
//! collection's primary key field. The domain layer converts those objects to
//! and from the typed records defined here, so every record that leaves the
//! catalog helpers has been validated against its collection's schema.
//!
//! # Primary keys
//!
//! Every collection is keyed by `id` except [`Collection::UserData`], which is
//! keyed by `userId`. The profile cache mirrors the remote auth identity key,
//! and callers look profiles up by that identity, so the asymmetry is part of
//! the schema and is exposed through [`Collection::primary_key`].
//!
//! ```rust
//! use seed_exchange_store::local_db_model::Collection;
//!
//! assert_eq!(Collection::Seeds.primary_key(), "id");
//! assert_eq!(Collection::UserData.primary_key(), "userId");
//! ```

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::store_error::{Result, StoreError};

/// A stored record as the backends see it: a flat JSON object.
pub type JsonRecord = Map<String, JsonValue>;

/// The fixed set of local collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "seeds")]
    Seeds,
    #[serde(rename = "exchanges")]
    Exchanges,
    #[serde(rename = "userData")]
    UserData,
    #[serde(rename = "tempData")]
    TempData,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Seeds,
        Collection::Exchanges,
        Collection::UserData,
        Collection::TempData,
    ];

    /// Name used for LMDB databases and fallback key prefixes.
    pub fn name(self) -> &'static str {
        match self {
            Collection::Seeds => "seeds",
            Collection::Exchanges => "exchanges",
            Collection::UserData => "userData",
            Collection::TempData => "tempData",
        }
    }

    /// Field holding the record's primary key.
    pub fn primary_key(self) -> &'static str {
        match self {
            Collection::UserData => "userId",
            _ => "id",
        }
    }

    /// Fields with a secondary index in the embedded store.
    pub fn indexes(self) -> &'static [&'static str] {
        match self {
            Collection::Seeds => &["ownerId", "category", "createdAt"],
            Collection::Exchanges => &["requesterId", "ownerId", "status"],
            Collection::UserData => &[],
            Collection::TempData => &["type", "timestamp"],
        }
    }

    /// Extracts the non-empty primary key of `record` for this collection.
    pub fn key_of(self, record: &JsonRecord) -> Option<String> {
        match record.get(self.primary_key()) {
            Some(JsonValue::String(key)) if !key.trim().is_empty() => Some(key.clone()),
            _ => None,
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Collection {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|collection| collection.name() == s)
            .ok_or_else(|| StoreError::Validation(format!("Unknown collection '{s}'")))
    }
}

/// Current time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serializes timestamps as RFC 3339 UTC with millisecond precision, the
/// same shape [`now_iso`] produces.
pub mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        DateTime::<Utc>::deserialize(deserializer)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => super::serialize(value, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<DateTime<Utc>>::deserialize(deserializer)
        }
    }
}

/// Sync state of a locally created or modified record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

/// Seed categories offered by the registration form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedCategory {
    Cereales,
    Legumbres,
    Hortalizas,
    Frutales,
    Aromaticas,
    Otros,
}

impl SeedCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            SeedCategory::Cereales => "cereales",
            SeedCategory::Legumbres => "legumbres",
            SeedCategory::Hortalizas => "hortalizas",
            SeedCategory::Frutales => "frutales",
            SeedCategory::Aromaticas => "aromaticas",
            SeedCategory::Otros => "otros",
        }
    }
}

impl FromStr for SeedCategory {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(JsonValue::String(s.to_string()))
            .map_err(|_| StoreError::Validation(format!("Unknown seed category '{s}'")))
    }
}

/// A seed listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variety: Option<String>,
    pub category: SeedCategory,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub owner_id: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_phone: Option<String>,
    #[serde(default = "default_true")]
    pub is_available_for_exchange: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_version")]
    pub version: u32,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    1
}

impl SeedRecord {
    /// A minimal listing; everything optional starts empty.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: SeedCategory,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            variety: None,
            category,
            description: String::new(),
            location: None,
            image_url: None,
            owner_id: owner_id.into(),
            owner_name: String::new(),
            owner_phone: None,
            is_available_for_exchange: true,
            exchange_notes: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            sync_status: SyncStatus::Pending,
            is_active: true,
            version: 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty("id", &self.id)?;
        require_non_empty("name", &self.name)?;
        require_non_empty("ownerId", &self.owner_id)
    }

    /// Case-insensitive match of an already lowercased term against name,
    /// description and variety.
    pub fn matches_term(&self, lowered_term: &str) -> bool {
        self.name.to_lowercase().contains(lowered_term)
            || self.description.to_lowercase().contains(lowered_term)
            || self
                .variety
                .as_deref()
                .is_some_and(|variety| variety.to_lowercase().contains(lowered_term))
    }
}

/// Lifecycle of an exchange request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Completed,
}

impl ExchangeStatus {
    pub const ALL: [ExchangeStatus; 4] = [
        ExchangeStatus::Pending,
        ExchangeStatus::Accepted,
        ExchangeStatus::Rejected,
        ExchangeStatus::Completed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Accepted => "accepted",
            ExchangeStatus::Rejected => "rejected",
            ExchangeStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeStatus::Rejected | ExchangeStatus::Completed)
    }

    /// Forward edges only: pending -> accepted | rejected, accepted -> completed.
    pub fn can_transition_to(self, next: ExchangeStatus) -> bool {
        matches!(
            (self, next),
            (ExchangeStatus::Pending, ExchangeStatus::Accepted)
                | (ExchangeStatus::Pending, ExchangeStatus::Rejected)
                | (ExchangeStatus::Accepted, ExchangeStatus::Completed)
        )
    }
}

impl Display for ExchangeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        ExchangeStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| {
                StoreError::Validation(format!(
                    "Invalid status '{s}', expected one of: pending, accepted, rejected, completed"
                ))
            })
    }
}

/// A request to swap one seed for another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeRecord {
    pub id: String,
    pub seed_offered_id: String,
    pub seed_requested_id: String,
    pub requester_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub status: ExchangeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "iso_millis::option")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl ExchangeRecord {
    pub fn new(
        id: impl Into<String>,
        seed_offered_id: impl Into<String>,
        seed_requested_id: impl Into<String>,
        requester_id: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            seed_offered_id: seed_offered_id.into(),
            seed_requested_id: seed_requested_id.into(),
            requester_id: requester_id.into(),
            owner_id: owner_id.into(),
            status: ExchangeStatus::Pending,
            message: None,
            created_at: None,
            updated_at: None,
            sync_status: SyncStatus::Pending,
        }
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty("id", &self.id)?;
        require_non_empty("seedOfferedId", &self.seed_offered_id)?;
        require_non_empty("seedRequestedId", &self.seed_requested_id)?;
        require_non_empty("requesterId", &self.requester_id)?;
        require_non_empty("ownerId", &self.owner_id)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.requester_id == user_id || self.owner_id == user_id
    }
}

/// Cached snapshot of the signed-in user's profile, keyed by `userId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserCacheRecord {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
    #[serde(with = "iso_millis")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub last_login_at: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub saved_at: DateTime<Utc>,
}

impl UserCacheRecord {
    pub fn validate(&self) -> Result<()> {
        require_non_empty("userId", &self.user_id)
    }
}

/// Transient data such as an in-progress wizard draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub payload: JsonValue,
}

impl TempRecord {
    pub fn validate(&self) -> Result<()> {
        require_non_empty("id", &self.id)?;
        require_non_empty("type", &self.kind)
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("Field '{field}' is required")));
    }
    Ok(())
}

/// Serializes a typed record into the object form the backends store.
pub fn to_json_record<T: Serialize>(record: &T) -> Result<JsonRecord> {
    match serde_json::to_value(record)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(StoreError::Validation(format!(
            "Record must serialize to a JSON object, got {other}"
        ))),
    }
}

/// Parses a stored object back into its typed record.
pub fn from_json_record<T: for<'de> Deserialize<'de>>(record: JsonRecord) -> Result<T> {
    Ok(serde_json::from_value(JsonValue::Object(record))?)
}
