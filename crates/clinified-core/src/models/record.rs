//! Record model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Field map carried by a record
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A globally unique record identifier, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Create a new unique record ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A domain entity (patient, encounter, ...) held in the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Unique identifier
    pub id: RecordId,
    /// Entity kind, e.g. `patient` or `encounter`
    pub kind: String,
    /// Field map
    pub payload: Payload,
    /// Local revision, strictly increasing on every local mutation
    pub local_revision: i64,
    /// Server revision, set only by a successful sync round trip
    pub server_revision: Option<i64>,
    /// Last modification timestamp (Unix ms)
    pub modified_at: i64,
    /// Tombstone flag so deletions can be synced
    pub is_deleted: bool,
    /// Last payload known to be on the server (merge base)
    pub synced_payload: Option<Payload>,
}

impl Record {
    /// Create a new, never-synced record
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: RecordId::new(),
            kind: kind.into(),
            payload,
            local_revision: 0,
            server_revision: None,
            modified_at: chrono::Utc::now().timestamp_millis(),
            is_deleted: false,
            synced_payload: None,
        }
    }

    /// Whether the server has ever acknowledged this record
    #[must_use]
    pub const fn is_synced(&self) -> bool {
        self.server_revision.is_some()
    }
}
