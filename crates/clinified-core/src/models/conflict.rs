//! Conflict model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{Payload, RecordId};

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    LocalWins,
    RemoteWins,
    Merged,
    Unresolved,
}

impl ResolutionOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::Merged => "merged",
            Self::Unresolved => "unresolved",
        }
    }
}

impl fmt::Display for ResolutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_wins" => Ok(Self::LocalWins),
            "remote_wins" => Ok(Self::RemoteWins),
            "merged" => Ok(Self::Merged),
            "unresolved" => Ok(Self::Unresolved),
            other => Err(format!("unknown resolution outcome '{other}'")),
        }
    }
}

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub payload: Payload,
    /// Local revision for the local side, server revision for the remote side
    pub revision: Option<i64>,
    /// Modification timestamp (Unix ms)
    pub modified_at: i64,
    pub deleted: bool,
}

/// Conflict between a local unacknowledged change and a newer server version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict row identifier
    pub id: i64,
    /// Record involved in the conflict
    pub record_id: RecordId,
    pub kind: String,
    pub local: RecordVersion,
    pub remote: RecordVersion,
    pub outcome: ResolutionOutcome,
    /// Payload written back after resolution
    pub resolved_payload: Option<Payload>,
    /// Fields both sides changed to different values
    pub conflicting_fields: Vec<String>,
    /// Detection timestamp (Unix ms)
    pub detected_at: i64,
    /// Resolution timestamp (Unix ms), `None` while unresolved
    pub resolved_at: Option<i64>,
}

impl ConflictRecord {
    /// Whether the conflict still waits for manual intervention
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
