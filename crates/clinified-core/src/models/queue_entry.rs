//! Sync queue entry model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ChangeRecord;

/// Delivery state of a queued change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Waiting to be drained
    Pending,
    /// Drained into a batch that has not completed
    InFlight,
    /// Acknowledged by the server, awaiting pruning
    Acknowledged,
    /// Terminal failure, kept for audit until retried
    Failed,
    /// Blocked on a conflict that needs manual resolution
    Conflicted,
}

impl DeliveryState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Acknowledged => "acknowledged",
            Self::Failed => "failed",
            Self::Conflicted => "conflicted",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "acknowledged" => Ok(Self::Acknowledged),
            "failed" => Ok(Self::Failed),
            "conflicted" => Ok(Self::Conflicted),
            other => Err(format!("unknown delivery state '{other}'")),
        }
    }
}

/// A change record together with its delivery bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    /// Queue sequence number (FIFO order)
    pub seq: i64,
    /// The wrapped change
    pub change: ChangeRecord,
    /// Current delivery state
    pub state: DeliveryState,
    /// Number of send attempts so far
    pub attempts: u32,
    /// Last failure reason, if any
    pub last_error: Option<String>,
    /// Last state transition (Unix ms)
    pub updated_at: i64,
}
