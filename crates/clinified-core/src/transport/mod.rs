//! Batch transport to the remote sync endpoint.
//!
//! The wire contract is JSON with camelCase keys:
//!
//! * `POST {endpoint}/v1/sync/batch` carries a [`BatchRequest`] and answers
//!   with one [`EntryResult`] per change.
//! * `GET {endpoint}/v1/sync/changes?tenantId=&since=&limit=` answers with a
//!   [`PullResponse`] page of server records newer than the cursor.

mod client;
mod http;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ChangeId, ChangeOp, Payload, Record, RecordId};
use crate::queue::DrainedChange;
use crate::tracker::RemoteVersion;

pub use client::{index_deliveries, Delivery, DeliveryOutcome, RetryPolicy, TransportClient};
pub use http::HttpTransport;

/// Transport-level failures, classified by whether a retry can help
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Invalid transport configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Sync endpoint returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("Invalid sync response payload: {0}")]
    InvalidPayload(String),
    #[error("Sync HTTP request failed: {0}")]
    Http(String),
}

impl TransportError {
    /// Timeouts, connection failures, 5xx, 408 and 429 are worth retrying;
    /// other client errors and malformed payloads are not.
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connect(_) | Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::InvalidConfiguration(_) | Self::InvalidPayload(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout(error.to_string())
        } else if error.is_connect() {
            Self::Connect(error.to_string())
        } else if error.is_decode() {
            Self::InvalidPayload(error.to_string())
        } else if error.is_builder() {
            Self::InvalidConfiguration(error.to_string())
        } else {
            Self::Http(error.to_string())
        }
    }
}

/// One coalesced change on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireChange {
    /// Idempotency key
    pub change_id: ChangeId,
    pub record_id: RecordId,
    pub kind: String,
    pub op: ChangeOp,
    pub payload: Payload,
    pub local_revision: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_revision: Option<i64>,
    pub modified_at: i64,
    /// Earlier changes of the same record folded into this one
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supersedes: Vec<ChangeId>,
}

impl WireChange {
    /// Build the transmission for a drained change. The base revision comes
    /// from the record's current server revision, which already reflects
    /// acknowledgments that landed after the change was logged.
    pub fn from_drained(drained: &DrainedChange, record: &Record) -> Self {
        let change = &drained.change;
        let op = match (drained.op, record.server_revision) {
            (ChangeOp::Update, None) => ChangeOp::Create,
            (op, _) => op,
        };
        Self {
            change_id: change.id,
            record_id: drained.record_id,
            kind: change.kind.clone(),
            op,
            payload: change.payload.clone(),
            local_revision: change.local_revision,
            base_revision: record.server_revision,
            modified_at: record.modified_at,
            supersedes: drained.supersedes.clone(),
        }
    }

    /// Whether this change was written on top of the server's
    /// `current_revision`: its base names it, or one of the changes it
    /// supersedes was stored under it. `accepted` maps applied change ids to
    /// their revisions.
    pub fn builds_on(&self, current_revision: i64, accepted: &HashMap<ChangeId, i64>) -> bool {
        self.base_revision == Some(current_revision)
            || self
                .supersedes
                .iter()
                .any(|id| accepted.get(id) == Some(&current_revision))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub tenant_id: String,
    pub device_id: String,
    pub entries: Vec<WireChange>,
}

/// Per-entry outcome label reported by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireOutcome {
    Ack,
    Conflict,
    Rejected,
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryResult {
    /// Change id the result belongs to
    pub id: ChangeId,
    pub outcome: WireOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_revision: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_record: Option<ServerRecord>,
}

impl EntryResult {
    pub const fn ack(id: ChangeId, server_revision: i64) -> Self {
        Self {
            id,
            outcome: WireOutcome::Ack,
            server_revision: Some(server_revision),
            reason: None,
            server_record: None,
        }
    }

    pub fn conflict(id: ChangeId, server_record: ServerRecord) -> Self {
        Self {
            id,
            outcome: WireOutcome::Conflict,
            server_revision: Some(server_record.revision),
            reason: None,
            server_record: Some(server_record),
        }
    }

    pub fn rejected(id: ChangeId, reason: impl Into<String>) -> Self {
        Self {
            id,
            outcome: WireOutcome::Rejected,
            server_revision: None,
            reason: Some(reason.into()),
            server_record: None,
        }
    }

    pub fn transient(id: ChangeId, reason: impl Into<String>) -> Self {
        Self {
            id,
            outcome: WireOutcome::Transient,
            server_revision: None,
            reason: Some(reason.into()),
            server_record: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<EntryResult>,
}

/// Server-side state of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: RecordId,
    pub kind: String,
    pub revision: i64,
    pub payload: Payload,
    pub modified_at: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl ServerRecord {
    pub fn to_remote_version(&self) -> RemoteVersion {
        RemoteVersion {
            kind: self.kind.clone(),
            payload: self.payload.clone(),
            revision: self.revision,
            modified_at: self.modified_at,
            deleted: self.deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub tenant_id: String,
    /// Highest server revision already seen
    pub since: i64,
    pub limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    pub records: Vec<ServerRecord>,
    /// Cursor to resume from on the next pull
    pub cursor: i64,
}

/// Remote sync endpoint
pub trait Transport: Send + Sync {
    fn send_batch(
        &self,
        request: &BatchRequest,
    ) -> impl Future<Output = Result<BatchResponse, TransportError>> + Send;

    fn pull_changes(
        &self,
        request: &PullRequest,
    ) -> impl Future<Output = Result<PullResponse, TransportError>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send_batch(
        &self,
        request: &BatchRequest,
    ) -> impl Future<Output = Result<BatchResponse, TransportError>> + Send {
        (**self).send_batch(request)
    }

    fn pull_changes(
        &self,
        request: &PullRequest,
    ) -> impl Future<Output = Result<PullResponse, TransportError>> + Send {
        (**self).pull_changes(request)
    }
}
