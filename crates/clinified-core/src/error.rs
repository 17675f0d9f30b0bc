//! Error types for clinified-core

use thiserror::Error;

/// Result type alias using clinified-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in clinified-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local persistence failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record, change or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid sync configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure that may succeed on retry
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Transient failures exhausted the retry budget
    #[error("Sync degraded: {0}")]
    DegradedSync(String),

    /// The server refused a change and it will not be retried
    #[error("Change for record {record_id} rejected: {reason}")]
    PermanentRejection { record_id: String, reason: String },

    /// A conflict needs manual intervention
    #[error("Unresolved conflict: {0}")]
    ConflictUnresolved(String),

    /// Another sync cycle holds the cycle lock
    #[error("A sync cycle is already running")]
    SyncInProgress,

    /// No connectivity
    #[error("Device is offline")]
    Offline,

    /// The cycle was cancelled before it finished
    #[error("Sync cycle cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the error comes from local persistence
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Io(_))
    }
}
