use std::io;

use clinified_core::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] clinified_core::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid record id '{0}'")]
    InvalidRecordId(String),
    #[error("Invalid field assignment '{0}', expected KEY=VALUE")]
    InvalidField(String),
    #[error("--json must be a JSON object")]
    PayloadNotObject,
    #[error("No changes given; use --field, --unset or --json")]
    NoChanges,
    #[error("Sync is not configured. Set CLINIFIED_SYNC_ENDPOINT to enable `clinified sync`.")]
    SyncNotConfigured,
}
