use std::env;
use std::path::{Path, PathBuf};

use chrono::Utc;
use clinified_core::connectivity::Connectivity;
use clinified_core::resolver::ConflictState;
use clinified_core::transport::HttpTransport;
use clinified_core::{
    ChangeRecord, ConflictRecord, DatabaseService, Payload, Record, RecordId, SyncConfig,
    SyncOrchestrator,
};
use serde::Serialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub id: String,
    pub kind: String,
    pub payload: Payload,
    pub local_revision: i64,
    pub server_revision: Option<i64>,
    pub modified_at: i64,
    pub relative_time: String,
    pub deleted: bool,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: i64,
    pub record_id: String,
    pub kind: String,
    pub outcome: String,
    pub conflicting_fields: Vec<String>,
    pub local: Payload,
    pub remote: Payload,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub resolved_at: Option<i64>,
}

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("CLINIFIED_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clinified")
        .join("clinified.db")
}

pub fn open_database(path: &Path) -> Result<DatabaseService, CliError> {
    Ok(DatabaseService::open_path(path.to_path_buf())?)
}

/// Orchestrator over the HTTP transport, configured from the environment
pub fn open_orchestrator(path: &Path) -> Result<SyncOrchestrator<HttpTransport>, CliError> {
    let config = SyncConfig::from_env()?;
    let Some(endpoint) = config.endpoint.clone() else {
        return Err(CliError::SyncNotConfigured);
    };

    let transport = HttpTransport::new(endpoint, config.token.clone(), config.request_timeout)?;
    let service = open_database(path)?;
    tracing::debug!("Sync configured: {config:?}");
    Ok(SyncOrchestrator::new(
        service,
        transport,
        config,
        Connectivity::default(),
    ))
}

pub fn parse_record_id(raw: &str) -> Result<RecordId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidRecordId(raw.to_string()))
}

/// Parse `key=value`; the value is JSON when it parses, a string otherwise
pub fn parse_field(raw: &str) -> Result<(String, Value), CliError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(CliError::InvalidField(raw.to_string()));
    };
    let key = key.trim();
    if key.is_empty() {
        return Err(CliError::InvalidField(raw.to_string()));
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub fn parse_payload_json(raw: &str) -> Result<Payload, CliError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(CliError::PayloadNotObject),
    }
}

/// Apply `--json`, then `--field`, then `--unset` on top of `base`
pub fn build_payload(
    base: Payload,
    json: Option<&str>,
    fields: &[String],
    unset: &[String],
) -> Result<Payload, CliError> {
    let mut payload = match json {
        Some(raw) => parse_payload_json(raw)?,
        None => base,
    };
    for raw in fields {
        let (key, value) = parse_field(raw)?;
        payload.insert(key, value);
    }
    for key in unset {
        payload.remove(key.trim());
    }
    Ok(payload)
}

pub fn record_to_list_item(record: &Record) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        id: record.id.to_string(),
        kind: record.kind.clone(),
        payload: record.payload.clone(),
        local_revision: record.local_revision,
        server_revision: record.server_revision,
        modified_at: record.modified_at,
        relative_time: format_relative_time(record.modified_at, now_ms),
        deleted: record.is_deleted,
    }
}

pub fn format_record_lines(records: &[Record]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let short_id = short_id(&record.id.to_string());
            let preview = payload_preview(&record.payload, 48);
            let relative_time = format_relative_time(record.modified_at, now_ms);
            let marker = if record.is_deleted {
                "deleted"
            } else if record.is_synced() {
                "synced"
            } else {
                "local"
            };
            format!(
                "{short_id:<13}  {:<12}  {preview:<48}  {relative_time:<10}  {marker}",
                record.kind
            )
        })
        .collect()
}

pub fn format_record_details(record: &Record, state: ConflictState) -> Vec<String> {
    let mut lines = vec![
        format!("id:       {}", record.id),
        format!("kind:     {}", record.kind),
        format!("revision: {}", record.local_revision),
        format!(
            "server:   {}",
            record
                .server_revision
                .map_or_else(|| "never synced".to_string(), |revision| revision.to_string())
        ),
        format!("modified: {}", format_timestamp(record.modified_at)),
        format!("conflict: {}", state.as_str()),
    ];
    lines.extend(
        record
            .payload
            .iter()
            .map(|(key, value)| format!("  {key} = {value}")),
    );
    lines
}

pub fn format_change_lines(changes: &[ChangeRecord]) -> Vec<String> {
    changes
        .iter()
        .map(|change| {
            format!(
                "{}  {:<6}  rev={} base={}  {}",
                format_timestamp(change.created_at),
                change.op.as_str(),
                change.local_revision,
                change
                    .base_revision
                    .map_or_else(|| "-".to_string(), |revision| revision.to_string()),
                payload_preview(&change.payload, 60)
            )
        })
        .collect()
}

pub fn conflict_to_item(conflict: &ConflictRecord) -> ConflictItem {
    ConflictItem {
        id: conflict.id,
        record_id: conflict.record_id.to_string(),
        kind: conflict.kind.clone(),
        outcome: conflict.outcome.to_string(),
        conflicting_fields: conflict.conflicting_fields.clone(),
        local: conflict.local.payload.clone(),
        remote: conflict.remote.payload.clone(),
        detected_at: conflict.detected_at,
        detected_at_iso: format_timestamp(conflict.detected_at),
        resolved_at: conflict.resolved_at,
    }
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            let fields = if conflict.conflicting_fields.is_empty() {
                "-".to_string()
            } else {
                conflict.conflicting_fields.join(",")
            };
            format!(
                "#{:<4}  {}  {:<11}  {} {}  fields={fields}",
                conflict.id,
                format_timestamp(conflict.detected_at),
                conflict.outcome.as_str(),
                conflict.kind,
                short_id(&conflict.record_id.to_string())
            )
        })
        .collect()
}

pub fn payload_preview(payload: &Payload, max_chars: usize) -> String {
    let collapsed = payload
        .iter()
        .map(|(key, value)| match value {
            Value::String(text) => format!("{key}={text}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(13).collect()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
