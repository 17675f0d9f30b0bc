//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .optional()?
        .flatten()
        .unwrap_or(0);

    Ok(version)
}

/// Apply a list of statements atomically
fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    tx.commit()?;

    tracing::info!("Migrated local store to version {version}");
    Ok(())
}

/// Migration to version 1: records, change log and sync queue
fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            "CREATE TABLE IF NOT EXISTS records (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                local_revision INTEGER NOT NULL,
                server_revision INTEGER,
                modified_at INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                synced_payload TEXT
            )",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_records_local_revision ON records(local_revision)",
            "CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind, modified_at DESC)",
            // Immutable change log, one row per local mutation
            "CREATE TABLE IF NOT EXISTS change_log (
                id TEXT PRIMARY KEY,
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                op TEXT NOT NULL,
                payload TEXT NOT NULL,
                local_revision INTEGER NOT NULL,
                base_revision INTEGER,
                created_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_change_log_record ON change_log(record_id, local_revision)",
            "CREATE TRIGGER IF NOT EXISTS change_log_immutable BEFORE UPDATE ON change_log
             BEGIN
                 SELECT RAISE(ABORT, 'change_log rows are immutable');
             END",
            // Delivery state, owned by the sync queue
            "CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                change_id TEXT NOT NULL UNIQUE REFERENCES change_log(id) ON DELETE CASCADE,
                record_id TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at INTEGER NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_state ON sync_queue(state, seq)",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_record ON sync_queue(record_id, seq)",
            // Device-local sync metadata (device id, pull cursor)
            "CREATE TABLE IF NOT EXISTS sync_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ],
    )
}

/// Migration to version 2: conflict records
fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        CURRENT_VERSION,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                record_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                local_version TEXT NOT NULL,
                remote_version TEXT NOT NULL,
                outcome TEXT NOT NULL,
                resolved_payload TEXT,
                conflicting_fields TEXT NOT NULL DEFAULT '[]',
                detected_at INTEGER NOT NULL,
                resolved_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record_id ON sync_conflicts(record_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_detected_at ON sync_conflicts(detected_at DESC)",
        ],
    )
}
