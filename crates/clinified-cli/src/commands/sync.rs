use std::path::Path;

use clinified_core::models::CycleStatus;
use clinified_core::ConflictChoice;
use serde_json::json;

use crate::cli::KeepSide;
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, format_timestamp, open_database, open_orchestrator,
    ConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(db_path: &Path) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(db_path)?;
    let summary = orchestrator.run_cycle().await?;

    let status = match summary.status {
        CycleStatus::Completed => "Sync completed",
        CycleStatus::Offline => "Sync skipped (offline)",
        CycleStatus::Cancelled => "Sync cancelled",
        CycleStatus::Degraded => "Sync degraded",
    };
    println!(
        "{status}: sent {}, acknowledged {}, conflicted {}, failed {}, pulled {}",
        summary.sent, summary.acknowledged, summary.conflicted, summary.failed, summary.pulled
    );
    if let Some(error) = orchestrator.status().last_error {
        println!("{error}");
    }
    Ok(())
}

pub async fn run_sync_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let counts = db.queue_counts().await?;
    let cursor = db.pull_cursor().await?;
    let open_conflicts = db.open_conflict_count().await?;

    if as_json {
        let status = json!({
            "queue": counts,
            "pullCursor": cursor,
            "openConflicts": open_conflicts,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("pending:        {}", counts.pending);
    println!("in flight:      {}", counts.in_flight);
    println!("failed:         {}", counts.failed);
    println!("conflicted:     {}", counts.conflicted);
    println!("open conflicts: {open_conflicts}");
    println!("pull cursor:    {cursor}");
    Ok(())
}

pub async fn run_sync_conflicts(
    include_resolved: bool,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let conflicts = db.list_conflicts(include_resolved, limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(conflict_to_item)
            .collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_sync_resolve(id: i64, keep: KeepSide, db_path: &Path) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(db_path)?;
    let choice = match keep {
        KeepSide::Local => ConflictChoice::KeepLocal,
        KeepSide::Remote => ConflictChoice::KeepRemote,
    };
    let conflict = orchestrator.resolve_conflict(id, choice).await?;

    println!(
        "Resolved conflict #{} as {} at {}",
        conflict.id,
        conflict.outcome,
        conflict
            .resolved_at
            .map_or_else(|| "-".to_string(), format_timestamp)
    );
    Ok(())
}

pub async fn run_sync_dismiss(id: i64, db_path: &Path) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(db_path)?;
    orchestrator.dismiss_conflict(id).await?;

    println!("Dismissed conflict #{id}");
    Ok(())
}

pub async fn run_sync_retry_failed(db_path: &Path) -> Result<(), CliError> {
    let orchestrator = open_orchestrator(db_path)?;
    let retried = orchestrator.retry_failed().await?;

    println!("Re-queued {retried} failed entries");
    Ok(())
}
