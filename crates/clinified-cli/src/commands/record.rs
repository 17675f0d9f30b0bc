use std::path::Path;

use clinified_core::Payload;

use crate::commands::common::{
    build_payload, format_change_lines, format_record_details, format_record_lines,
    open_database, parse_record_id, record_to_list_item, RecordListItem,
};
use crate::error::CliError;

pub async fn run_add(
    kind: &str,
    fields: &[String],
    json: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let payload = build_payload(Payload::new(), json, fields, &[])?;
    let db = open_database(db_path)?;
    let record = db.create_record(kind, payload).await?;

    println!("{}", record.id);
    Ok(())
}

pub async fn run_update(
    id: &str,
    fields: &[String],
    unset: &[String],
    json: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    if fields.is_empty() && unset.is_empty() && json.is_none() {
        return Err(CliError::NoChanges);
    }

    let id = parse_record_id(id)?;
    let db = open_database(db_path)?;
    let current = db.get_record(&id).await?;
    let payload = build_payload(current.payload, json, fields, unset)?;
    let record = db.update_record(&id, payload).await?;

    println!("Updated {} (revision {})", record.id, record.local_revision);
    Ok(())
}

pub async fn run_get(id: &str, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let id = parse_record_id(id)?;
    let db = open_database(db_path)?;
    let record = db.get_record(&id).await?;
    let state = db.conflict_state(&id).await?;

    if as_json {
        let mut value = serde_json::to_value(&record)?;
        value["conflict_state"] = serde_json::to_value(state)?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        for line in format_record_details(&record, state) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_delete(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id = parse_record_id(id)?;
    let db = open_database(db_path)?;
    db.delete_record(&id).await?;

    println!("Deleted {id}");
    Ok(())
}

pub async fn run_list(
    kind: Option<&str>,
    since: Option<i64>,
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path)?;
    let records = match since {
        Some(revision) => {
            let mut records = db.list_modified_since(revision).await?;
            records.retain(|record| kind.is_none_or(|kind| record.kind == kind));
            records.truncate(limit);
            records
        }
        None => db.list_records(kind, limit, 0).await?,
    };

    if as_json {
        let json_items = records
            .iter()
            .map(record_to_list_item)
            .collect::<Vec<RecordListItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No records found.");
        return Ok(());
    }

    for line in format_record_lines(&records) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_history(id: &str, db_path: &Path) -> Result<(), CliError> {
    let id = parse_record_id(id)?;
    let db = open_database(db_path)?;
    let changes = db.record_history(&id).await?;

    if changes.is_empty() {
        println!("No unsynced changes for {id}.");
        return Ok(());
    }

    for line in format_change_lines(&changes) {
        println!("{line}");
    }
    Ok(())
}
