//! In-memory server state for the batch sync endpoint.
//!
//! Records are kept per tenant. A single revision counter orders every
//! accepted write, so pull cursors stay monotonic.

use std::collections::HashMap;
use std::sync::Arc;

use clinified_core::transport::{EntryResult, PullResponse, ServerRecord, WireChange};
use clinified_core::util::is_valid_kind;
use clinified_core::{ChangeId, ChangeOp, RecordId};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct TenantState {
    records: HashMap<RecordId, ServerRecord>,
    /// Revision each accepted change was stored under
    accepted: HashMap<ChangeId, i64>,
}

#[derive(Debug, Default)]
struct StoreState {
    revision: i64,
    tenants: HashMap<String, TenantState>,
}

#[derive(Clone, Debug, Default)]
pub struct SyncStore {
    state: Arc<Mutex<StoreState>>,
}

impl SyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch in order, one result per entry
    pub async fn apply_batch(&self, tenant_id: &str, entries: Vec<Value>) -> Vec<EntryResult> {
        let mut guard = self.state.lock().await;
        let StoreState { revision, tenants } = &mut *guard;
        let tenant = tenants.entry(tenant_id.to_string()).or_default();

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            match parse_entry(entry) {
                Ok(change) => results.push(apply_change(tenant, revision, change)),
                Err(Some(result)) => results.push(result),
                Err(None) => {}
            }
        }
        results
    }

    /// Records written after `since`, oldest first
    pub async fn changes_since(&self, tenant_id: &str, since: i64, limit: usize) -> PullResponse {
        let state = self.state.lock().await;
        let Some(tenant) = state.tenants.get(tenant_id) else {
            return PullResponse {
                records: Vec::new(),
                cursor: since,
            };
        };

        let mut records = tenant
            .records
            .values()
            .filter(|record| record.revision > since)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|record| record.revision);
        records.truncate(limit);

        let cursor = records.last().map_or(since, |record| record.revision);
        PullResponse { records, cursor }
    }
}

/// Entries that do not decode are rejected when they carry a change id and
/// dropped otherwise; the client counts a missing result as transient.
fn parse_entry(entry: Value) -> Result<WireChange, Option<EntryResult>> {
    let change_id = entry
        .get("changeId")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse::<ChangeId>().ok());

    serde_json::from_value::<WireChange>(entry).map_err(|error| {
        change_id.map(|id| EntryResult::rejected(id, format!("invalid entry: {error}")))
    })
}

fn apply_change(tenant: &mut TenantState, revision: &mut i64, change: WireChange) -> EntryResult {
    if let Some(accepted) = tenant.accepted.get(&change.change_id) {
        return EntryResult::ack(change.change_id, *accepted);
    }
    if !is_valid_kind(&change.kind) {
        return EntryResult::rejected(
            change.change_id,
            format!("invalid record kind '{}'", change.kind),
        );
    }

    match tenant.records.get(&change.record_id) {
        Some(current) if current.kind != change.kind => {
            return EntryResult::rejected(
                change.change_id,
                format!("record is a {}, not a {}", current.kind, change.kind),
            );
        }
        Some(current) if !change.builds_on(current.revision, &tenant.accepted) => {
            tracing::info!(
                "Conflict on {} {}: base {:?}, server revision {}",
                current.kind,
                current.id,
                change.base_revision,
                current.revision
            );
            return EntryResult::conflict(change.change_id, current.clone());
        }
        None if change.op == ChangeOp::Delete || change.base_revision.is_some() => {
            return EntryResult::rejected(change.change_id, "unknown record");
        }
        _ => {}
    }

    *revision += 1;
    let record = ServerRecord {
        id: change.record_id,
        kind: change.kind,
        revision: *revision,
        payload: change.payload,
        modified_at: change.modified_at,
        deleted: change.op == ChangeOp::Delete,
    };
    tracing::debug!(
        "Stored {} {} at revision {}",
        record.kind,
        record.id,
        record.revision
    );
    tenant.records.insert(record.id, record);
    tenant.accepted.insert(change.change_id, *revision);
    EntryResult::ack(change.change_id, *revision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinified_core::transport::WireOutcome;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn entry(change_id: ChangeId, record_id: RecordId, op: &str, base: Option<i64>) -> Value {
        let mut entry = json!({
            "changeId": change_id,
            "recordId": record_id,
            "kind": "patient",
            "op": op,
            "payload": {"name": "Asha"},
            "localRevision": 1,
            "modifiedAt": 1_700_000_000_000_i64,
        });
        if let Some(base) = base {
            entry["baseRevision"] = json!(base);
        }
        entry
    }

    #[tokio::test]
    async fn create_then_update_advances_revision() {
        let store = SyncStore::new();
        let id = RecordId::new();

        let created = store
            .apply_batch("clinic", vec![entry(ChangeId::new(), id, "create", None)])
            .await;
        assert_eq!(created[0].outcome, WireOutcome::Ack);
        assert_eq!(created[0].server_revision, Some(1));

        let updated = store
            .apply_batch("clinic", vec![entry(ChangeId::new(), id, "update", Some(1))])
            .await;
        assert_eq!(updated[0].server_revision, Some(2));

        let page = store.changes_since("clinic", 0, 10).await;
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].revision, 2);
        assert_eq!(page.cursor, 2);
    }

    #[tokio::test]
    async fn stale_base_revision_conflicts_with_server_record() {
        let store = SyncStore::new();
        let id = RecordId::new();
        store
            .apply_batch("clinic", vec![entry(ChangeId::new(), id, "create", None)])
            .await;
        store
            .apply_batch("clinic", vec![entry(ChangeId::new(), id, "update", Some(1))])
            .await;

        let results = store
            .apply_batch("clinic", vec![entry(ChangeId::new(), id, "update", Some(1))])
            .await;
        assert_eq!(results[0].outcome, WireOutcome::Conflict);
        assert_eq!(results[0].server_record.as_ref().unwrap().revision, 2);
    }

    #[tokio::test]
    async fn change_folding_an_applied_change_builds_on_its_revision() {
        let store = SyncStore::new();
        let id = RecordId::new();
        let created = ChangeId::new();
        store
            .apply_batch("clinic", vec![entry(created, id, "create", None)])
            .await;

        let mut coalesced = entry(ChangeId::new(), id, "create", None);
        coalesced["supersedes"] = json!([created]);
        let results = store.apply_batch("clinic", vec![coalesced]).await;
        assert_eq!(results[0].outcome, WireOutcome::Ack);
        assert_eq!(results[0].server_revision, Some(2));

        // Once someone else has written, the folded change no longer matches
        store
            .apply_batch("clinic", vec![entry(ChangeId::new(), id, "update", Some(2))])
            .await;
        let mut stale = entry(ChangeId::new(), id, "update", None);
        stale["supersedes"] = json!([created]);
        let results = store.apply_batch("clinic", vec![stale]).await;
        assert_eq!(results[0].outcome, WireOutcome::Conflict);
    }

    #[tokio::test]
    async fn duplicate_change_is_acknowledged_with_original_revision() {
        let store = SyncStore::new();
        let change_id = ChangeId::new();
        let id = RecordId::new();

        let first = store
            .apply_batch("clinic", vec![entry(change_id, id, "create", None)])
            .await;
        let again = store
            .apply_batch("clinic", vec![entry(change_id, id, "create", None)])
            .await;
        assert_eq!(first, again);
        assert_eq!(store.changes_since("clinic", 0, 10).await.cursor, 1);
    }

    #[tokio::test]
    async fn invalid_entries_are_rejected() {
        let store = SyncStore::new();
        let unknown_delete = ChangeId::new();
        let bad_kind = ChangeId::new();
        let bad_payload = ChangeId::new();

        let mut wrong_kind = entry(bad_kind, RecordId::new(), "create", None);
        wrong_kind["kind"] = json!("Not A Kind");
        let mut not_object = entry(bad_payload, RecordId::new(), "create", None);
        not_object["payload"] = json!([1, 2, 3]);

        let results = store
            .apply_batch(
                "clinic",
                vec![
                    entry(unknown_delete, RecordId::new(), "delete", None),
                    wrong_kind,
                    not_object,
                    json!({"garbage": true}),
                ],
            )
            .await;

        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|result| result.outcome == WireOutcome::Rejected));
        assert_eq!(results[0].reason.as_deref(), Some("unknown record"));
        assert!(results[2].reason.as_ref().unwrap().starts_with("invalid entry"));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = SyncStore::new();
        store
            .apply_batch("a", vec![entry(ChangeId::new(), RecordId::new(), "create", None)])
            .await;

        assert!(store.changes_since("b", 0, 10).await.records.is_empty());
        assert_eq!(store.changes_since("a", 0, 10).await.records.len(), 1);
    }

    #[tokio::test]
    async fn pull_pages_by_limit() {
        let store = SyncStore::new();
        let entries = (0..5)
            .map(|_| entry(ChangeId::new(), RecordId::new(), "create", None))
            .collect();
        store.apply_batch("clinic", entries).await;

        let first = store.changes_since("clinic", 0, 2).await;
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.cursor, 2);

        let rest = store.changes_since("clinic", first.cursor, 10).await;
        assert_eq!(rest.records.len(), 3);
        assert_eq!(rest.cursor, 5);

        let empty = store.changes_since("clinic", rest.cursor, 10).await;
        assert!(empty.records.is_empty());
        assert_eq!(empty.cursor, 5);
    }
}
