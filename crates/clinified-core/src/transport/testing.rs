//! In-memory sync endpoint for tests

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::{
    BatchRequest, BatchResponse, EntryResult, PullRequest, PullResponse, ServerRecord, Transport,
    TransportError,
};
use crate::models::{ChangeId, ChangeOp, Payload, RecordId};

/// Scripted behaviour for the next request
#[derive(Debug, Clone)]
pub enum Failure {
    /// Fail the whole request
    Error(TransportError),
    /// Answer these entries with the given results, process the rest normally
    Entries(Vec<EntryResult>),
    /// Never answer
    Hang,
    /// Apply the batch, then lose the response
    ApplyThenHang,
}

#[derive(Debug, Default)]
struct FakeState {
    records: HashMap<RecordId, ServerRecord>,
    revision: i64,
    seen: HashMap<ChangeId, i64>,
    failures: VecDeque<Failure>,
    batches: Vec<BatchRequest>,
    calls: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, failure: Failure) {
        self.state.lock().unwrap().failures.push_back(failure);
    }

    pub fn batches_received(&self) -> usize {
        self.state.lock().unwrap().batches.len()
    }

    /// Batch requests started, including ones that never answered
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn last_batch(&self) -> Option<BatchRequest> {
        self.state.lock().unwrap().batches.last().cloned()
    }

    pub fn record(&self, id: &RecordId) -> Option<ServerRecord> {
        self.state.lock().unwrap().records.get(id).cloned()
    }

    /// Simulate a write made by another device
    pub fn remote_put(
        &self,
        id: RecordId,
        kind: &str,
        payload: Payload,
        modified_at: i64,
        deleted: bool,
    ) -> ServerRecord {
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        let record = ServerRecord {
            id,
            kind: kind.to_string(),
            revision: state.revision,
            payload,
            modified_at,
            deleted,
        };
        state.records.insert(id, record.clone());
        record
    }

    fn next_failure(&self) -> Option<Failure> {
        self.state.lock().unwrap().failures.pop_front()
    }
}

impl Transport for FakeServer {
    async fn send_batch(&self, request: &BatchRequest) -> Result<BatchResponse, TransportError> {
        let mut overrides = HashMap::new();
        let mut lose_response = false;
        self.state.lock().unwrap().calls += 1;
        match self.next_failure() {
            Some(Failure::Error(error)) => {
                self.state.lock().unwrap().batches.push(request.clone());
                return Err(error);
            }
            Some(Failure::Hang) => return std::future::pending().await,
            Some(Failure::ApplyThenHang) => lose_response = true,
            Some(Failure::Entries(results)) => {
                overrides.extend(results.into_iter().map(|result| (result.id, result)));
            }
            None => {}
        }

        let mut results = Vec::with_capacity(request.entries.len());
        {
            let mut state = self.state.lock().unwrap();
            state.batches.push(request.clone());

            for entry in &request.entries {
                if let Some(result) = overrides.remove(&entry.change_id) {
                    results.push(result);
                    continue;
                }
                if let Some(revision) = state.seen.get(&entry.change_id) {
                    results.push(EntryResult::ack(entry.change_id, *revision));
                    continue;
                }

                match state.records.get(&entry.record_id) {
                    Some(current) if !entry.builds_on(current.revision, &state.seen) => {
                        results.push(EntryResult::conflict(entry.change_id, current.clone()));
                        continue;
                    }
                    None if entry.op == ChangeOp::Delete => {
                        results.push(EntryResult::rejected(entry.change_id, "unknown record"));
                        continue;
                    }
                    _ => {}
                }

                state.revision += 1;
                let revision = state.revision;
                state.records.insert(
                    entry.record_id,
                    ServerRecord {
                        id: entry.record_id,
                        kind: entry.kind.clone(),
                        revision,
                        payload: entry.payload.clone(),
                        modified_at: entry.modified_at,
                        deleted: entry.op == ChangeOp::Delete,
                    },
                );
                state.seen.insert(entry.change_id, revision);
                results.push(EntryResult::ack(entry.change_id, revision));
            }
            drop(state);
        }

        if lose_response {
            return std::future::pending().await;
        }
        Ok(BatchResponse { results })
    }

    async fn pull_changes(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        match self.next_failure() {
            Some(Failure::Error(error)) => return Err(error),
            Some(Failure::Hang | Failure::ApplyThenHang) => return std::future::pending().await,
            Some(Failure::Entries(_)) | None => {}
        }

        let state = self.state.lock().unwrap();
        let mut records = state
            .records
            .values()
            .filter(|record| record.revision > request.since)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|record| record.revision);
        records.truncate(request.limit);

        let cursor = records
            .last()
            .map_or(request.since, |record| record.revision);
        Ok(PullResponse { records, cursor })
    }
}
