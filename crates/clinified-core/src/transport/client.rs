//! Retrying batch delivery on top of a [`Transport`]

use std::collections::HashMap;
use std::time::Duration;

use super::{
    BatchRequest, EntryResult, PullRequest, PullResponse, ServerRecord, Transport, TransportError,
    WireOutcome,
};
use crate::models::ChangeId;

/// Exponential backoff: `base_delay * 2^(attempt - 1)`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total sends per change, first attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Final result for one change after retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged { server_revision: i64 },
    Conflict { server_record: ServerRecord },
    Rejected { reason: String },
    Exhausted { attempts: u32, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub change_id: ChangeId,
    /// Sends it took to reach the outcome
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

/// Sends batches and retries the transient part of each response
pub struct TransportClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> TransportClient<T> {
    pub const fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub const fn transport(&self) -> &T {
        &self.transport
    }

    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver every entry of `request`, returning one [`Delivery`] per entry.
    ///
    /// Only entries whose result was transient (or missing) are re-sent. A
    /// permanent whole-batch failure rejects every entry still outstanding.
    pub async fn deliver(&self, request: BatchRequest) -> Vec<Delivery> {
        let BatchRequest {
            tenant_id,
            device_id,
            entries,
        } = request;

        let mut remaining = entries;
        let mut settled = Vec::with_capacity(remaining.len());
        let mut attempt = 0;

        while !remaining.is_empty() {
            attempt += 1;
            let batch = BatchRequest {
                tenant_id: tenant_id.clone(),
                device_id: device_id.clone(),
                entries: remaining.clone(),
            };

            let mut last_reason = String::new();
            match self.transport.send_batch(&batch).await {
                Ok(response) => {
                    let mut results = response
                        .results
                        .into_iter()
                        .map(|result| (result.id, result))
                        .collect::<HashMap<_, _>>();

                    let mut retry = Vec::new();
                    for entry in remaining.drain(..) {
                        let Some(result) = results.remove(&entry.change_id) else {
                            last_reason = "no result returned for change".to_string();
                            retry.push(entry);
                            continue;
                        };

                        let EntryResult {
                            outcome,
                            server_revision,
                            reason,
                            server_record,
                            ..
                        } = result;
                        let outcome = match (outcome, server_revision, server_record) {
                            (WireOutcome::Ack, Some(server_revision), _) => {
                                Ok(DeliveryOutcome::Acknowledged { server_revision })
                            }
                            (WireOutcome::Conflict, _, Some(server_record)) => {
                                Ok(DeliveryOutcome::Conflict { server_record })
                            }
                            (WireOutcome::Rejected, _, _) => Ok(DeliveryOutcome::Rejected {
                                reason: reason.unwrap_or_else(|| "rejected by server".to_string()),
                            }),
                            (label, _, _) => Err(reason
                                .unwrap_or_else(|| format!("incomplete {label:?} result"))),
                        };

                        match outcome {
                            Ok(outcome) => settled.push(Delivery {
                                change_id: entry.change_id,
                                attempts: attempt,
                                outcome,
                            }),
                            Err(reason) => {
                                last_reason = reason;
                                retry.push(entry);
                            }
                        }
                    }
                    remaining = retry;
                }
                Err(error) if error.is_transient() => {
                    last_reason = error.to_string();
                }
                Err(error) => {
                    tracing::error!("Sync batch rejected: {error}");
                    settled.extend(remaining.drain(..).map(|entry| Delivery {
                        change_id: entry.change_id,
                        attempts: attempt,
                        outcome: DeliveryOutcome::Rejected {
                            reason: error.to_string(),
                        },
                    }));
                }
            }

            if remaining.is_empty() {
                break;
            }

            if attempt >= self.policy.max_attempts {
                tracing::warn!(
                    "Giving up on {} changes after {} attempts: {}",
                    remaining.len(),
                    attempt,
                    last_reason
                );
                settled.extend(remaining.drain(..).map(|entry| Delivery {
                    change_id: entry.change_id,
                    attempts: attempt,
                    outcome: DeliveryOutcome::Exhausted {
                        attempts: attempt,
                        reason: last_reason.clone(),
                    },
                }));
                break;
            }

            let delay = self.policy.delay_for(attempt);
            tracing::warn!(
                "Retrying {} changes (attempt {}/{}) in {:?}: {}",
                remaining.len(),
                attempt + 1,
                self.policy.max_attempts,
                delay,
                last_reason
            );
            tokio::time::sleep(delay).await;
        }

        settled
    }

    /// Fetch one page of remote changes, retrying transient failures
    pub async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.transport.pull_changes(request).await {
                Ok(response) => return Ok(response),
                Err(error) if error.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        "Retrying pull (attempt {}/{}) in {:?}: {}",
                        attempt + 1,
                        self.policy.max_attempts,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Pair each delivery with the wire change it answers
pub fn index_deliveries(deliveries: Vec<Delivery>) -> HashMap<ChangeId, Delivery> {
    deliveries
        .into_iter()
        .map(|delivery| (delivery.change_id, delivery))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeOp, Payload, RecordId};
    use crate::transport::testing::{FakeServer, Failure};
    use crate::transport::WireChange;
    use pretty_assertions::assert_eq;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn wire_change() -> WireChange {
        WireChange {
            change_id: ChangeId::new(),
            record_id: RecordId::new(),
            kind: "patient".to_string(),
            op: ChangeOp::Create,
            payload: Payload::new(),
            local_revision: 1,
            base_revision: None,
            modified_at: 1,
            supersedes: Vec::new(),
        }
    }

    fn change_ids(entries: &[WireChange]) -> Vec<ChangeId> {
        entries.iter().map(|entry| entry.change_id).collect()
    }

    fn request(entries: Vec<WireChange>) -> BatchRequest {
        BatchRequest {
            tenant_id: "clinic".to_string(),
            device_id: "device".to_string(),
            entries,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts_of_transient_errors() {
        let server = FakeServer::new();
        for _ in 0..3 {
            server.fail_next(Failure::Error(TransportError::Status {
                status: 503,
                message: "maintenance".to_string(),
            }));
        }
        let client = TransportClient::new(server.clone(), fast_policy(3));

        let deliveries = client.deliver(request(vec![wire_change()])).await;

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].attempts, 3);
        assert!(matches!(
            &deliveries[0].outcome,
            DeliveryOutcome::Exhausted { attempts: 3, reason } if reason.contains("maintenance")
        ));
        assert_eq!(server.batches_received(), 3);
    }

    #[tokio::test]
    async fn recovers_when_transient_errors_stop() {
        let server = FakeServer::new();
        server.fail_next(Failure::Error(TransportError::Timeout("slow".to_string())));
        let client = TransportClient::new(server.clone(), fast_policy(3));

        let deliveries = client.deliver(request(vec![wire_change()])).await;

        assert_eq!(deliveries[0].attempts, 2);
        assert!(matches!(
            deliveries[0].outcome,
            DeliveryOutcome::Acknowledged { .. }
        ));
    }

    #[tokio::test]
    async fn only_transient_entries_are_resent() {
        let server = FakeServer::new();
        let flaky = wire_change();
        let steady = wire_change();
        server.fail_next(Failure::Entries(vec![EntryResult::transient(
            flaky.change_id,
            "shard busy",
        )]));
        let client = TransportClient::new(server.clone(), fast_policy(3));

        let deliveries =
            index_deliveries(client.deliver(request(vec![flaky.clone(), steady.clone()])).await);

        assert_eq!(deliveries[&flaky.change_id].attempts, 2);
        assert_eq!(deliveries[&steady.change_id].attempts, 1);
        let resent = server.last_batch().unwrap();
        assert_eq!(change_ids(&resent.entries), vec![flaky.change_id]);
    }

    #[tokio::test]
    async fn permanent_error_rejects_whole_batch() {
        let server = FakeServer::new();
        server.fail_next(Failure::Error(TransportError::Status {
            status: 400,
            message: "unknown tenant".to_string(),
        }));
        let client = TransportClient::new(server.clone(), fast_policy(3));

        let deliveries = client.deliver(request(vec![wire_change(), wire_change()])).await;

        assert_eq!(deliveries.len(), 2);
        assert!(deliveries.iter().all(|delivery| matches!(
            &delivery.outcome,
            DeliveryOutcome::Rejected { reason } if reason.contains("unknown tenant")
        )));
        assert_eq!(server.batches_received(), 1);
    }

    #[tokio::test]
    async fn pull_retries_transient_errors() {
        let server = FakeServer::new();
        server.fail_next(Failure::Error(TransportError::Connect("refused".to_string())));
        let client = TransportClient::new(server.clone(), fast_policy(2));

        let page = client
            .pull(&PullRequest {
                tenant_id: "clinic".to_string(),
                since: 0,
                limit: 10,
            })
            .await
            .unwrap();
        assert!(page.records.is_empty());
    }
}
