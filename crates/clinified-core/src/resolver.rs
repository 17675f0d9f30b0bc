//! Conflict resolution
//!
//! [`resolve`] is a pure function of the merge policy, the merge base (the
//! last payload known to be on the server), and the two competing versions.
//! It never touches storage; the orchestrator writes the result back.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{ConflictRecord, Payload, RecordVersion, ResolutionOutcome};

/// How competing versions of a record are reconciled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Whole record, later `modified_at` wins, ties go to the server
    #[serde(rename = "lww")]
    LastWriteWins,
    /// Field-level three-way merge against the synced base
    #[default]
    FieldMerge,
    /// Leave both versions for a person to decide
    Manual,
}

impl MergePolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LastWriteWins => "lww",
            Self::FieldMerge => "field_merge",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lww" | "last_write_wins" => Ok(Self::LastWriteWins),
            "field_merge" | "merge" => Ok(Self::FieldMerge),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown merge policy '{other}'")),
        }
    }
}

/// Default policy plus per-record-kind overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverConfig {
    pub default_policy: MergePolicy,
    pub overrides: HashMap<String, MergePolicy>,
}

impl ResolverConfig {
    pub fn policy_for(&self, kind: &str) -> MergePolicy {
        self.overrides
            .get(kind)
            .copied()
            .unwrap_or(self.default_policy)
    }

    /// Parse overrides written as `kind=policy,kind=policy`
    pub fn parse_overrides(raw: &str) -> Result<HashMap<String, MergePolicy>, String> {
        raw.split(',')
            .map(str::trim)
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (kind, policy) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("expected kind=policy, got '{pair}'"))?;
                Ok((kind.trim().to_string(), policy.parse()?))
            })
            .collect()
    }
}

/// Per-record conflict lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictState {
    #[default]
    Clean,
    /// A newer server version competes with unacknowledged local changes
    Conflicted,
    /// Settled locally; the write-back has not been acknowledged yet
    Resolved,
}

/// Inputs that move a record through [`ConflictState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictEvent {
    /// A server version collided with local changes
    Detected,
    /// A policy or a person produced an outcome
    Settled(ResolutionOutcome),
    /// The server has every local change of the record
    Acknowledged,
}

impl ConflictState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Conflicted => "conflicted",
            Self::Resolved => "resolved",
        }
    }

    /// Next state, or the current one when the event does not apply
    pub const fn advance(self, event: ConflictEvent) -> Self {
        match (self, event) {
            (_, ConflictEvent::Detected) => Self::Conflicted,
            (Self::Conflicted, ConflictEvent::Settled(ResolutionOutcome::Unresolved)) => {
                Self::Conflicted
            }
            (Self::Conflicted, ConflictEvent::Settled(_)) => Self::Resolved,
            (Self::Resolved, ConflictEvent::Acknowledged) => Self::Clean,
            (state, _) => state,
        }
    }

    /// State of a record given its newest conflict and whether it still has
    /// changes the server has not acknowledged
    pub fn of_record(latest: Option<&ConflictRecord>, has_local_changes: bool) -> Self {
        let Some(conflict) = latest else {
            return Self::Clean;
        };
        let state = Self::Clean
            .advance(ConflictEvent::Detected)
            .advance(ConflictEvent::Settled(conflict.outcome));
        if has_local_changes {
            state
        } else {
            state.advance(ConflictEvent::Acknowledged)
        }
    }
}

/// Result of a resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    /// Payload to write back; `None` when unresolved
    pub payload: Option<Payload>,
    /// Whether the resolved record is a tombstone
    pub deleted: bool,
    /// Fields both sides changed to different values
    pub conflicting_fields: Vec<String>,
    /// A version lost data and must be kept as a conflict record
    pub superseded: bool,
}

impl Resolution {
    fn unresolved(conflicting_fields: Vec<String>) -> Self {
        Self {
            outcome: ResolutionOutcome::Unresolved,
            payload: None,
            deleted: false,
            conflicting_fields,
            superseded: true,
        }
    }

    fn settled(
        payload: Payload,
        deleted: bool,
        local: &RecordVersion,
        remote: &RecordVersion,
        conflicting_fields: Vec<String>,
    ) -> Self {
        let outcome = if payload == remote.payload && deleted == remote.deleted {
            ResolutionOutcome::RemoteWins
        } else if payload == local.payload && deleted == local.deleted {
            ResolutionOutcome::LocalWins
        } else {
            ResolutionOutcome::Merged
        };
        let superseded = match outcome {
            ResolutionOutcome::Merged => !conflicting_fields.is_empty(),
            _ => local.payload != remote.payload || local.deleted != remote.deleted,
        };
        Self {
            outcome,
            payload: Some(payload),
            deleted,
            conflicting_fields,
            superseded,
        }
    }
}

/// Reconcile `local` and `remote` under `policy`. Deterministic.
pub fn resolve(
    policy: MergePolicy,
    base: Option<&Payload>,
    local: &RecordVersion,
    remote: &RecordVersion,
) -> Resolution {
    match policy {
        MergePolicy::Manual => Resolution::unresolved(differing_fields(&local.payload, &remote.payload)),
        MergePolicy::LastWriteWins => last_write_wins(local, remote, Vec::new()),
        MergePolicy::FieldMerge if local.deleted || remote.deleted => {
            last_write_wins(local, remote, Vec::new())
        }
        MergePolicy::FieldMerge => field_merge(base, local, remote),
    }
}

fn local_is_newer(local: &RecordVersion, remote: &RecordVersion) -> bool {
    local.modified_at > remote.modified_at
}

fn last_write_wins(
    local: &RecordVersion,
    remote: &RecordVersion,
    conflicting_fields: Vec<String>,
) -> Resolution {
    let winner = if local_is_newer(local, remote) {
        local
    } else {
        remote
    };
    Resolution::settled(
        winner.payload.clone(),
        winner.deleted,
        local,
        remote,
        conflicting_fields,
    )
}

fn field_merge(base: Option<&Payload>, local: &RecordVersion, remote: &RecordVersion) -> Resolution {
    let empty = Payload::new();
    let base_payload = base.unwrap_or(&empty);
    let local_wins_ties = local_is_newer(local, remote);

    let keys = base_payload
        .keys()
        .chain(local.payload.keys())
        .chain(remote.payload.keys())
        .collect::<BTreeSet<_>>();

    let mut merged = Payload::new();
    let mut conflicting = Vec::new();
    for key in keys {
        let base_value = base_payload.get(key);
        let local_value = local.payload.get(key);
        let remote_value = remote.payload.get(key);

        let local_changed = base.is_none() || local_value != base_value;
        let remote_changed = base.is_none() || remote_value != base_value;

        let value = if local_value == remote_value {
            local_value
        } else if local_changed && remote_changed {
            conflicting.push(key.clone());
            if local_wins_ties {
                local_value
            } else {
                remote_value
            }
        } else if local_changed {
            local_value
        } else {
            remote_value
        };

        if let Some(value) = value {
            merged.insert(key.clone(), value.clone());
        }
    }

    Resolution::settled(merged, false, local, remote, conflicting)
}

fn differing_fields(local: &Payload, remote: &Payload) -> Vec<String> {
    local
        .keys()
        .chain(remote.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|key| local.get(*key) != remote.get(*key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn version(value: serde_json::Value, modified_at: i64) -> RecordVersion {
        RecordVersion {
            payload: payload(value),
            revision: None,
            modified_at,
            deleted: false,
        }
    }

    #[test]
    fn disjoint_field_edits_merge_cleanly() {
        let base = payload(json!({"name": "Asha", "phone": "111", "city": "Pune"}));
        let local = version(json!({"name": "Asha", "phone": "222", "city": "Pune"}), 10);
        let remote = version(json!({"name": "Asha", "phone": "111", "city": "Mumbai"}), 20);

        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);

        assert_eq!(resolution.outcome, ResolutionOutcome::Merged);
        assert_eq!(
            resolution.payload,
            Some(payload(json!({"name": "Asha", "phone": "222", "city": "Mumbai"})))
        );
        assert!(resolution.conflicting_fields.is_empty());
        assert!(!resolution.superseded);
    }

    #[test]
    fn same_field_edit_goes_to_later_timestamp_and_keeps_loser() {
        let base = payload(json!({"status": "planned"}));
        let local = version(json!({"status": "arrived"}), 30);
        let remote = version(json!({"status": "cancelled"}), 20);

        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);
        assert_eq!(resolution.outcome, ResolutionOutcome::LocalWins);
        assert_eq!(resolution.payload, Some(local.payload.clone()));
        assert_eq!(resolution.conflicting_fields, vec!["status".to_string()]);
        assert!(resolution.superseded);

        let later_remote = version(json!({"status": "cancelled"}), 40);
        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &later_remote);
        assert_eq!(resolution.outcome, ResolutionOutcome::RemoteWins);
        assert_eq!(resolution.payload, Some(later_remote.payload.clone()));
    }

    #[test]
    fn mixed_edits_merge_and_report_overlap() {
        let base = payload(json!({"a": 1, "b": 1, "c": 1}));
        let local = version(json!({"a": 2, "b": 5, "c": 1}), 10);
        let remote = version(json!({"a": 1, "b": 7, "c": 3}), 20);

        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);

        assert_eq!(resolution.outcome, ResolutionOutcome::Merged);
        assert_eq!(resolution.payload, Some(payload(json!({"a": 2, "b": 7, "c": 3}))));
        assert_eq!(resolution.conflicting_fields, vec!["b".to_string()]);
        assert!(resolution.superseded);
    }

    #[test]
    fn removed_field_counts_as_a_change() {
        let base = payload(json!({"allergy": "penicillin", "weight": 60}));
        let local = version(json!({"weight": 60}), 10);
        let remote = version(json!({"allergy": "penicillin", "weight": 62}), 20);

        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);
        assert_eq!(resolution.payload, Some(payload(json!({"weight": 62}))));
    }

    #[test]
    fn missing_base_treats_every_difference_as_conflict() {
        let local = version(json!({"name": "A", "phone": "1"}), 10);
        let remote = version(json!({"name": "B", "phone": "1"}), 10);

        let resolution = resolve(MergePolicy::FieldMerge, None, &local, &remote);
        // Equal timestamps go to the server
        assert_eq!(resolution.outcome, ResolutionOutcome::RemoteWins);
        assert_eq!(resolution.conflicting_fields, vec!["name".to_string()]);
    }

    #[test]
    fn deletion_falls_back_to_last_write_wins() {
        let base = payload(json!({"name": "A"}));
        let local = version(json!({"name": "B"}), 50);
        let mut remote = version(json!({"name": "A"}), 40);
        remote.deleted = true;

        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);
        assert_eq!(resolution.outcome, ResolutionOutcome::LocalWins);
        assert!(!resolution.deleted);

        remote.modified_at = 60;
        let resolution = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);
        assert_eq!(resolution.outcome, ResolutionOutcome::RemoteWins);
        assert!(resolution.deleted);
    }

    #[test]
    fn last_write_wins_ties_go_remote() {
        let local = version(json!({"name": "local"}), 100);
        let remote = version(json!({"name": "remote"}), 100);

        let resolution = resolve(MergePolicy::LastWriteWins, None, &local, &remote);
        assert_eq!(resolution.outcome, ResolutionOutcome::RemoteWins);
        assert!(resolution.superseded);
    }

    #[test]
    fn manual_policy_leaves_conflict_unresolved() {
        let local = version(json!({"dose": "5mg"}), 10);
        let remote = version(json!({"dose": "10mg"}), 20);

        let resolution = resolve(MergePolicy::Manual, None, &local, &remote);
        assert_eq!(resolution.outcome, ResolutionOutcome::Unresolved);
        assert_eq!(resolution.payload, None);
        assert_eq!(resolution.conflicting_fields, vec!["dose".to_string()]);
    }

    #[test]
    fn resolution_is_deterministic() {
        let base = payload(json!({"x": 1, "y": 1}));
        let local = version(json!({"x": 2, "y": 3}), 10);
        let remote = version(json!({"x": 4, "y": 1}), 10);

        let first = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);
        let second = resolve(MergePolicy::FieldMerge, Some(&base), &local, &remote);
        assert_eq!(first, second);
    }

    #[test]
    fn overrides_parse_and_apply_per_kind() {
        let config = ResolverConfig {
            default_policy: MergePolicy::FieldMerge,
            overrides: ResolverConfig::parse_overrides("encounter=lww, prescription=manual").unwrap(),
        };
        assert_eq!(config.policy_for("encounter"), MergePolicy::LastWriteWins);
        assert_eq!(config.policy_for("prescription"), MergePolicy::Manual);
        assert_eq!(config.policy_for("patient"), MergePolicy::FieldMerge);
        assert!(ResolverConfig::parse_overrides("patient").is_err());
        assert!(ResolverConfig::parse_overrides("patient=newest").is_err());
    }

    #[test]
    fn conflict_state_walks_clean_conflicted_resolved() {
        let state = ConflictState::Clean.advance(ConflictEvent::Settled(ResolutionOutcome::Merged));
        assert_eq!(state, ConflictState::Clean);
        assert_eq!(
            ConflictState::Clean.advance(ConflictEvent::Acknowledged),
            ConflictState::Clean
        );

        let state = ConflictState::Clean.advance(ConflictEvent::Detected);
        assert_eq!(state, ConflictState::Conflicted);
        assert_eq!(
            state.advance(ConflictEvent::Settled(ResolutionOutcome::Unresolved)),
            ConflictState::Conflicted
        );
        assert_eq!(state.advance(ConflictEvent::Acknowledged), ConflictState::Conflicted);

        let state = state.advance(ConflictEvent::Settled(ResolutionOutcome::LocalWins));
        assert_eq!(state, ConflictState::Resolved);
        assert_eq!(state.advance(ConflictEvent::Acknowledged), ConflictState::Clean);
    }
}
