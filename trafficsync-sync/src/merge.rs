//! Field-level reconciliation of a local optimistic record with the
//! confirmed server record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use trafficsync_types::EventRecord;

/// Which side a conflict was settled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The local optimistic record was kept.
    Local,
    /// The confirmed remote record was applied.
    Remote,
    /// A field-level merge of both was applied.
    Merged,
}

/// Result of merging two versions of the same record.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record: EventRecord,
    /// Payload fields both sides set to different values.
    pub conflicting_fields: Vec<String>,
}

/// Payload fields whose values differ between two records, sorted.
///
/// A field present on only one side counts as differing.
pub fn differing_fields(local: &EventRecord, remote: &EventRecord) -> Vec<String> {
    let keys: BTreeSet<&String> = local.fields.keys().chain(remote.fields.keys()).collect();
    keys.into_iter()
        .filter(|key| local.fields.get(key.as_str()) != remote.fields.get(key.as_str()))
        .cloned()
        .collect()
}

/// Merges `local` into `remote`.
///
/// Fields equal on both sides are kept. A field present on only one side is
/// kept. A field both sides set differently takes the value of the side
/// with the newer `updated`; a missing `updated` is older than any present
/// one, and a tie goes to `remote`. The merged record carries the remote
/// version (falling back to the local one) and the newer of the two
/// timestamps.
pub fn merge_records(local: &EventRecord, remote: &EventRecord) -> MergeOutcome {
    let local_wins = local.is_newer_than(remote);
    let mut merged = remote.clone();
    let mut conflicting_fields = Vec::new();

    for (key, local_value) in &local.fields {
        match remote.fields.get(key) {
            None => {
                merged.fields.insert(key.clone(), local_value.clone());
            }
            Some(remote_value) if remote_value == local_value => {}
            Some(_) => {
                conflicting_fields.push(key.clone());
                if local_wins {
                    merged.fields.insert(key.clone(), local_value.clone());
                }
            }
        }
    }
    conflicting_fields.sort();

    merged.version = remote.version.or(local.version);
    merged.updated = remote.updated.max(local.updated);

    MergeOutcome {
        record: merged,
        conflicting_fields,
    }
}
