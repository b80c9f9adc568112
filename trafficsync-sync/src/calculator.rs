//! Differential calculation between two snapshots of an event collection.
//!
//! The calculator is pure: it reads its inputs, allocates its output, and
//! touches no store or shared state. It is safe to run on any thread,
//! concurrently with an apply.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};
use trafficsync_types::{Differential, EventRecord};

/// Which input snapshot a problem was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Old,
    New,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Snapshot::Old => f.write_str("old"),
            Snapshot::New => f.write_str("new"),
        }
    }
}

/// Errors produced by the calculator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalculatorError {
    /// The same id appears twice within one snapshot.
    #[error("duplicate id `{id}` in {snapshot} snapshot")]
    DuplicateId { id: String, snapshot: Snapshot },
}

/// Default change predicate.
///
/// Records carrying an `updated` timestamp or a `version` are compared on
/// those alone. Records with neither are compared on their full payload.
pub fn has_changed(old: &EventRecord, new: &EventRecord) -> bool {
    let tracked = old.updated.is_some()
        || new.updated.is_some()
        || old.version.is_some()
        || new.version.is_some();
    if tracked {
        old.updated != new.updated || old.version != new.version
    } else {
        old.fields != new.fields
    }
}

/// Computes the change-set that turns `old` into `new`.
///
/// `added` and `updated` follow the order of `new`; `deleted` follows the
/// order of `old`. Malformed records are skipped with a warning.
pub fn calculate_differential(
    old: &[EventRecord],
    new: &[EventRecord],
) -> Result<Differential, CalculatorError> {
    calculate_differential_with(old, new, has_changed)
}

/// Like [`calculate_differential`], with a caller-supplied change predicate.
pub fn calculate_differential_with<F>(
    old: &[EventRecord],
    new: &[EventRecord],
    changed: F,
) -> Result<Differential, CalculatorError>
where
    F: Fn(&EventRecord, &EventRecord) -> bool,
{
    let (old_records, old_index) = index_by_id(old, Snapshot::Old)?;
    let (new_records, new_index) = index_by_id(new, Snapshot::New)?;

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for record in new_records {
        match old_index.get(record.id.as_str()) {
            None => added.push(record.clone()),
            Some(previous) if changed(previous, record) => updated.push(record.clone()),
            Some(_) => {}
        }
    }

    let deleted: Vec<String> = old_records
        .into_iter()
        .filter(|record| !new_index.contains_key(record.id.as_str()))
        .map(|record| record.id.clone())
        .collect();

    let differential = Differential::new(added, updated, deleted);
    debug!(
        sync_version = %differential.sync_version(),
        added = differential.added().len(),
        updated = differential.updated().len(),
        deleted = differential.deleted().len(),
        "Differential calculated"
    );
    Ok(differential)
}

type Indexed<'a> = (Vec<&'a EventRecord>, HashMap<&'a str, &'a EventRecord>);

fn index_by_id(records: &[EventRecord], snapshot: Snapshot) -> Result<Indexed<'_>, CalculatorError> {
    let mut ordered = Vec::with_capacity(records.len());
    let mut index = HashMap::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        if let Err(e) = record.validate() {
            warn!(%snapshot, position, "Skipping malformed record: {}", e);
            continue;
        }
        if index.insert(record.id.as_str(), record).is_some() {
            return Err(CalculatorError::DuplicateId {
                id: record.id.clone(),
                snapshot,
            });
        }
        ordered.push(record);
    }
    Ok((ordered, index))
}
