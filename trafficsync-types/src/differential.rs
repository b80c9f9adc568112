//! Change-sets between two snapshots of the event collection.

use crate::{Error, EventRecord, Result, SyncVersion};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Derived facts about a change-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifferentialMetadata {
    /// `added.len() + updated.len() + deleted.len()`.
    pub total_changes: usize,
    /// When the change-set was computed.
    pub timestamp: DateTime<Utc>,
    /// Identity of this change-set.
    pub sync_version: SyncVersion,
    /// `total_changes > 0`.
    pub has_changes: bool,
}

/// An immutable change-set: the minimal description of how one snapshot of
/// the collection differs from another.
///
/// Built through [`Differential::new`], the metadata is always consistent
/// with the buckets. A change-set decoded from the worker boundary may not
/// be; see [`Differential::check_metadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Differential {
    added: Vec<EventRecord>,
    updated: Vec<EventRecord>,
    deleted: Vec<String>,
    metadata: DifferentialMetadata,
}

impl Differential {
    /// Creates a change-set stamped with the current time and a fresh version.
    #[must_use]
    pub fn new(added: Vec<EventRecord>, updated: Vec<EventRecord>, deleted: Vec<String>) -> Self {
        Self::new_at(added, updated, deleted, Utc::now(), SyncVersion::new())
    }

    /// Creates a change-set with an explicit timestamp and version.
    #[must_use]
    pub fn new_at(
        added: Vec<EventRecord>,
        updated: Vec<EventRecord>,
        deleted: Vec<String>,
        timestamp: DateTime<Utc>,
        sync_version: SyncVersion,
    ) -> Self {
        let total_changes = added.len() + updated.len() + deleted.len();
        Self {
            added,
            updated,
            deleted,
            metadata: DifferentialMetadata {
                total_changes,
                timestamp,
                sync_version,
                has_changes: total_changes > 0,
            },
        }
    }

    /// Reassembles a change-set from parts without recomputing metadata.
    ///
    /// Used for change-sets received from elsewhere; callers must run
    /// [`Differential::check_metadata`] before trusting it.
    #[must_use]
    pub fn from_parts(
        added: Vec<EventRecord>,
        updated: Vec<EventRecord>,
        deleted: Vec<String>,
        metadata: DifferentialMetadata,
    ) -> Self {
        Self {
            added,
            updated,
            deleted,
            metadata,
        }
    }

    /// An empty change-set.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new())
    }

    pub fn added(&self) -> &[EventRecord] {
        &self.added
    }

    pub fn updated(&self) -> &[EventRecord] {
        &self.updated
    }

    pub fn deleted(&self) -> &[String] {
        &self.deleted
    }

    pub fn metadata(&self) -> &DifferentialMetadata {
        &self.metadata
    }

    pub fn total_changes(&self) -> usize {
        self.metadata.total_changes
    }

    pub fn has_changes(&self) -> bool {
        self.metadata.has_changes
    }

    pub fn sync_version(&self) -> SyncVersion {
        self.metadata.sync_version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.metadata.timestamp
    }

    /// Verifies that the metadata matches the buckets.
    pub fn check_metadata(&self) -> Result<()> {
        let actual = self.added.len() + self.updated.len() + self.deleted.len();
        if self.metadata.total_changes != actual {
            return Err(Error::InconsistentMetadata(format!(
                "totalChanges is {} but buckets hold {actual} entries",
                self.metadata.total_changes
            )));
        }
        if self.metadata.has_changes != (actual > 0) {
            return Err(Error::InconsistentMetadata(format!(
                "hasChanges is {} for {actual} entries",
                self.metadata.has_changes
            )));
        }
        Ok(())
    }

    /// Returns ids that appear in more than one bucket, or more than once in
    /// the same bucket, in first-seen order.
    #[must_use]
    pub fn overlapping_ids(&self) -> Vec<String> {
        let mut seen = HashSet::with_capacity(self.metadata.total_changes);
        let mut reported = HashSet::new();
        let mut overlapping = Vec::new();

        let ids = self
            .added
            .iter()
            .chain(self.updated.iter())
            .map(|r| r.id.as_str())
            .chain(self.deleted.iter().map(String::as_str));

        for id in ids {
            if !seen.insert(id) && reported.insert(id) {
                overlapping.push(id.to_string());
            }
        }
        overlapping
    }

    /// Consumes the change-set, returning its buckets.
    #[must_use]
    pub fn into_parts(self) -> (Vec<EventRecord>, Vec<EventRecord>, Vec<String>) {
        (self.added, self.updated, self.deleted)
    }
}
