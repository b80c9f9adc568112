//! Outcome of applying a differential.

use crate::config::ConflictStrategy;
use crate::merge::Resolution;
use serde::{Deserialize, Serialize};
use trafficsync_types::SyncVersion;

/// Counters for one apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Changes that were already reflected in the store.
    pub unchanged: usize,
    pub conflicted: usize,
    /// Malformed records ignored because validation was off.
    pub rejected: usize,
    /// Batches committed.
    pub batches: usize,
    /// Storage attempts made, including retries.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl SyncStats {
    /// Added, updated and deleted records combined.
    pub fn mutations(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// One reconciled conflict between a pending local change and the
/// confirmed remote state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub strategy: ConflictStrategy,
    /// Payload fields the two sides disagreed on. Empty for deletions.
    pub fields: Vec<String>,
    pub resolution: Resolution,
}

/// Report returned by a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    pub sync_version: SyncVersion,
    pub stats: SyncStats,
    pub conflicts: Vec<ConflictRecord>,
}
