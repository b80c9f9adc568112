//! The differential sync engine.
//!
//! Applies change-sets to the event store in batches, reconciles them with
//! pending optimistic writes, and records every applied change-set in the
//! diff log. The engine is the store's single writer; it is driven from one
//! thread at a time (see [`crate::worker`]).

use crate::config::{ApplyOptions, ConflictStrategy, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::merge::{differing_fields, merge_records, Resolution};
use crate::report::{ConflictRecord, SyncReport, SyncStats};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info, warn};
use trafficsync_storage::{
    DiffLogEntry, EventStore, PendingUpdate, StorageResult, WriteBatch, WriteOp,
};
use trafficsync_types::{Differential, EventRecord};

/// Which bucket of the differential a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Added,
    Updated,
    Deleted,
}

/// The writes for one logical change. Never split across batches.
#[derive(Debug)]
struct PlannedChange {
    /// Counted in the stats once committed. `None` for bookkeeping-only
    /// changes such as clearing a confirmed pending entry.
    bucket: Option<Bucket>,
    ops: Vec<WriteOp>,
}

/// Everything an apply will do, computed before the first write.
#[derive(Debug, Default)]
struct Plan {
    changes: Vec<PlannedChange>,
    unchanged: usize,
    rejected: usize,
    conflicts: Vec<ConflictRecord>,
    /// Ids the strict strategy refuses to reconcile.
    unresolved: Vec<String>,
}

impl Plan {
    fn push(&mut self, bucket: Option<Bucket>, ops: Vec<WriteOp>) {
        if ops.is_empty() {
            self.unchanged += 1;
        } else {
            self.changes.push(PlannedChange { bucket, ops });
        }
    }

    fn conflict(&mut self, id: &str, strategy: ConflictStrategy, fields: Vec<String>, resolution: Resolution) {
        self.conflicts.push(ConflictRecord {
            id: id.to_string(),
            strategy,
            fields,
            resolution,
        });
    }

    fn base_stats(&self) -> SyncStats {
        SyncStats {
            unchanged: self.unchanged,
            conflicted: self.conflicts.len(),
            rejected: self.rejected,
            ..SyncStats::default()
        }
    }
}

fn batch_of(changes: &[PlannedChange]) -> WriteBatch {
    changes
        .iter()
        .flat_map(|change| change.ops.iter().cloned())
        .collect::<Vec<_>>()
        .into()
}

/// True when `current` already reflects `remote` or a later revision of it.
///
/// Tracked records compare on `updated` and `version`, so a record merged
/// from a newer local edit is not reverted when the same change-set arrives
/// again. Untracked records must match exactly.
fn supersedes(current: &EventRecord, remote: &EventRecord) -> bool {
    if remote.updated.is_none() && remote.version.is_none() {
        return current == remote;
    }
    current.updated >= remote.updated && current.version >= remote.version
}

fn count_committed(stats: &mut SyncStats, changes: &[PlannedChange]) {
    for change in changes {
        match change.bucket {
            Some(Bucket::Added) => stats.added += 1,
            Some(Bucket::Updated) => stats.updated += 1,
            Some(Bucket::Deleted) => stats.deleted += 1,
            None => stats.unchanged += 1,
        }
    }
    stats.batches += 1;
}

/// Applies differentials to an [`EventStore`].
pub struct DifferentialSyncEngine {
    store: EventStore,
    config: SyncConfig,
}

impl DifferentialSyncEngine {
    /// Creates an engine, rejecting a configuration it cannot run with.
    pub fn new(store: EventStore, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Read access to the underlying store.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Applies a differential to the store.
    ///
    /// Applying the same differential twice leaves the store as after the
    /// first apply. With `options.atomic` either every change commits or
    /// none does. Without it, batches commit one by one and a storage
    /// failure reports what had already committed.
    pub fn apply_differential(
        &mut self,
        differential: &Differential,
        options: ApplyOptions,
    ) -> SyncResult<SyncReport> {
        let started = Instant::now();
        let sync_version = differential.sync_version();

        differential
            .check_metadata()
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        if options.validate_first || self.config.validate_integrity {
            self.check_integrity(differential)?;
        }

        let mut retries = 0;
        let strategy = self.config.conflict_strategy;
        let plan = self.with_retry(SyncStats::default(), &mut retries, |store| {
            Self::plan(store, strategy, differential)
        })?;
        if !plan.unresolved.is_empty() {
            warn!(%sync_version, ids = ?plan.unresolved, "Strict conflict strategy rejected differential");
            return Err(SyncError::Conflict {
                ids: plan.unresolved,
            });
        }

        let mut stats = if options.atomic {
            self.commit_atomic(differential, &plan, &mut retries)?
        } else {
            self.commit_incremental(differential, &plan, &mut retries)?
        };
        stats.attempts = retries + 1;
        stats.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        info!(
            %sync_version,
            added = stats.added,
            updated = stats.updated,
            deleted = stats.deleted,
            unchanged = stats.unchanged,
            conflicted = stats.conflicted,
            batches = stats.batches,
            duration_ms = stats.duration_ms,
            "Differential applied"
        );

        Ok(SyncReport {
            success: true,
            sync_version,
            stats,
            conflicts: plan.conflicts,
        })
    }

    /// Writes a local change ahead of confirmation.
    ///
    /// The record is visible to reads immediately and stays pending until a
    /// later differential confirms or overrides it.
    pub fn apply_optimistic(&mut self, record: EventRecord) -> SyncResult<()> {
        if !self.config.enable_optimistic_updates {
            return Err(SyncError::OptimisticDisabled);
        }
        record
            .validate()
            .map_err(|e| SyncError::Validation(e.to_string()))?;
        self.store.stage_optimistic(&record)?;
        debug!(id = %record.id, "Optimistic update staged");
        Ok(())
    }

    /// Drops a pending optimistic change and restores what it replaced.
    ///
    /// Returns `false` when nothing was pending for `id`.
    pub fn revert_optimistic(&mut self, id: &str) -> SyncResult<bool> {
        let reverted = self.store.discard_pending(id)?.is_some();
        if reverted {
            debug!(id, "Optimistic update reverted");
        }
        Ok(reverted)
    }

    /// Ids with unconfirmed optimistic changes, ordered by id.
    pub fn pending_ids(&self) -> SyncResult<Vec<String>> {
        Ok(self
            .store
            .pending_updates()?
            .into_iter()
            .map(|pending| pending.record.id)
            .collect())
    }

    /// Purges diff-log entries older than the retention window.
    ///
    /// Returns the number of entries removed.
    pub fn optimize(&mut self) -> SyncResult<usize> {
        let purged = self.store.purge_diff_log(self.config.retention())?;
        info!(purged, retention_hours = self.config.diff_log_retention_hours, "Diff log optimized");
        Ok(purged)
    }

    // ── Validation ───────────────────────────────────────────────

    fn check_integrity(&self, differential: &Differential) -> SyncResult<()> {
        let overlapping = differential.overlapping_ids();
        if !overlapping.is_empty() {
            return Err(SyncError::Validation(format!(
                "ids appear in more than one bucket: {}",
                overlapping.join(", ")
            )));
        }

        for record in differential.added().iter().chain(differential.updated()) {
            record
                .validate()
                .map_err(|e| SyncError::Validation(e.to_string()))?;
        }
        if differential.deleted().iter().any(|id| id.trim().is_empty()) {
            return Err(SyncError::Validation("deleted id is blank".to_string()));
        }

        let mut unknown = 0;
        for id in differential
            .updated()
            .iter()
            .map(|record| record.id.as_str())
            .chain(differential.deleted().iter().map(String::as_str))
        {
            if !self.store.contains(id)? {
                unknown += 1;
            }
        }
        if unknown > 0 {
            debug!(
                sync_version = %differential.sync_version(),
                unknown,
                "Differential references ids not in the store"
            );
        }
        Ok(())
    }

    // ── Planning ─────────────────────────────────────────────────

    fn plan(store: &EventStore, strategy: ConflictStrategy, differential: &Differential) -> StorageResult<Plan> {
        let mut plan = Plan::default();
        for record in differential.added() {
            Self::plan_upsert(store, strategy, &mut plan, Bucket::Added, record)?;
        }
        for record in differential.updated() {
            Self::plan_upsert(store, strategy, &mut plan, Bucket::Updated, record)?;
        }
        for id in differential.deleted() {
            Self::plan_delete(store, strategy, &mut plan, differential, id)?;
        }
        Ok(plan)
    }

    fn plan_upsert(
        store: &EventStore,
        strategy: ConflictStrategy,
        plan: &mut Plan,
        bucket: Bucket,
        remote: &EventRecord,
    ) -> StorageResult<()> {
        if let Err(e) = remote.validate() {
            warn!(id = %remote.id, "Ignoring malformed record: {}", e);
            plan.rejected += 1;
            return Ok(());
        }

        let current = store.get(&remote.id)?;
        let stored = current.as_ref() == Some(remote);
        let Some(PendingUpdate { record: local, .. }) = store.pending(&remote.id)? else {
            let current_is_newer = current
                .as_ref()
                .is_some_and(|current| supersedes(current, remote));
            let ops = if current_is_newer {
                vec![]
            } else {
                vec![WriteOp::Upsert(remote.clone())]
            };
            plan.push(Some(bucket), ops);
            return Ok(());
        };

        let clear = WriteOp::ClearPending(remote.id.clone());
        if local == *remote {
            // The server confirmed the optimistic write.
            if stored {
                plan.changes.push(PlannedChange { bucket: None, ops: vec![clear] });
            } else {
                plan.push(Some(bucket), vec![WriteOp::Upsert(remote.clone()), clear]);
            }
            return Ok(());
        }

        match strategy {
            ConflictStrategy::Strict => plan.unresolved.push(remote.id.clone()),
            ConflictStrategy::ServerWins => {
                plan.conflict(&remote.id, strategy, differing_fields(&local, remote), Resolution::Remote);
                let mut ops = Vec::with_capacity(2);
                if !stored {
                    ops.push(WriteOp::Upsert(remote.clone()));
                }
                ops.push(clear);
                plan.changes.push(PlannedChange { bucket: Some(bucket), ops });
            }
            ConflictStrategy::ClientWins => {
                plan.conflict(&remote.id, strategy, differing_fields(&local, remote), Resolution::Local);
                let ops = if current.as_ref() == Some(&local) {
                    vec![]
                } else {
                    vec![WriteOp::Upsert(local)]
                };
                plan.push(Some(bucket), ops);
            }
            ConflictStrategy::Merge => {
                let outcome = merge_records(&local, remote);
                if !outcome.conflicting_fields.is_empty() {
                    plan.conflict(&remote.id, strategy, outcome.conflicting_fields, Resolution::Merged);
                }
                let mut ops = Vec::with_capacity(2);
                if current.as_ref() != Some(&outcome.record) {
                    ops.push(WriteOp::Upsert(outcome.record));
                }
                ops.push(clear);
                plan.changes.push(PlannedChange { bucket: Some(bucket), ops });
            }
        }
        Ok(())
    }

    fn plan_delete(
        store: &EventStore,
        strategy: ConflictStrategy,
        plan: &mut Plan,
        differential: &Differential,
        id: &str,
    ) -> StorageResult<()> {
        let Some(pending) = store.pending(id)? else {
            let ops = if store.contains(id)? {
                vec![WriteOp::Delete(id.to_string())]
            } else {
                vec![]
            };
            plan.push(Some(Bucket::Deleted), ops);
            return Ok(());
        };

        let keep_local = match strategy {
            ConflictStrategy::Strict => {
                plan.unresolved.push(id.to_string());
                return Ok(());
            }
            ConflictStrategy::ServerWins => false,
            ConflictStrategy::ClientWins => true,
            ConflictStrategy::Merge => pending.record.updated > Some(differential.timestamp()),
        };

        if keep_local {
            plan.conflict(id, strategy, vec![], Resolution::Local);
            plan.unchanged += 1;
        } else {
            plan.conflict(id, strategy, vec![], Resolution::Remote);
            plan.changes.push(PlannedChange {
                bucket: Some(Bucket::Deleted),
                ops: vec![WriteOp::Delete(id.to_string()), WriteOp::ClearPending(id.to_string())],
            });
        }
        Ok(())
    }

    // ── Writing ──────────────────────────────────────────────────

    /// Every batch and the diff-log entry share one transaction. A failed
    /// attempt rolls back and the whole apply is retried.
    fn commit_atomic(
        &mut self,
        differential: &Differential,
        plan: &Plan,
        retries: &mut u32,
    ) -> SyncResult<SyncStats> {
        let batch_size = self.config.batch_size;
        self.with_retry(SyncStats::default(), retries, |store| {
            let tx = store.transaction()?;
            let mut stats = plan.base_stats();
            for chunk in plan.changes.chunks(batch_size) {
                tx.apply_batch(&batch_of(chunk))?;
                count_committed(&mut stats, chunk);
            }
            tx.record_diff(&DiffLogEntry::new(
                differential.sync_version(),
                Utc::now(),
                stats.added,
                stats.updated,
                stats.deleted,
            ))?;
            tx.commit()?;
            Ok(stats)
        })
    }

    /// Each batch commits on its own. A failed batch is retried alone.
    fn commit_incremental(
        &mut self,
        differential: &Differential,
        plan: &Plan,
        retries: &mut u32,
    ) -> SyncResult<SyncStats> {
        let batch_size = self.config.batch_size;
        let mut stats = plan.base_stats();
        for (index, chunk) in plan.changes.chunks(batch_size).enumerate() {
            let batch = batch_of(chunk);
            self.with_retry(stats, retries, |store| store.write_batch(&batch))?;
            count_committed(&mut stats, chunk);
            debug!(
                sync_version = %differential.sync_version(),
                batch = index + 1,
                changes = chunk.len(),
                "Batch committed"
            );
        }

        let entry = DiffLogEntry::new(
            differential.sync_version(),
            Utc::now(),
            stats.added,
            stats.updated,
            stats.deleted,
        );
        self.with_retry(stats, retries, |store| store.record_diff(&entry))?;
        Ok(stats)
    }

    /// Runs a storage operation, retrying with exponential backoff.
    ///
    /// `applied` is what has already committed; it is reported if every
    /// attempt fails.
    fn with_retry<T>(
        &mut self,
        applied: SyncStats,
        retries: &mut u32,
        mut op: impl FnMut(&mut EventStore) -> StorageResult<T>,
    ) -> SyncResult<T> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op(&mut self.store) {
                Ok(value) => return Ok(value),
                Err(source) if attempts > self.config.max_retries => {
                    warn!(attempts, "Storage operation failed, giving up: {}", source);
                    return Err(SyncError::Storage {
                        attempts,
                        partially_applied: applied.batches > 0,
                        applied,
                        source,
                    });
                }
                Err(source) => {
                    let delay = self.config.backoff_for(attempts - 1);
                    warn!(
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Storage operation failed, retrying: {}",
                        source
                    );
                    std::thread::sleep(delay);
                    *retries += 1;
                }
            }
        }
    }
}
