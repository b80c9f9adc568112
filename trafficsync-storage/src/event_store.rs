//! Event store: the persistent replica of the event collection.
//!
//! Holds three tables:
//! - `events`: one row per record id, the JSON body plus change-detection columns
//! - `diff_log`: one row per applied change-set, purged after [`DIFF_LOG_RETENTION`]
//! - `pending_updates`: optimistic local records awaiting confirmation

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::ops::AddAssign;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use trafficsync_types::{EventRecord, SyncVersion};

/// How long diff-log entries are retained before `purge_diff_log` drops them.
pub const DIFF_LOG_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        version INTEGER,
        updated TEXT,
        body TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS diff_log (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        sync_version TEXT NOT NULL,
        applied_at INTEGER NOT NULL,
        added INTEGER NOT NULL,
        updated INTEGER NOT NULL,
        deleted INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_diff_log_applied_at ON diff_log (applied_at);

    CREATE TABLE IF NOT EXISTS pending_updates (
        id TEXT PRIMARY KEY,
        body TEXT NOT NULL,
        base TEXT,
        created_at INTEGER NOT NULL
    );
";

/// A single physical write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert or replace the record with this id.
    Upsert(EventRecord),
    /// Delete the record with this id. Deleting a missing id is a no-op.
    Delete(String),
    /// Drop the pending optimistic entry for this id.
    ClearPending(String),
}

/// An ordered group of writes applied inside one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn upsert(&mut self, record: EventRecord) {
        self.ops.push(WriteOp::Upsert(record));
    }

    pub fn delete(&mut self, id: impl Into<String>) {
        self.ops.push(WriteOp::Delete(id.into()));
    }

    pub fn clear_pending(&mut self, id: impl Into<String>) {
        self.ops.push(WriteOp::ClearPending(id.into()));
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl From<Vec<WriteOp>> for WriteBatch {
    fn from(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }
}

/// Counts of what a batch physically changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub upserted: usize,
    pub deleted: usize,
    /// Deletes that found no row.
    pub missing: usize,
    pub pending_cleared: usize,
}

impl AddAssign for BatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.upserted += other.upserted;
        self.deleted += other.deleted;
        self.missing += other.missing;
        self.pending_cleared += other.pending_cleared;
    }
}

/// One row of the diff log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLogEntry {
    /// Assigned by the store; zero until recorded.
    pub seq: i64,
    pub sync_version: SyncVersion,
    pub applied_at: DateTime<Utc>,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl DiffLogEntry {
    /// Creates an entry ready to be recorded.
    pub fn new(
        sync_version: SyncVersion,
        applied_at: DateTime<Utc>,
        added: usize,
        updated: usize,
        deleted: usize,
    ) -> Self {
        Self {
            seq: 0,
            sync_version,
            applied_at,
            added,
            updated,
            deleted,
        }
    }
}

/// An optimistic local record that the authoritative source has not yet
/// confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    /// The locally written record.
    pub record: EventRecord,
    /// The stored record it replaced, if any. Restored on revert.
    pub base: Option<EventRecord>,
    pub created_at: DateTime<Utc>,
}

/// The persistent event store.
pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!("Opened event store at {} (journal_mode={})", path.as_ref().display(), mode);
        Self::init(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Returns the record with this id.
    pub fn get(&self, id: &str) -> StorageResult<Option<EventRecord>> {
        select_record(&self.conn, id)
    }

    /// Returns true if a record with this id exists.
    pub fn contains(&self, id: &str) -> StorageResult<bool> {
        record_exists(&self.conn, id)
    }

    /// Returns every record, ordered by id.
    pub fn all(&self) -> StorageResult<Vec<EventRecord>> {
        select_all_records(&self.conn)
    }

    /// Returns the number of stored records.
    pub fn count(&self) -> StorageResult<usize> {
        count_records(&self.conn)
    }

    /// Returns the pending optimistic entry for this id.
    pub fn pending(&self, id: &str) -> StorageResult<Option<PendingUpdate>> {
        select_pending(&self.conn, id)
    }

    /// Returns every pending optimistic entry, ordered by id.
    pub fn pending_updates(&self) -> StorageResult<Vec<PendingUpdate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT body, base, created_at FROM pending_updates ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let body: String = row.get(0)?;
            let base: Option<String> = row.get(1)?;
            let created_at: i64 = row.get(2)?;
            Ok((body, base, created_at))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (body, base, created_at) = row?;
            result.push(decode_pending(&body, base.as_deref(), created_at)?);
        }
        Ok(result)
    }

    /// Returns the diff log, oldest first.
    pub fn diff_log(&self) -> StorageResult<Vec<DiffLogEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, sync_version, applied_at, added, updated, deleted FROM diff_log ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            let seq: i64 = row.get(0)?;
            let version: String = row.get(1)?;
            let applied_at: i64 = row.get(2)?;
            let added: i64 = row.get(3)?;
            let updated: i64 = row.get(4)?;
            let deleted: i64 = row.get(5)?;
            Ok((seq, version, applied_at, added, updated, deleted))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (seq, version, applied_at, added, updated, deleted) = row?;
            let sync_version = SyncVersion::parse(&version)
                .map_err(|e| StorageError::InvalidData(format!("invalid sync_version in diff log: {e}")))?;
            result.push(DiffLogEntry {
                seq,
                sync_version,
                applied_at: millis_to_datetime(applied_at)?,
                added: added as usize,
                updated: updated as usize,
                deleted: deleted as usize,
            });
        }
        Ok(result)
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Starts a transaction. Dropping it without `commit` rolls back.
    pub fn transaction(&mut self) -> StorageResult<StoreTransaction<'_>> {
        Ok(StoreTransaction {
            tx: self.conn.transaction()?,
        })
    }

    /// Applies one batch in its own transaction.
    pub fn write_batch(&mut self, batch: &WriteBatch) -> StorageResult<BatchOutcome> {
        let tx = self.transaction()?;
        let outcome = tx.apply_batch(batch)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Physically writes a change-set in a single transaction: added and
    /// updated records are upserted, deleted ids removed.
    pub fn apply_differential(
        &mut self,
        added: &[EventRecord],
        updated: &[EventRecord],
        deleted: &[String],
    ) -> StorageResult<BatchOutcome> {
        let mut batch = WriteBatch::new();
        for record in added.iter().chain(updated) {
            batch.upsert(record.clone());
        }
        for id in deleted {
            batch.delete(id.clone());
        }
        self.write_batch(&batch)
    }

    /// Records an applied change-set, returning its sequence number.
    pub fn record_diff(&self, entry: &DiffLogEntry) -> StorageResult<i64> {
        insert_diff_entry(&self.conn, entry)
    }

    /// Deletes diff-log entries applied before `now - older_than`.
    pub fn purge_diff_log(&self, older_than: Duration) -> StorageResult<usize> {
        let window = chrono::Duration::from_std(older_than)
            .map_err(|e| StorageError::InvalidData(format!("retention window out of range: {e}")))?;
        self.purge_diff_log_before(Utc::now() - window)
    }

    /// Deletes diff-log entries applied before `cutoff`.
    pub fn purge_diff_log_before(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let purged = self.conn.execute(
            "DELETE FROM diff_log WHERE applied_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        info!("Purged {} diff log entries older than {}", purged, cutoff.to_rfc3339());
        Ok(purged)
    }

    /// Writes a local record ahead of confirmation and remembers what it
    /// replaced. Staging the same id twice keeps the original base.
    pub fn stage_optimistic(&mut self, record: &EventRecord) -> StorageResult<PendingUpdate> {
        let tx = self.conn.transaction()?;

        let base = match select_pending(&tx, &record.id)? {
            Some(existing) => existing.base,
            None => select_record(&tx, &record.id)?,
        };
        let pending = PendingUpdate {
            record: record.clone(),
            base,
            created_at: Utc::now(),
        };

        upsert_record(&tx, record)?;
        upsert_pending(&tx, &pending)?;
        tx.commit()?;

        debug!("Staged optimistic update for {}", record.id);
        Ok(pending)
    }

    /// Drops a pending optimistic entry and restores the record it replaced
    /// (or removes the record if it did not exist before).
    pub fn discard_pending(&mut self, id: &str) -> StorageResult<Option<PendingUpdate>> {
        let tx = self.conn.transaction()?;

        let Some(pending) = select_pending(&tx, id)? else {
            return Ok(None);
        };
        match &pending.base {
            Some(base) => upsert_record(&tx, base)?,
            None => {
                delete_record(&tx, id)?;
            }
        }
        delete_pending(&tx, id)?;
        tx.commit()?;

        debug!("Reverted optimistic update for {}", id);
        Ok(Some(pending))
    }
}

/// A write transaction on the event store.
pub struct StoreTransaction<'a> {
    tx: Transaction<'a>,
}

impl StoreTransaction<'_> {
    /// Reads a record, seeing this transaction's own writes.
    pub fn get(&self, id: &str) -> StorageResult<Option<EventRecord>> {
        select_record(&self.tx, id)
    }

    /// Reads a pending entry, seeing this transaction's own writes.
    pub fn pending(&self, id: &str) -> StorageResult<Option<PendingUpdate>> {
        select_pending(&self.tx, id)
    }

    /// Applies the batch's writes in order.
    pub fn apply_batch(&self, batch: &WriteBatch) -> StorageResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for op in batch.ops() {
            match op {
                WriteOp::Upsert(record) => {
                    upsert_record(&self.tx, record)?;
                    outcome.upserted += 1;
                }
                WriteOp::Delete(id) => {
                    if delete_record(&self.tx, id)? {
                        outcome.deleted += 1;
                    } else {
                        outcome.missing += 1;
                    }
                }
                WriteOp::ClearPending(id) => {
                    if delete_pending(&self.tx, id)? {
                        outcome.pending_cleared += 1;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Records an applied change-set within this transaction.
    pub fn record_diff(&self, entry: &DiffLogEntry) -> StorageResult<i64> {
        insert_diff_entry(&self.tx, entry)
    }

    /// Commits every write made through this transaction.
    pub fn commit(self) -> StorageResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    /// Discards every write made through this transaction.
    pub fn rollback(self) -> StorageResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

// ── SQL helpers shared by the store, its transactions and the reader ──

pub(crate) fn select_record(conn: &Connection, id: &str) -> StorageResult<Option<EventRecord>> {
    let body: Option<String> = conn
        .query_row("SELECT body FROM events WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    body.map(|b| decode_record(&b)).transpose()
}

pub(crate) fn select_all_records(conn: &Connection) -> StorageResult<Vec<EventRecord>> {
    let mut stmt = conn.prepare("SELECT body FROM events ORDER BY id")?;
    let bodies = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut result = Vec::new();
    for body in bodies {
        result.push(decode_record(&body?)?);
    }
    Ok(result)
}

pub(crate) fn record_exists(conn: &Connection, id: &str) -> StorageResult<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM events WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn count_records(conn: &Connection) -> StorageResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
    Ok(count as usize)
}

fn upsert_record(conn: &Connection, record: &EventRecord) -> StorageResult<()> {
    let body = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO events (id, version, updated, body) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             version = excluded.version,
             updated = excluded.updated,
             body = excluded.body",
        params![
            record.id,
            record.version.map(|v| v as i64),
            record.updated.map(|t| t.to_rfc3339()),
            body,
        ],
    )?;
    Ok(())
}

fn delete_record(conn: &Connection, id: &str) -> StorageResult<bool> {
    let removed = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

fn select_pending(conn: &Connection, id: &str) -> StorageResult<Option<PendingUpdate>> {
    let row: Option<(String, Option<String>, i64)> = conn
        .query_row(
            "SELECT body, base, created_at FROM pending_updates WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    row.map(|(body, base, created_at)| decode_pending(&body, base.as_deref(), created_at))
        .transpose()
}

fn upsert_pending(conn: &Connection, pending: &PendingUpdate) -> StorageResult<()> {
    let body = serde_json::to_string(&pending.record)?;
    let base = pending.base.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT OR REPLACE INTO pending_updates (id, body, base, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![pending.record.id, body, base, pending.created_at.timestamp_millis()],
    )?;
    Ok(())
}

fn delete_pending(conn: &Connection, id: &str) -> StorageResult<bool> {
    let removed = conn.execute("DELETE FROM pending_updates WHERE id = ?1", params![id])?;
    Ok(removed > 0)
}

fn insert_diff_entry(conn: &Connection, entry: &DiffLogEntry) -> StorageResult<i64> {
    conn.execute(
        "INSERT INTO diff_log (sync_version, applied_at, added, updated, deleted) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.sync_version.to_string(),
            entry.applied_at.timestamp_millis(),
            entry.added as i64,
            entry.updated as i64,
            entry.deleted as i64,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn decode_record(body: &str) -> StorageResult<EventRecord> {
    Ok(serde_json::from_str(body)?)
}

fn decode_pending(body: &str, base: Option<&str>, created_at: i64) -> StorageResult<PendingUpdate> {
    Ok(PendingUpdate {
        record: decode_record(body)?,
        base: base.map(decode_record).transpose()?,
        created_at: millis_to_datetime(created_at)?,
    })
}

fn millis_to_datetime(millis: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StorageError::InvalidData(format!("timestamp out of range: {millis}")))
}
