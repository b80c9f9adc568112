//! Read-only view of a file-backed event store.

use crate::error::StorageResult;
use crate::event_store::{count_records, record_exists, select_all_records, select_record};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use trafficsync_types::EventRecord;

/// A read-only connection to an event store file.
///
/// Opened alongside the store's single writer. SQLite isolation means it
/// never observes the writes of a transaction that has not committed.
pub struct EventReader {
    conn: Connection,
}

impl EventReader {
    /// Opens a reader on an existing store file.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn get(&self, id: &str) -> StorageResult<Option<EventRecord>> {
        select_record(&self.conn, id)
    }

    pub fn contains(&self, id: &str) -> StorageResult<bool> {
        record_exists(&self.conn, id)
    }

    pub fn all(&self) -> StorageResult<Vec<EventRecord>> {
        select_all_records(&self.conn)
    }

    pub fn count(&self) -> StorageResult<usize> {
        count_records(&self.conn)
    }
}
