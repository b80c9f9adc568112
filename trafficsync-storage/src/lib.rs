//! SQLite storage layer for trafficsync.
//!
//! Provides the persistent replica of the live event collection.
//!
//! # Architecture
//!
//! - Event records are stored as JSON bodies keyed by their id, with the
//!   change-detection columns (`version`, `updated`) extracted
//! - Every applied change-set leaves a row in the diff log, purged after a
//!   retention window
//! - Optimistic local writes are tracked in a pending table until the
//!   authoritative source confirms or overrides them
//! - All writes of one batch (or of one atomic apply) share a transaction
//!
//! The [`EventStore`] is meant to have a single owner that performs every
//! write. Other readers open an [`EventReader`] on the same file and only
//! ever observe committed state.

mod error;
mod event_store;
mod reader;

pub use error::{StorageError, StorageResult};
pub use event_store::{
    BatchOutcome, DiffLogEntry, EventStore, PendingUpdate, StoreTransaction, WriteBatch, WriteOp,
    DIFF_LOG_RETENTION,
};
pub use reader::EventReader;
