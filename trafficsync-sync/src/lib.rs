//! Differential sync for trafficsync.
//!
//! Keeps a local replica of a live event collection in step with an
//! authoritative feed by exchanging change-sets instead of full snapshots.
//!
//! # Pieces
//!
//! - [`calculate_differential`]: pure diff of two snapshots
//! - [`DifferentialSyncEngine`]: applies change-sets to an [`EventStore`] in
//!   batches, with retry, conflict reconciliation and a diff log
//! - [`SyncWorker`]: runs the engine off the caller's thread behind an async
//!   handle and a serializable request protocol
//!
//! [`EventStore`]: trafficsync_storage::EventStore

pub mod calculator;
pub mod config;
pub mod engine;
pub mod error;
pub mod merge;
pub mod protocol;
pub mod report;
pub mod worker;

pub use calculator::{calculate_differential, calculate_differential_with, has_changed, CalculatorError};
pub use config::{ApplyOptions, ConflictStrategy, SyncConfig};
pub use engine::DifferentialSyncEngine;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use merge::{merge_records, MergeOutcome, Resolution};
pub use protocol::{RequestEnvelope, ResponseEnvelope, SyncRequest, SyncResponse};
pub use report::{ConflictRecord, SyncReport, SyncStats};
pub use worker::{SyncWorker, SyncWorkerHandle};
