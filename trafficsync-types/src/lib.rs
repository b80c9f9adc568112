//! Core type definitions for trafficsync.
//!
//! This crate defines the plain data types shared by the store, the sync
//! engine and the worker boundary:
//! - Event records (live traffic incidents) keyed by a stable string id
//! - Change-sets (`Differential`) describing added / updated / deleted records
//! - Time-ordered sync version identifiers (UUID v7)
//!
//! Provider-specific payload mapping is not done here. Records arrive already
//! in the canonical shape; the only thing checked is that they are well formed.

mod differential;
mod ids;
mod record;

pub use differential::{Differential, DifferentialMetadata};
pub use ids::SyncVersion;
pub use record::{parse_records, EventRecord, ParsedRecords, RejectedRecord, RESERVED_FIELDS};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("inconsistent differential metadata: {0}")]
    InconsistentMetadata(String),
}
