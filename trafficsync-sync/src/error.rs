//! Error types for the sync layer.

use crate::calculator::CalculatorError;
use crate::report::SyncStats;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use trafficsync_storage::StorageError;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The change-set is malformed or inconsistent. Nothing was written.
    #[error("validation error: {0}")]
    Validation(String),

    /// The strict conflict strategy met local changes it may not override.
    /// Nothing was written.
    #[error("unresolved conflicts for {}", ids.join(", "))]
    Conflict { ids: Vec<String> },

    /// Storage kept failing after every retry.
    #[error("storage error after {attempts} attempt(s): {source}")]
    Storage {
        attempts: u32,
        /// True when some batches committed before the failure.
        partially_applied: bool,
        /// What had committed when the apply gave up.
        applied: SyncStats,
        #[source]
        source: StorageError,
    },

    /// The worker boundary is unreachable; the worker must be respawned.
    #[error("worker boundary error: {0}")]
    Boundary(String),

    /// The differential calculator rejected its input.
    #[error("calculation error: {0}")]
    Calculation(#[from] CalculatorError),

    /// `apply_optimistic` was called with optimistic updates disabled.
    #[error("optimistic updates are disabled")]
    OptimisticDisabled,

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StorageError> for SyncError {
    fn from(source: StorageError) -> Self {
        SyncError::Storage {
            attempts: 1,
            partially_applied: false,
            applied: SyncStats::default(),
            source,
        }
    }
}

/// Coarse error category carried across the worker boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    Storage,
    Boundary,
    Calculation,
    InvalidRequest,
}

impl SyncError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Storage { .. } => ErrorKind::Storage,
            SyncError::Boundary(_) => ErrorKind::Boundary,
            SyncError::Calculation(_) => ErrorKind::Calculation,
            SyncError::OptimisticDisabled | SyncError::Config(_) | SyncError::Serialization(_) => {
                ErrorKind::InvalidRequest
            }
        }
    }
}
