//! Engine configuration and per-call apply options.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default number of changes written per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Upper bound for a single retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// How local optimistic state is reconciled with confirmed server state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// The confirmed record replaces the local one.
    #[default]
    ServerWins,
    /// The local record is kept until the server echoes it.
    ClientWins,
    /// Field-level merge, newest `updated` wins per conflicting field.
    Merge,
    /// Any conflict fails the apply.
    Strict,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::ServerWins => "server-wins",
            ConflictStrategy::ClientWins => "client-wins",
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Strict => "strict",
        };
        f.write_str(name)
    }
}

/// Configuration for the differential sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub conflict_strategy: ConflictStrategy,
    /// Allow local writes ahead of confirmation.
    pub enable_optimistic_updates: bool,
    /// Retries after a failed storage attempt before giving up.
    pub max_retries: u32,
    /// Maximum changes written per batch.
    pub batch_size: usize,
    /// Run the integrity check on every apply, not only when requested.
    pub validate_integrity: bool,
    /// Base delay between storage retries, doubled on every retry.
    pub retry_backoff_ms: u64,
    /// How long applied change-sets stay in the diff log.
    pub diff_log_retention_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::ServerWins,
            enable_optimistic_updates: true,
            max_retries: 3,
            batch_size: DEFAULT_BATCH_SIZE,
            validate_integrity: true,
            retry_backoff_ms: 100,
            diff_log_retention_hours: 24,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if self.batch_size == 0 {
            return Err(SyncError::Config("batchSize must be at least 1".to_string()));
        }
        if self.diff_log_retention_hours == 0 {
            return Err(SyncError::Config(
                "diffLogRetentionHours must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The diff-log retention window.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.diff_log_retention_hours.saturating_mul(3600))
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(MAX_BACKOFF)
    }
}

/// Call-scoped options for one apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApplyOptions {
    /// All-or-nothing: every batch shares one transaction.
    pub atomic: bool,
    /// Run the integrity check before any write.
    pub validate_first: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            atomic: true,
            validate_first: true,
        }
    }
}
