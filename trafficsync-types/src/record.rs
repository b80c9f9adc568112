//! Event records: the unit of replication.
//!
//! A record is a live traffic incident as handed over by a provider adapter.
//! The sync core only interprets `id`, `version` and `updated`; every other
//! field is carried as opaque JSON.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys owned by the record envelope. Payload fields may not reuse them.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "version", "updated"];

/// A single event record (traffic incident).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Stable identifier, unique within a collection and within the store.
    pub id: String,

    /// Provider revision counter, if the feed has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    /// Last modification time reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,

    /// Domain payload (location, type, severity, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl EventRecord {
    /// Creates a record with no version, timestamp or payload.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            updated: None,
            fields: Map::new(),
        }
    }

    /// Sets the version.
    #[must_use]
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    /// Sets the `updated` timestamp.
    #[must_use]
    pub fn with_updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = Some(updated);
        self
    }

    /// Adds a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a payload field as a string.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Checks that the record is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidRecord("record id is empty".to_string()));
        }
        if let Some(key) = RESERVED_FIELDS.iter().find(|k| self.fields.contains_key(**k)) {
            return Err(Error::InvalidRecord(format!(
                "record {} redefines reserved field `{key}` in its payload",
                self.id
            )));
        }
        Ok(())
    }

    /// Returns true if this record's `updated` is strictly newer than the
    /// other's. A missing timestamp is older than any present one.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        self.updated > other.updated
    }

    /// Serializes the record to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserializes and validates a record from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let record: Self = serde_json::from_str(json)?;
        record.validate()?;
        Ok(record)
    }
}

/// A raw snapshot entry that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    /// Position in the input array.
    pub index: usize,
    /// Why it was rejected.
    pub reason: String,
}

/// Outcome of parsing a snapshot.
#[derive(Debug, Clone, Default)]
pub struct ParsedRecords {
    pub records: Vec<EventRecord>,
    pub rejected: Vec<RejectedRecord>,
}

/// Parses a snapshot (JSON array of records).
///
/// Malformed entries are collected in `rejected` instead of failing the whole
/// snapshot. Only a top level that is not an array is an error.
pub fn parse_records(json: &str) -> Result<ParsedRecords> {
    let raw: Vec<Value> = serde_json::from_str(json)?;
    let mut parsed = ParsedRecords::default();

    for (index, value) in raw.into_iter().enumerate() {
        let outcome = serde_json::from_value::<EventRecord>(value)
            .map_err(Error::from)
            .and_then(|record| record.validate().map(|()| record));

        match outcome {
            Ok(record) => parsed.records.push(record),
            Err(e) => parsed.rejected.push(RejectedRecord {
                index,
                reason: e.to_string(),
            }),
        }
    }

    Ok(parsed)
}
