//! Serializable messages exchanged with the sync worker.
//!
//! Every request and response is tagged by a `type` field and travels in an
//! envelope carrying the caller's request id, so replies can be matched to
//! requests when the worker sits behind a message channel.

use crate::config::ApplyOptions;
use crate::error::{ErrorKind, SyncError};
use crate::report::SyncReport;
use serde::{Deserialize, Serialize};
use trafficsync_types::{Differential, EventRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculateDifferentialRequest {
    pub old: Vec<EventRecord>,
    pub new: Vec<EventRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyDifferentialRequest {
    pub differential: Differential,
    #[serde(default)]
    pub options: ApplyOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOptimisticRequest {
    pub record: EventRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizeRequest {}

/// A request to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncRequest {
    CalculateDifferential(CalculateDifferentialRequest),
    ApplyDifferential(ApplyDifferentialRequest),
    ApplyOptimistic(ApplyOptimisticRequest),
    Optimize(OptimizeRequest),
}

/// Error payload of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

/// The worker's answer to a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncResponse {
    Differential(Differential),
    Applied(SyncReport),
    Acknowledged,
    Optimized,
    Error(ErrorResponse),
}

impl SyncResponse {
    pub fn from_error(error: &SyncError) -> Self {
        SyncResponse::Error(ErrorResponse {
            kind: error.kind(),
            message: error.to_string(),
        })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SyncResponse::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub request: SyncRequest,
}

impl RequestEnvelope {
    pub fn new(request_id: u64, request: SyncRequest) -> Self {
        Self { request_id, request }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub response: SyncResponse,
}
