use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use trafficsync_sync::protocol::{ApplyDifferentialRequest, ErrorResponse, OptimizeRequest};
use trafficsync_sync::{
    ApplyOptions, ConflictStrategy, ErrorKind, RequestEnvelope, ResponseEnvelope, SyncConfig,
    SyncError, SyncRequest, SyncResponse,
};
use trafficsync_types::{Differential, EventRecord};

// ── Requests and responses ───────────────────────────────────────

#[test]
fn request_is_tagged_by_type() {
    let envelope = RequestEnvelope::new(7, SyncRequest::Optimize(OptimizeRequest {}));
    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value, json!({"requestId": 7, "request": {"type": "optimize"}}));
}

#[test]
fn calculate_request_from_json() {
    let raw = json!({
        "requestId": 1,
        "request": {
            "type": "calculate_differential",
            "old": [{"id": "A", "version": 1}],
            "new": [{"id": "A", "version": 2, "severity": "high"}]
        }
    });
    let envelope: RequestEnvelope = serde_json::from_value(raw).unwrap();
    match envelope.request {
        SyncRequest::CalculateDifferential(request) => {
            assert_eq!(request.old, vec![EventRecord::new("A").with_version(1)]);
            assert_eq!(request.new[0].field_str("severity"), Some("high"));
        }
        other => panic!("unexpected request {other:?}"),
    }
}

#[test]
fn apply_request_defaults_options() {
    let diff = Differential::new(vec![EventRecord::new("A")], vec![], vec![]);
    let mut value = serde_json::to_value(SyncRequest::ApplyDifferential(ApplyDifferentialRequest {
        differential: diff.clone(),
        options: ApplyOptions::default(),
    }))
    .unwrap();
    value.as_object_mut().unwrap().remove("options");

    let request: SyncRequest = serde_json::from_value(value).unwrap();
    assert_eq!(
        request,
        SyncRequest::ApplyDifferential(ApplyDifferentialRequest {
            differential: diff,
            options: ApplyOptions {
                atomic: true,
                validate_first: true,
            },
        })
    );
}

#[test]
fn unit_responses() {
    let value = serde_json::to_value(ResponseEnvelope {
        request_id: 3,
        response: SyncResponse::Acknowledged,
    })
    .unwrap();
    assert_eq!(value, json!({"requestId": 3, "response": {"type": "acknowledged"}}));
}

#[test]
fn error_response_carries_kind() {
    let response = SyncResponse::from_error(&SyncError::Conflict {
        ids: vec!["A".to_string(), "B".to_string()],
    });
    assert_eq!(
        response,
        SyncResponse::Error(ErrorResponse {
            kind: ErrorKind::Conflict,
            message: "unresolved conflicts for A, B".to_string(),
        })
    );
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["kind"], "conflict");
}

#[test]
fn unknown_request_type_is_rejected() {
    let result: Result<SyncRequest, _> = serde_json::from_value(json!({"type": "reboot"}));
    assert!(result.is_err());
}

// ── Configuration ────────────────────────────────────────────────

#[test]
fn config_from_partial_json() {
    let config = SyncConfig::from_json(r#"{"conflictStrategy": "client-wins", "batchSize": 10}"#).unwrap();
    assert_eq!(config.conflict_strategy, ConflictStrategy::ClientWins);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.max_retries, 3);
    assert!(config.enable_optimistic_updates);
}

#[test]
fn config_strategy_names() {
    for (name, strategy) in [
        ("server-wins", ConflictStrategy::ServerWins),
        ("client-wins", ConflictStrategy::ClientWins),
        ("merge", ConflictStrategy::Merge),
        ("strict", ConflictStrategy::Strict),
    ] {
        let config = SyncConfig::from_json(&format!(r#"{{"conflictStrategy": "{name}"}}"#)).unwrap();
        assert_eq!(config.conflict_strategy, strategy);
        assert_eq!(strategy.to_string(), name);
    }
}

#[test]
fn config_rejects_bad_values() {
    let err = SyncConfig::from_json(r#"{"conflictStrategy": "newest"}"#).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = SyncConfig::from_json(r#"{"batchSize": 0}"#).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[test]
fn backoff_doubles_and_caps() {
    let config = SyncConfig::default();
    assert_eq!(config.backoff_for(0), Duration::from_millis(100));
    assert_eq!(config.backoff_for(1), Duration::from_millis(200));
    assert_eq!(config.backoff_for(3), Duration::from_millis(800));
    assert_eq!(config.backoff_for(40), Duration::from_secs(30));
    assert_eq!(config.retention(), Duration::from_secs(24 * 3600));
}
