use pretty_assertions::assert_eq;
use std::time::Duration;
use trafficsync_storage::{EventReader, EventStore};
use trafficsync_sync::protocol::{
    ApplyDifferentialRequest, ApplyOptimisticRequest, CalculateDifferentialRequest, OptimizeRequest,
};
use trafficsync_sync::{
    ApplyOptions, DifferentialSyncEngine, ErrorKind, RequestEnvelope, SyncConfig, SyncError,
    SyncRequest, SyncResponse, SyncWorker, SyncWorkerHandle,
};
use trafficsync_types::{Differential, EventRecord};

fn incident(id: &str, version: u64) -> EventRecord {
    EventRecord::new(id).with_version(version).with_field("type", "congestion")
}

fn spawn_worker(config: SyncConfig) -> SyncWorkerHandle {
    let engine = DifferentialSyncEngine::new(EventStore::open_in_memory().unwrap(), config).unwrap();
    SyncWorker::spawn(engine).unwrap()
}

// ── Handle calls ─────────────────────────────────────────────────

#[tokio::test]
async fn calculate_runs_off_the_engine() {
    let worker = spawn_worker(SyncConfig::default());
    let diff = worker
        .calculate_differential(vec![incident("A", 1)], vec![incident("A", 2), incident("B", 1)])
        .await
        .unwrap();
    assert_eq!(diff.added().len(), 1);
    assert_eq!(diff.updated().len(), 1);
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn calculate_error_crosses_boundary() {
    let worker = spawn_worker(SyncConfig::default());
    let err = worker
        .calculate_differential(vec![], vec![incident("A", 1), incident("A", 2)])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Calculation);
}

#[tokio::test]
async fn apply_then_optimize() {
    let worker = spawn_worker(SyncConfig::default());
    let diff = Differential::new(vec![incident("A", 1), incident("B", 1)], vec![], vec![]);
    let report = worker
        .apply_differential(diff, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.stats.added, 2);
    worker.optimize().await.unwrap();
}

#[tokio::test]
async fn optimistic_round_trip() {
    let worker = spawn_worker(SyncConfig::default());
    worker.apply_optimistic(incident("A", 1)).await.unwrap();
    assert_eq!(worker.pending_ids().await.unwrap(), vec!["A".to_string()]);
    assert!(worker.revert_optimistic("A").await.unwrap());
    assert!(worker.pending_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn applies_run_in_submission_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.db");
    let engine = DifferentialSyncEngine::new(EventStore::open(&path).unwrap(), SyncConfig::default()).unwrap();
    let worker = SyncWorker::spawn(engine).unwrap();

    let first = Differential::new(vec![incident("A", 1)], vec![], vec![]);
    let second = Differential::new(vec![], vec![incident("A", 2)], vec![]);
    let (first_version, second_version) = (first.sync_version(), second.sync_version());

    let (a, b) = tokio::join!(
        worker.apply_differential(first, ApplyOptions::default()),
        worker.apply_differential(second, ApplyOptions::default()),
    );
    a.unwrap();
    b.unwrap();
    worker.shutdown().await.unwrap();

    let reader = EventReader::open(&path).unwrap();
    assert_eq!(reader.get("A").unwrap().unwrap().version, Some(2));

    let store = EventStore::open(&path).unwrap();
    let log: Vec<_> = store.diff_log().unwrap().into_iter().map(|e| e.sync_version).collect();
    assert_eq!(log, vec![first_version, second_version]);
}

#[tokio::test]
async fn clones_share_one_engine() {
    let worker = spawn_worker(SyncConfig::default());
    let mut tasks = Vec::new();
    for i in 0..8 {
        let handle = worker.clone();
        tasks.push(tokio::spawn(async move {
            let diff = Differential::new(vec![incident(&format!("ev-{i}"), 1)], vec![], vec![]);
            handle.apply_differential(diff, ApplyOptions::default()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let diff = worker
        .calculate_differential(vec![], vec![])
        .await
        .unwrap();
    assert!(!diff.has_changes());
}

#[tokio::test]
async fn abandoned_call_still_runs() {
    let worker = spawn_worker(SyncConfig::default());
    let diff = Differential::new(vec![incident("A", 1)], vec![], vec![]);

    let _ = tokio::time::timeout(
        Duration::ZERO,
        worker.apply_differential(diff.clone(), ApplyOptions::default()),
    )
    .await;

    let report = worker
        .apply_differential(diff, ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.stats.added, 0);
    assert_eq!(report.stats.unchanged, 1);
}

// ── Shutdown ─────────────────────────────────────────────────────

#[tokio::test]
async fn calls_after_shutdown_fail_with_boundary_error() {
    let worker = spawn_worker(SyncConfig::default());
    let other = worker.clone();
    worker.shutdown().await.unwrap();

    let err = other.optimize().await.unwrap_err();
    assert!(matches!(err, SyncError::Boundary(_)));
    assert_eq!(err.kind(), ErrorKind::Boundary);

    let err = worker.apply_optimistic(incident("A", 1)).await.unwrap_err();
    assert!(matches!(err, SyncError::Boundary(_)));
}

// ── Dispatch ─────────────────────────────────────────────────────

#[tokio::test]
async fn dispatch_routes_requests() {
    let worker = spawn_worker(SyncConfig::default());

    let response = worker
        .dispatch(RequestEnvelope::new(
            1,
            SyncRequest::CalculateDifferential(CalculateDifferentialRequest {
                old: vec![],
                new: vec![incident("A", 1)],
            }),
        ))
        .await;
    assert_eq!(response.request_id, 1);
    let SyncResponse::Differential(diff) = response.response else {
        panic!("expected differential");
    };

    let response = worker
        .dispatch(RequestEnvelope::new(
            2,
            SyncRequest::ApplyDifferential(ApplyDifferentialRequest {
                differential: diff,
                options: ApplyOptions::default(),
            }),
        ))
        .await;
    assert_eq!(response.request_id, 2);
    match response.response {
        SyncResponse::Applied(report) => assert_eq!(report.stats.added, 1),
        other => panic!("expected applied, got {other:?}"),
    }

    let response = worker
        .dispatch(RequestEnvelope::new(
            3,
            SyncRequest::ApplyOptimistic(ApplyOptimisticRequest {
                record: incident("B", 1),
            }),
        ))
        .await;
    assert_eq!(response.response, SyncResponse::Acknowledged);

    let response = worker
        .dispatch(RequestEnvelope::new(4, SyncRequest::Optimize(OptimizeRequest {})))
        .await;
    assert_eq!(response.response, SyncResponse::Optimized);
}

#[tokio::test]
async fn dispatch_reports_errors() {
    let worker = spawn_worker(SyncConfig {
        enable_optimistic_updates: false,
        ..SyncConfig::default()
    });

    let response = worker
        .dispatch(RequestEnvelope::new(
            9,
            SyncRequest::ApplyOptimistic(ApplyOptimisticRequest {
                record: incident("A", 1),
            }),
        ))
        .await;
    assert_eq!(response.request_id, 9);
    assert!(response.response.is_error());
    match response.response {
        SyncResponse::Error(error) => assert_eq!(error.kind, ErrorKind::InvalidRequest),
        other => panic!("expected error, got {other:?}"),
    }

    worker.shutdown().await.unwrap();
    let response = worker
        .dispatch(RequestEnvelope::new(10, SyncRequest::Optimize(OptimizeRequest {})))
        .await;
    match response.response {
        SyncResponse::Error(error) => assert_eq!(error.kind, ErrorKind::Boundary),
        other => panic!("expected error, got {other:?}"),
    }
}
