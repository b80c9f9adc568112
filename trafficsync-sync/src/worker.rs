//! Off-thread execution boundary for the sync engine.
//!
//! A [`SyncWorker`] owns the engine on a dedicated OS thread and exposes it
//! through a cloneable async [`SyncWorkerHandle`]. Store-touching jobs run
//! one at a time, in the order they were submitted. Differential
//! calculation never touches the store and runs on tokio's blocking pool,
//! so it can overlap an apply.
//!
//! A caller that stops waiting for a reply does not cancel the job; the
//! job still runs and its result is discarded.

use crate::calculator::calculate_differential;
use crate::config::ApplyOptions;
use crate::engine::DifferentialSyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{RequestEnvelope, ResponseEnvelope, SyncRequest, SyncResponse};
use crate::report::SyncReport;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use trafficsync_types::{Differential, EventRecord};

/// Requests buffered between handles and the router.
const REQUEST_QUEUE_DEPTH: usize = 64;

/// Work executed on the engine thread.
enum EngineJob {
    Apply {
        differential: Differential,
        options: ApplyOptions,
        reply: oneshot::Sender<SyncResult<SyncReport>>,
    },
    ApplyOptimistic {
        record: EventRecord,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    RevertOptimistic {
        id: String,
        reply: oneshot::Sender<SyncResult<bool>>,
    },
    PendingIds {
        reply: oneshot::Sender<SyncResult<Vec<String>>>,
    },
    Optimize {
        reply: oneshot::Sender<SyncResult<()>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum WorkerRequest {
    Calculate {
        old: Vec<EventRecord>,
        new: Vec<EventRecord>,
        reply: oneshot::Sender<SyncResult<Differential>>,
    },
    Engine(EngineJob),
}

/// Spawns the engine thread and the request router.
pub struct SyncWorker;

impl SyncWorker {
    /// Moves `engine` onto its own thread and returns a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(engine: DifferentialSyncEngine) -> SyncResult<SyncWorkerHandle> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (job_tx, job_rx) = mpsc::unbounded_channel();

        std::thread::Builder::new()
            .name("trafficsync-engine".to_string())
            .spawn(move || run_engine(engine, job_rx))
            .map_err(|e| SyncError::Boundary(format!("failed to start engine thread: {e}")))?;
        tokio::spawn(route_requests(request_rx, job_tx));

        info!("Sync worker started");
        Ok(SyncWorkerHandle {
            requests: request_tx,
        })
    }
}

async fn route_requests(
    mut requests: mpsc::Receiver<WorkerRequest>,
    jobs: mpsc::UnboundedSender<EngineJob>,
) {
    while let Some(request) = requests.recv().await {
        match request {
            WorkerRequest::Calculate { old, new, reply } => {
                tokio::task::spawn_blocking(move || {
                    let result = calculate_differential(&old, &new).map_err(SyncError::from);
                    if reply.send(result).is_err() {
                        debug!("Caller stopped waiting for differential calculation");
                    }
                });
            }
            WorkerRequest::Engine(job) => {
                let stopping = matches!(job, EngineJob::Shutdown { .. });
                if jobs.send(job).is_err() {
                    warn!("Engine thread is gone, closing worker");
                    break;
                }
                if stopping {
                    break;
                }
            }
        }
    }
    debug!("Worker router stopped");
}

fn run_engine(mut engine: DifferentialSyncEngine, mut jobs: mpsc::UnboundedReceiver<EngineJob>) {
    debug!("Engine thread started");
    while let Some(job) = jobs.blocking_recv() {
        let delivered = match job {
            EngineJob::Apply {
                differential,
                options,
                reply,
            } => reply
                .send(engine.apply_differential(&differential, options))
                .is_ok(),
            EngineJob::ApplyOptimistic { record, reply } => {
                reply.send(engine.apply_optimistic(record)).is_ok()
            }
            EngineJob::RevertOptimistic { id, reply } => {
                reply.send(engine.revert_optimistic(&id)).is_ok()
            }
            EngineJob::PendingIds { reply } => reply.send(engine.pending_ids()).is_ok(),
            EngineJob::Optimize { reply } => reply.send(engine.optimize().map(|_| ())).is_ok(),
            EngineJob::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
        };
        if !delivered {
            debug!("Caller stopped waiting; result discarded");
        }
    }
    info!("Sync worker stopped");
}

/// Async handle to a running [`SyncWorker`]. Cheap to clone.
#[derive(Clone)]
pub struct SyncWorkerHandle {
    requests: mpsc::Sender<WorkerRequest>,
}

impl SyncWorkerHandle {
    pub async fn calculate_differential(
        &self,
        old: Vec<EventRecord>,
        new: Vec<EventRecord>,
    ) -> SyncResult<Differential> {
        self.call(|reply| WorkerRequest::Calculate { old, new, reply })
            .await
    }

    pub async fn apply_differential(
        &self,
        differential: Differential,
        options: ApplyOptions,
    ) -> SyncResult<SyncReport> {
        self.call(|reply| {
            WorkerRequest::Engine(EngineJob::Apply {
                differential,
                options,
                reply,
            })
        })
        .await
    }

    pub async fn apply_optimistic(&self, record: EventRecord) -> SyncResult<()> {
        self.call(|reply| WorkerRequest::Engine(EngineJob::ApplyOptimistic { record, reply }))
            .await
    }

    pub async fn revert_optimistic(&self, id: impl Into<String>) -> SyncResult<bool> {
        let id = id.into();
        self.call(|reply| WorkerRequest::Engine(EngineJob::RevertOptimistic { id, reply }))
            .await
    }

    pub async fn pending_ids(&self) -> SyncResult<Vec<String>> {
        self.call(|reply| WorkerRequest::Engine(EngineJob::PendingIds { reply }))
            .await
    }

    /// Purges expired diff-log entries.
    pub async fn optimize(&self) -> SyncResult<()> {
        self.call(|reply| WorkerRequest::Engine(EngineJob::Optimize { reply }))
            .await
    }

    /// Stops the worker after every job submitted before it has run.
    ///
    /// Later calls on any clone of this handle fail with
    /// [`SyncError::Boundary`].
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (reply, response) = oneshot::channel();
        self.submit(WorkerRequest::Engine(EngineJob::Shutdown { reply }))
            .await?;
        response
            .await
            .map_err(|_| SyncError::Boundary("worker stopped before acknowledging shutdown".to_string()))
    }

    /// True once the worker no longer accepts requests.
    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Executes a serialized request and wraps the outcome in a response
    /// envelope carrying the same request id.
    pub async fn dispatch(&self, envelope: RequestEnvelope) -> ResponseEnvelope {
        let request_id = envelope.request_id;
        let result = match envelope.request {
            SyncRequest::CalculateDifferential(request) => self
                .calculate_differential(request.old, request.new)
                .await
                .map(SyncResponse::Differential),
            SyncRequest::ApplyDifferential(request) => self
                .apply_differential(request.differential, request.options)
                .await
                .map(SyncResponse::Applied),
            SyncRequest::ApplyOptimistic(request) => self
                .apply_optimistic(request.record)
                .await
                .map(|()| SyncResponse::Acknowledged),
            SyncRequest::Optimize(_) => self.optimize().await.map(|()| SyncResponse::Optimized),
        };
        let response = result.unwrap_or_else(|e| {
            warn!(request_id, "Request failed: {}", e);
            SyncResponse::from_error(&e)
        });
        ResponseEnvelope {
            request_id,
            response,
        }
    }

    async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<SyncResult<T>>) -> WorkerRequest,
    ) -> SyncResult<T> {
        let (reply, response) = oneshot::channel();
        self.submit(request(reply)).await?;
        response
            .await
            .map_err(|_| SyncError::Boundary("worker dropped the request".to_string()))?
    }

    async fn submit(&self, request: WorkerRequest) -> SyncResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| SyncError::Boundary("worker is not running".to_string()))
    }
}
