//! Subagent lifecycle manager.
//!
//! [`SubagentManager`] is the scheduler for child agent runs. It:
//! - records every run in the registry before anything else happens
//! - admits pending runs strictly in submission order, at most C at a time
//!   (via [`SlotPool`])
//! - enforces per-run timeouts (cancel token -> stop grace -> drop)
//! - supports cancellation of pending and running runs
//! - lets a running run lend its slot while it waits on runs it spawned
//! - publishes terminal states to waiters only after they are persisted

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use planloop_core::config::AgentConfig;

use crate::storage::{
    Database, DatabaseError, NewRun, RunStatus, SubagentRun, TIMEOUT_ERROR_PREFIX,
};

use super::pool::{PoolError, SlotPermit, SlotPool};

/// Error recorded for runs a previous process left unfinished.
pub const INTERRUPTED_REASON: &str = "interrupted by restart";

/// Error recorded for a task that panicked.
const PANICKED_REASON: &str = "subagent task panicked";

/// Broadcast channel buffer size for run events.
const RUN_EVENT_CAPACITY: usize = 256;

/// Future produced by a subagent task. `Err` carries the failure message.
pub type TaskFuture = BoxFuture<'static, Result<String, String>>;

/// Work executed for one run. Called once, when the run is promoted; the
/// token fires on timeout or cancellation.
pub type SubagentTask = Box<dyn FnOnce(CancellationToken) -> TaskFuture + Send>;

/// Parameters for submitting a subagent run.
#[derive(Debug, Clone, Default)]
pub struct SubagentRequest {
    /// Run ID (generated when `None`).
    pub id: Option<String>,
    /// Session that spawned the run.
    pub parent_session_id: String,
    /// Short human-readable label.
    pub label: String,
    /// What the subagent is asked to do.
    pub task_description: String,
    /// Per-run timeout (manager default when `None`).
    pub timeout: Option<Duration>,
}

/// Scheduler settings.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    /// Ceiling C on simultaneously running runs.
    pub max_concurrent: usize,
    /// Timeout applied when a request does not carry its own.
    pub default_timeout: Duration,
    /// How long a timed-out or cancelled task may keep running after its
    /// token fires.
    pub stop_grace: Duration,
}

impl From<&AgentConfig> for ManagerSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_subagents,
            default_timeout: config.subagent_timeout(),
            stop_grace: config.stop_grace(),
        }
    }
}

/// Lifecycle transitions, broadcast in the order they are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Queued {
        run_id: String,
        parent_session_id: String,
    },
    Started {
        run_id: String,
    },
    Completed {
        run_id: String,
    },
    Failed {
        run_id: String,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::Queued { run_id, .. }
            | Self::Started { run_id }
            | Self::Completed { run_id }
            | Self::Failed { run_id, .. } => run_id,
        }
    }
}

/// Errors from the subagent manager.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Subagent run not found: {id}")]
    NotFound { id: String },

    #[error("Subagent run already exists: {id}")]
    DuplicateRun { id: String },

    #[error("Timed out after {waited:?} waiting for subagent run {id}")]
    WaitTimeout { id: String, waited: Duration },

    #[error("Subagent manager is shutting down")]
    ShuttingDown,

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// In-memory handle for a run that has not finished its lifecycle yet.
struct RunHandle {
    cancel: CancellationToken,
    status_tx: watch::Sender<RunStatus>,
    /// Held while running, unless lent out via `release_slot`.
    slot: Option<SlotPermit>,
}

/// A pending run waiting in the admission queue.
struct QueuedRun {
    run_id: String,
    task: SubagentTask,
    timeout: Duration,
    cancel: CancellationToken,
}

/// State shared between the manager, its dispatcher, and run tasks.
struct Shared {
    db: Database,
    pool: SlotPool,
    settings: ManagerSettings,
    handles: RwLock<HashMap<String, RunHandle>>,
    events: broadcast::Sender<RunEvent>,
}

/// Bounded-concurrency subagent scheduler backed by the run registry.
pub struct SubagentManager {
    shared: Arc<Shared>,
    queue_tx: mpsc::UnboundedSender<QueuedRun>,
}

impl SubagentManager {
    /// Start a manager: fail runs left over by a previous process, then
    /// spawn the dispatcher. Must be called inside a Tokio runtime.
    pub async fn start(db: Database, settings: ManagerSettings) -> Result<Self, ManagerError> {
        let recovered = db.fail_interrupted_runs(INTERRUPTED_REASON).await?;
        if recovered > 0 {
            warn!(count = recovered, "Marked interrupted subagent runs as failed");
        }

        let (events, _) = broadcast::channel(RUN_EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            db,
            pool: SlotPool::new(settings.max_concurrent),
            settings,
            handles: RwLock::new(HashMap::new()),
            events,
        });

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(Arc::clone(&shared), queue_rx));

        info!(
            max_concurrent = shared.pool.capacity(),
            default_timeout = ?settings.default_timeout,
            "SubagentManager started"
        );

        Ok(Self { shared, queue_tx })
    }

    /// Register a run as `pending` and queue it for admission.
    ///
    /// Returns immediately with the run ID; the task starts once a slot is
    /// free and every earlier submission has been promoted.
    pub async fn submit(
        &self,
        request: SubagentRequest,
        task: SubagentTask,
    ) -> Result<String, ManagerError> {
        if request.task_description.trim().is_empty() {
            return Err(ManagerError::Validation {
                message: "task description must not be empty".to_string(),
            });
        }
        if request.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ManagerError::Validation {
                message: "timeout must be positive".to_string(),
            });
        }

        let run_id = request
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let inserted = self
            .shared
            .db
            .insert_run(&NewRun {
                id: &run_id,
                parent_session_id: &request.parent_session_id,
                label: &request.label,
                task: &request.task_description,
            })
            .await;
        match inserted {
            Ok(_) => {}
            Err(DatabaseError::Conflict(_)) => {
                return Err(ManagerError::DuplicateRun { id: run_id });
            }
            Err(e) => return Err(e.into()),
        }

        let cancel = CancellationToken::new();
        let (status_tx, _) = watch::channel(RunStatus::Pending);
        self.shared.handles.write().await.insert(
            run_id.clone(),
            RunHandle {
                cancel: cancel.clone(),
                status_tx,
                slot: None,
            },
        );

        self.shared.emit(RunEvent::Queued {
            run_id: run_id.clone(),
            parent_session_id: request.parent_session_id.clone(),
        });

        let queued = QueuedRun {
            run_id: run_id.clone(),
            task,
            timeout: request.timeout.unwrap_or(self.shared.settings.default_timeout),
            cancel,
        };
        if self.queue_tx.send(queued).is_err() {
            self.shared.fail(&run_id, "subagent manager shut down").await;
            self.shared.forget(&run_id).await;
            return Err(ManagerError::ShuttingDown);
        }

        info!(
            run_id = %run_id,
            parent_session_id = %request.parent_session_id,
            label = %request.label,
            "Subagent run queued"
        );
        Ok(run_id)
    }

    /// Wait until the run reaches a terminal state, at most `timeout`.
    ///
    /// Calling this on an already-finished run returns the stored record
    /// immediately, however many times it is called.
    pub async fn await_result(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<SubagentRun, ManagerError> {
        let status_rx = self
            .shared
            .handles
            .read()
            .await
            .get(run_id)
            .map(|h| h.status_tx.subscribe());

        if let Some(mut rx) = status_rx {
            let wait = rx.wait_for(RunStatus::is_terminal);
            if tokio::time::timeout(timeout, wait).await.is_err() {
                return Err(ManagerError::WaitTimeout {
                    id: run_id.to_string(),
                    waited: timeout,
                });
            }
        }

        // Terminal states are persisted before they are published.
        self.status(run_id).await
    }

    /// Wait until the run has left `pending` and return the status it moved
    /// to. Returns at once for a run that already started or finished.
    pub async fn await_admission(&self, run_id: &str) -> Result<RunStatus, ManagerError> {
        let status_rx = self
            .shared
            .handles
            .read()
            .await
            .get(run_id)
            .map(|h| h.status_tx.subscribe());

        if let Some(mut rx) = status_rx
            && let Ok(status) = rx.wait_for(|s| *s != RunStatus::Pending).await
        {
            return Ok(*status);
        }
        Ok(self.status(run_id).await?.status)
    }

    /// Give up the slot of a running run while it waits on runs it spawned,
    /// so they can be admitted. Returns whether a slot was released.
    pub async fn release_slot(&self, run_id: &str) -> bool {
        let permit = self
            .shared
            .handles
            .write()
            .await
            .get_mut(run_id)
            .and_then(|h| h.slot.take());
        let released = permit.is_some();
        drop(permit);
        if released {
            debug!(run_id, "Slot lent out while waiting on nested runs");
        }
        released
    }

    /// Take a slot back after [`release_slot`](Self::release_slot). Queues
    /// behind runs already waiting for a slot.
    pub async fn reclaim_slot(&self, run_id: &str) -> Result<(), ManagerError> {
        let permit = self
            .shared
            .pool
            .acquire(run_id)
            .await
            .map_err(|_| ManagerError::ShuttingDown)?;
        let mut handles = self.shared.handles.write().await;
        match handles.get_mut(run_id) {
            Some(handle) if handle.slot.is_none() => {
                handle.slot = Some(permit);
                debug!(run_id, "Slot reclaimed");
            }
            // Run already finished; the permit goes straight back.
            _ => drop(permit),
        }
        Ok(())
    }

    /// Current stored record of a run.
    pub async fn status(&self, run_id: &str) -> Result<SubagentRun, ManagerError> {
        self.shared.db.get_run(run_id).await.map_err(|e| match e {
            DatabaseError::NotFound(_) => ManagerError::NotFound {
                id: run_id.to_string(),
            },
            other => other.into(),
        })
    }

    /// All runs spawned by a parent session, in submission order.
    pub async fn list_by_parent(
        &self,
        parent_session_id: &str,
    ) -> Result<Vec<SubagentRun>, ManagerError> {
        Ok(self.shared.db.list_runs_for_parent(parent_session_id).await?)
    }

    /// Cancel a pending or running run, failing it with `reason`.
    ///
    /// Returns `false` if the run had already finished.
    pub async fn cancel(&self, run_id: &str, reason: &str) -> Result<bool, ManagerError> {
        let transitioned = self.shared.db.mark_run_failed(run_id, reason).await?;
        if !transitioned {
            // Distinguish "already terminal" from "never existed".
            self.status(run_id).await?;
            return Ok(false);
        }

        self.shared.publish(run_id, RunStatus::Failed).await;
        self.shared.emit(RunEvent::Failed {
            run_id: run_id.to_string(),
            error: reason.to_string(),
        });
        if let Some(handle) = self.shared.handles.read().await.get(run_id) {
            handle.cancel.cancel();
        }

        info!(run_id, reason, "Subagent run cancelled");
        Ok(true)
    }

    /// Cancel every live run and stop admitting new ones.
    pub async fn shutdown(&self, reason: &str) {
        self.shared.pool.close();
        let live: Vec<String> = self.shared.handles.read().await.keys().cloned().collect();
        for run_id in live {
            if let Err(e) = self.cancel(&run_id, reason).await {
                warn!(run_id = %run_id, error = %e, "Failed to cancel run during shutdown");
            }
        }
        info!(reason, "SubagentManager shut down");
    }

    /// Subscribe to lifecycle events of all runs.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.shared.events.subscribe()
    }

    /// Number of runs currently holding an execution slot.
    pub fn running_count(&self) -> usize {
        self.shared.pool.in_use()
    }

    /// IDs of runs currently holding an execution slot.
    pub async fn running_ids(&self) -> Vec<String> {
        self.shared.pool.active_ids().await
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.shared.settings
    }
}

impl Shared {
    fn emit(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn publish(&self, run_id: &str, status: RunStatus) {
        if let Some(handle) = self.handles.read().await.get(run_id) {
            handle.status_tx.send_replace(status);
        }
    }

    async fn forget(&self, run_id: &str) {
        self.handles.write().await.remove(run_id);
    }

    /// Persist `running -> completed`, then publish. Returns whether this
    /// call performed the transition.
    async fn complete(&self, run_id: &str, output: &str) -> bool {
        match self.db.mark_run_completed(run_id, output).await {
            Ok(true) => {
                self.publish(run_id, RunStatus::Completed).await;
                self.emit(RunEvent::Completed {
                    run_id: run_id.to_string(),
                });
                info!(run_id, "Subagent run completed");
                true
            }
            Ok(false) => {
                debug!(run_id, "Completion ignored, run already terminal");
                false
            }
            Err(e) => {
                error!(run_id, error = %e, "Failed to record subagent completion");
                false
            }
        }
    }

    /// Persist `pending|running -> failed`, then publish.
    async fn fail(&self, run_id: &str, reason: &str) -> bool {
        match self.db.mark_run_failed(run_id, reason).await {
            Ok(true) => {
                self.publish(run_id, RunStatus::Failed).await;
                self.emit(RunEvent::Failed {
                    run_id: run_id.to_string(),
                    error: reason.to_string(),
                });
                warn!(run_id, reason, "Subagent run failed");
                true
            }
            Ok(false) => {
                debug!(run_id, "Failure ignored, run already terminal");
                false
            }
            Err(e) => {
                error!(run_id, error = %e, "Failed to record subagent failure");
                false
            }
        }
    }
}

/// Admission loop: promotes queued runs one at a time, in queue order,
/// each only after it holds a slot.
async fn dispatch_loop(shared: Arc<Shared>, mut queue_rx: mpsc::UnboundedReceiver<QueuedRun>) {
    while let Some(queued) = queue_rx.recv().await {
        let run_id = queued.run_id.clone();

        if queued.cancel.is_cancelled() {
            debug!(run_id = %run_id, "Skipping cancelled run");
            shared.forget(&run_id).await;
            continue;
        }

        let permit = tokio::select! {
            acquired = shared.pool.acquire(&run_id) => match acquired {
                Ok(permit) => permit,
                Err(PoolError::Closed) => {
                    shared.fail(&run_id, "subagent manager shut down").await;
                    shared.forget(&run_id).await;
                    continue;
                }
            },
            () = queued.cancel.cancelled() => {
                debug!(run_id = %run_id, "Run cancelled while waiting for a slot");
                shared.forget(&run_id).await;
                continue;
            }
        };

        match shared.db.mark_run_running(&run_id).await {
            Ok(true) => {}
            Ok(false) => {
                // Cancelled between dequeue and promotion.
                shared.forget(&run_id).await;
                continue;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to promote subagent run");
                shared.fail(&run_id, &format!("failed to start: {e}")).await;
                shared.forget(&run_id).await;
                continue;
            }
        }

        if let Some(handle) = shared.handles.write().await.get_mut(&run_id) {
            handle.slot = Some(permit);
        }
        shared.publish(&run_id, RunStatus::Running).await;
        shared.emit(RunEvent::Started {
            run_id: run_id.clone(),
        });
        info!(run_id = %run_id, timeout = ?queued.timeout, "Subagent run started");

        tokio::spawn(execute_run(Arc::clone(&shared), queued));
    }

    debug!("Subagent dispatcher stopped");
}

enum Outcome {
    Finished(Result<String, String>),
    TimedOut,
    Cancelled,
}

/// Drive one promoted run to a terminal state, then release its slot.
async fn execute_run(shared: Arc<Shared>, queued: QueuedRun) {
    let QueuedRun {
        run_id,
        task,
        timeout,
        cancel,
    } = queued;

    // The closure itself may panic before it hands back a future.
    let mut fut = match std::panic::catch_unwind(AssertUnwindSafe(|| task(cancel.clone()))) {
        Ok(started) => AssertUnwindSafe(started)
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|_| Err(PANICKED_REASON.to_string())))
            .boxed(),
        Err(_) => futures::future::ready(Err(PANICKED_REASON.to_string())).boxed(),
    };

    let outcome = tokio::select! {
        result = &mut fut => Outcome::Finished(result),
        () = tokio::time::sleep(timeout) => Outcome::TimedOut,
        () = cancel.cancelled() => Outcome::Cancelled,
    };

    let needs_grace = match outcome {
        Outcome::Finished(Ok(output)) => {
            shared.complete(&run_id, &output).await;
            false
        }
        Outcome::Finished(Err(message)) => {
            shared.fail(&run_id, &message).await;
            false
        }
        Outcome::TimedOut => {
            let reason = format!("{TIMEOUT_ERROR_PREFIX} {}ms", timeout.as_millis());
            shared.fail(&run_id, &reason).await;
            cancel.cancel();
            true
        }
        // Already recorded by `cancel`.
        Outcome::Cancelled => true,
    };

    if needs_grace
        && tokio::time::timeout(shared.settings.stop_grace, &mut fut)
            .await
            .is_err()
    {
        warn!(run_id = %run_id, "Subagent task ignored cancellation, dropping it");
    }
    drop(fut);

    // Dropping the handle frees the slot.
    shared.forget(&run_id).await;
    debug!(run_id = %run_id, "Subagent run finished");
}
