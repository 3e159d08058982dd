//! Node-side sync loop.
//!
//! The loop first syncs with an empty envelope (none at all before the node
//! has an id), then waits for whichever comes first: a checkpoint from the
//! running task, the resync timer, or shutdown. Checkpoints go out as the
//! next sync's payload; the timer sends a reference to the current task with
//! no state. Each response can start a new task, keep the current one, or
//! leave the node idle.

use std::future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_core::config::ClientConfig;
use weft_core::wire::Assignment;
use weft_core::{
    cancel_pair, checkpoint_channel, CancelTrigger, NodeCapabilities, NodeId, ServerId,
    SyncRequest, SyncResponse, TaskEnvelope, TaskId, TaskRef, TaskRegistry,
};

use crate::error::ClientError;
use crate::transport::SyncTransport;

const CHECKPOINT_BUFFER: usize = 16;

#[derive(Debug, Default, Clone, Copy)]
struct SyncState {
    server_id: Option<ServerId>,
    node_id: Option<NodeId>,
}

pub struct Client {
    config: ClientConfig,
    registry: Arc<TaskRegistry>,
    transport: SyncTransport,
    state: Mutex<SyncState>,
    running: AtomicBool,
}

/// The task this node is executing.
struct ActiveTask {
    id: TaskId,
    cancel: CancelTrigger,
    checkpoints: mpsc::Receiver<TaskRef>,
    handle: JoinHandle<()>,
}

impl ActiveTask {
    fn start(id: TaskId, task: TaskRef) -> Self {
        let (sink, checkpoints) = checkpoint_channel(CHECKPOINT_BUFFER);
        let (cancel, signal) = cancel_pair();
        info!(task_id = %id, kind = task.kind(), "starting task");
        let handle = tokio::spawn(async move { task.execute(sink, signal).await });
        Self {
            id,
            cancel,
            checkpoints,
            handle,
        }
    }

    /// Cancel and wait for the task to return.
    async fn stop(self) {
        let Self {
            id,
            cancel,
            checkpoints,
            handle,
        } = self;
        // Unblocks a task parked on a full checkpoint buffer.
        drop(checkpoints);
        cancel.cancel();
        match handle.await {
            Ok(()) => debug!(task_id = %id, "task stopped"),
            Err(e) => warn!(task_id = %id, error = %e, "task ended abnormally"),
        }
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Client {
    /// The registry must hold every task kind the server may hand out.
    pub fn new(config: ClientConfig, registry: Arc<TaskRegistry>) -> Self {
        let transport = SyncTransport::new(&config.server_url);
        let state = SyncState {
            server_id: None,
            node_id: config.capabilities.node_id,
        };
        Self {
            config,
            registry,
            transport,
            state: Mutex::new(state),
            running: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.state().node_id
    }

    pub fn server_id(&self) -> Option<ServerId> {
        self.state().server_id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run the sync loop until an error or `shutdown` is notified. Use
    /// `notify_one` so a notification sent before the loop waits is kept.
    ///
    /// On return the running task, if any, has been cancelled and joined.
    ///
    /// # Panics
    ///
    /// If another `run` on the same client is still active.
    pub async fn run(&self, shutdown: Option<Arc<Notify>>) -> Result<(), ClientError> {
        if self.running.swap(true, Ordering::AcqRel) {
            panic!("Client::run called while already running");
        }
        let _guard = RunGuard(&self.running);
        // A new run never trusts the old server identity; the server treats
        // the node as returning from a restart and registers it afresh.
        self.state.lock().unwrap_or_else(PoisonError::into_inner).server_id = None;

        let mut active = None;
        let result = self.drive(&mut active, shutdown.as_deref()).await;
        if let Some(task) = active.take() {
            task.stop().await;
        }
        match &result {
            Ok(()) => info!("sync loop stopped"),
            Err(e) => warn!(error = %e, "sync loop failed"),
        }
        result
    }

    async fn drive(
        &self,
        active: &mut Option<ActiveTask>,
        shutdown: Option<&Notify>,
    ) -> Result<(), ClientError> {
        // A node that already has an id must follow the header with an
        // envelope, even if it holds no task.
        let first = self.state().node_id.map(|_| TaskEnvelope::empty());
        let assignment = self.sync(first).await?;
        self.apply(active, assignment).await;

        loop {
            let current = active.as_ref().map(|t| t.id);
            let outgoing = tokio::select! {
                (task_id, checkpoint) = next_checkpoint(active) => {
                    debug!(task_id = %task_id, done = checkpoint.done(), "reporting checkpoint");
                    TaskEnvelope::new(task_id, checkpoint)
                }
                _ = tokio::time::sleep(self.config.resync_interval) => {
                    TaskEnvelope::reference(current)
                }
                _ = wait_for(shutdown) => return Ok(()),
            };

            let assignment = self.sync(Some(outgoing)).await?;
            self.apply(active, assignment).await;
        }
    }

    async fn sync(&self, envelope: Option<TaskEnvelope>) -> Result<Assignment, ClientError> {
        let state = self.state();
        let request = SyncRequest {
            version: self.config.version,
            server_id: state.server_id,
            capabilities: NodeCapabilities {
                node_id: state.node_id,
                ..self.config.capabilities.clone()
            },
        };

        let (response, envelope) = self
            .transport
            .exchange(&request, envelope.as_ref(), &self.registry)
            .await?;

        if response.message == SyncResponse::MUST_UPGRADE || response.version != self.config.version {
            return Err(ClientError::MustUpgrade {
                client_version: self.config.version,
                server_version: response.version,
            });
        }

        if response.node_id != state.node_id {
            info!(
                node_id = ?response.node_id.map(|n| n.0),
                server_id = ?response.server_id.map(|s| s.to_string()),
                "registered with server"
            );
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SyncState {
            server_id: response.server_id,
            node_id: response.node_id,
        };
        debug!(message = %response.message, "synced");

        Ok(envelope.assignment())
    }

    async fn apply(&self, active: &mut Option<ActiveTask>, assignment: Assignment) {
        match assignment {
            Assignment::Start(id, task) => {
                if let Some(old) = active.take() {
                    old.stop().await;
                }
                *active = Some(ActiveTask::start(id, task));
            }
            Assignment::Continue(id) => {
                if active.as_ref().map(|t| t.id) != Some(id) {
                    warn!(task_id = %id, "told to continue a task this node is not running");
                }
            }
            Assignment::Idle => {
                if let Some(old) = active.take() {
                    info!(task_id = %old.id, "no work for this node, stopping task");
                    old.stop().await;
                }
            }
        }
    }

    fn state(&self) -> SyncState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Next checkpoint of the active task. Never resolves when there is no task
/// or it has stopped producing checkpoints.
async fn next_checkpoint(active: &mut Option<ActiveTask>) -> (TaskId, TaskRef) {
    if let Some(task) = active {
        if let Some(checkpoint) = task.checkpoints.recv().await {
            return (task.id, checkpoint);
        }
    }
    future::pending().await
}

async fn wait_for(shutdown: Option<&Notify>) {
    match shutdown {
        Some(notify) => notify.notified().await,
        None => future::pending().await,
    }
}
