//! Server side of one sync exchange.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use weft_core::{
    NodeId, RecordReader, RecordWriter, ServerId, SyncRequest, SyncResponse, TaskEnvelope, TaskId,
    TaskRegistry,
};

use crate::error::SyncError;
use crate::events::RecoveredTask;
use crate::nodes::{HeartbeatHandle, NodeInfo, NodeRegistry};
use crate::protocol::{classify, dispose, Arrival, Disposition, ReportOutcome};
use crate::tracker::TaskTracker;

/// Point-in-time view of the coordinator, served on `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub version: u32,
    pub server_id: String,
    pub live_nodes: usize,
    pub pending_tasks: usize,
    /// Tracked tasks not waiting in the queue, i.e. held by some node.
    pub in_flight_tasks: usize,
    pub nodes: Vec<NodeInfo>,
}

pub struct Coordinator {
    version: u32,
    server_id: ServerId,
    registry: Arc<TaskRegistry>,
    nodes: Arc<NodeRegistry>,
    tracker: Arc<TaskTracker>,
    recovered: mpsc::Sender<RecoveredTask>,
}

impl Coordinator {
    pub fn new(
        version: u32,
        server_id: ServerId,
        registry: Arc<TaskRegistry>,
        nodes: Arc<NodeRegistry>,
        tracker: Arc<TaskTracker>,
        recovered: mpsc::Sender<RecoveredTask>,
    ) -> Self {
        Self {
            version,
            server_id,
            registry,
            nodes,
            tracker,
            recovered,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn tracker(&self) -> &Arc<TaskTracker> {
        &self.tracker
    }

    pub async fn status(&self) -> StatusReport {
        let pending = self.tracker.pending().await;
        let nodes = self.nodes.nodes().await;
        StatusReport {
            version: self.version,
            server_id: self.server_id.to_string(),
            live_nodes: nodes.len(),
            pending_tasks: pending,
            in_flight_tasks: self.tracker.tracked().await.saturating_sub(pending),
            nodes,
        }
    }

    /// Handle one encoded sync request and produce the encoded response.
    pub async fn handle_sync(&self, body: &[u8]) -> Result<Vec<u8>, SyncError> {
        let mut reader = RecordReader::new(body);
        let request: SyncRequest = reader.read().map_err(SyncError::BadRequest)?;

        if request.version != self.version {
            warn!(
                client_version = request.version,
                server_version = self.version,
                "protocol version mismatch"
            );
            return encode(&SyncResponse::upgrade_required(self.version), &TaskEnvelope::empty());
        }

        let live = match request.capabilities.node_id {
            Some(id) => self.nodes.heartbeat(id).await,
            None => None,
        };
        let arrival = classify(&request, self.server_id, live.is_some());

        let envelope = if arrival.expects_report() {
            reader.read_envelope(&self.registry).map_err(SyncError::BadTask)?
        } else {
            TaskEnvelope::empty()
        };

        let heartbeat = match live {
            Some(handle) if !arrival.registers() => handle,
            _ => {
                let mut caps = request.capabilities.clone();
                caps.node_id = None;
                let (_, handle) = self.nodes.create_node(caps).await;
                handle
            }
        };
        let node_id = heartbeat.node_id();

        let report = self.settle(&arrival, node_id, envelope).await;
        debug!(node_id = %node_id, ?arrival, ?report, "sync classified");

        let (message, outgoing) = match dispose(&arrival, &report) {
            Disposition::Continue(task_id) => {
                (SyncResponse::CONTINUE, TaskEnvelope::reference(Some(task_id)))
            }
            Disposition::Assign => match self.tracker.try_dequeue().await {
                Some((task_id, task)) => {
                    info!(node_id = %node_id, task_id = %task_id, kind = task.kind(), "task assigned");
                    (SyncResponse::NEW_TASK, TaskEnvelope::new(task_id, task))
                }
                None => (SyncResponse::NO_WORK, TaskEnvelope::empty()),
            },
        };

        self.record_assignment(&heartbeat, outgoing.task_id).await;

        let response = SyncResponse {
            version: self.version,
            server_id: Some(self.server_id),
            node_id: Some(node_id),
            message: message.to_string(),
        };
        encode(&response, &outgoing)
    }

    async fn settle(&self, arrival: &Arrival, node_id: NodeId, envelope: TaskEnvelope) -> ReportOutcome {
        let TaskEnvelope { task_id, task } = envelope;
        match *arrival {
            Arrival::First => ReportOutcome::Nothing,

            Arrival::ServerRestarted { previous } => {
                let Some(task) = task else {
                    return ReportOutcome::Nothing;
                };
                info!(
                    node_id = %node_id,
                    previous_node_id = %previous,
                    kind = task.kind(),
                    "node returned from a previous server instance with a task"
                );
                let recovered = RecoveredTask {
                    node_id,
                    previous_task_id: task_id,
                    task,
                };
                match self.recovered.try_send(recovered) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(node_id = %node_id, "recovered-task feed full, dropping task")
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(node_id = %node_id, "no recovered-task observer, dropping task")
                    }
                }
                ReportOutcome::Recovered
            }

            Arrival::Returning(_) => {
                let Some(task_id) = task_id else {
                    return ReportOutcome::Nothing;
                };
                match task {
                    Some(checkpoint) => {
                        let done = checkpoint.done();
                        if self.tracker.report(task_id, checkpoint).await {
                            ReportOutcome::Forwarded { task_id, done }
                        } else {
                            debug!(node_id = %node_id, task_id = %task_id, "stale report");
                            ReportOutcome::Stale
                        }
                    }
                    None => {
                        if self.tracker.is_tracked(task_id).await {
                            ReportOutcome::StillTracked(task_id)
                        } else {
                            debug!(node_id = %node_id, task_id = %task_id, "heartbeat for untracked task");
                            ReportOutcome::Stale
                        }
                    }
                }
            }

            Arrival::Lapsed(previous) => {
                let Some(task_id) = task_id else {
                    return ReportOutcome::Nothing;
                };
                if !self.tracker.reclaim(task_id).await {
                    warn!(
                        node_id = %node_id,
                        previous_node_id = %previous,
                        task_id = %task_id,
                        "lapsed node's task no longer pending, dropping its report"
                    );
                    return ReportOutcome::Stale;
                }
                info!(
                    node_id = %node_id,
                    previous_node_id = %previous,
                    task_id = %task_id,
                    "lapsed node reclaimed its task"
                );
                match task {
                    Some(checkpoint) => {
                        let done = checkpoint.done();
                        if !self.tracker.report(task_id, checkpoint).await {
                            ReportOutcome::Stale
                        } else if done {
                            ReportOutcome::Forwarded { task_id, done }
                        } else {
                            ReportOutcome::Reclaimed(task_id)
                        }
                    }
                    None => ReportOutcome::Reclaimed(task_id),
                }
            }
        }
    }

    /// Tell the node's watchdog what it now holds. If the watchdog expired
    /// in the meantime, the task goes straight back to the queue.
    async fn record_assignment(&self, heartbeat: &HeartbeatHandle, task_id: Option<TaskId>) {
        if heartbeat.beat(task_id).await {
            return;
        }
        let node_id = heartbeat.node_id();
        match task_id {
            Some(task_id) => {
                warn!(node_id = %node_id, task_id = %task_id, "node expired during sync, requeueing");
                self.tracker.node_lost(task_id).await;
            }
            None => debug!(node_id = %node_id, "node expired during sync"),
        }
    }
}

fn encode(response: &SyncResponse, envelope: &TaskEnvelope) -> Result<Vec<u8>, SyncError> {
    let mut writer = RecordWriter::new();
    writer
        .write(response)
        .and_then(|w| w.write_envelope(envelope))
        .map_err(SyncError::Encode)?;
    Ok(writer.finish())
}
