//! Observer feeds published by the coordinator.

use chrono::{DateTime, Utc};
use serde::Serialize;

use weft_core::{NodeCapabilities, NodeId, TaskId, TaskRef};

/// Pool membership changes, broadcast to every subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NodeEvent {
    Joined {
        node_id: NodeId,
        capabilities: NodeCapabilities,
        at: DateTime<Utc>,
    },
    Lost {
        node_id: NodeId,
        /// Task the node held when it went silent, if any.
        task_id: Option<TaskId>,
        at: DateTime<Utc>,
    },
}

impl NodeEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            Self::Joined { node_id, .. } | Self::Lost { node_id, .. } => *node_id,
        }
    }
}

/// A task reported by a node that synced with a previous incarnation of
/// this server. The coordinator has no record of it; the owner of the feed
/// decides whether to resubmit it.
#[derive(Debug, Clone)]
pub struct RecoveredTask {
    pub node_id: NodeId,
    /// Identity the task had under the previous server.
    pub previous_task_id: Option<TaskId>,
    pub task: TaskRef,
}
