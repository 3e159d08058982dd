//! Node registry and per-node liveness watchdog.
//!
//! Each registered node gets one watchdog task that owns the node's current
//! task id. Heartbeats reset its timer; when the timer lapses (or the node is
//! evicted) the watchdog hands the held task back to the tracker and removes
//! the node from the table. That removal is the only way a node leaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use weft_core::{NodeCapabilities, NodeId, TaskId};

use crate::events::NodeEvent;
use crate::tracker::TaskTracker;

const HEARTBEAT_BUFFER: usize = 8;

#[derive(Debug)]
enum Heartbeat {
    /// The node synced and now holds this task (or none).
    Assigned(Option<TaskId>),
    Evict,
}

struct NodeEntry {
    heartbeat: mpsc::Sender<Heartbeat>,
    capabilities: NodeCapabilities,
    joined_at: DateTime<Utc>,
}

struct NodeTable {
    next_id: u64,
    nodes: HashMap<NodeId, NodeEntry>,
}

/// Sends heartbeats to one node's watchdog.
#[derive(Debug, Clone)]
pub struct HeartbeatHandle {
    node_id: NodeId,
    tx: mpsc::Sender<Heartbeat>,
}

impl HeartbeatHandle {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Reset the node's liveness timer and record the task it now holds.
    /// Returns `false` if the watchdog already gave up on the node; the
    /// caller then owns `task` and must hand it back.
    pub async fn beat(&self, task: Option<TaskId>) -> bool {
        self.tx.send(Heartbeat::Assigned(task)).await.is_ok()
    }
}

/// Snapshot of a live node, for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub capabilities: NodeCapabilities,
    pub joined_at: DateTime<Utc>,
}

pub struct NodeRegistry {
    table: Mutex<NodeTable>,
    timeout: Duration,
    tracker: Arc<TaskTracker>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeRegistry {
    pub fn new(timeout: Duration, tracker: Arc<TaskTracker>, feed_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(feed_capacity.max(1));
        Self {
            table: Mutex::new(NodeTable {
                next_id: 1,
                nodes: HashMap::new(),
            }),
            timeout,
            tracker,
            events,
        }
    }

    /// Admit a node: allocate its id, announce it and start its watchdog.
    pub async fn create_node(self: &Arc<Self>, capabilities: NodeCapabilities) -> (NodeId, HeartbeatHandle) {
        let (tx, rx) = mpsc::channel(HEARTBEAT_BUFFER);
        let joined_at = Utc::now();

        let node_id = {
            let mut table = self.table.lock().await;
            let node_id = NodeId(table.next_id);
            table.next_id += 1;
            table.nodes.insert(
                node_id,
                NodeEntry {
                    heartbeat: tx.clone(),
                    capabilities: capabilities.clone(),
                    joined_at,
                },
            );
            node_id
        };

        info!(
            node_id = %node_id,
            sites = capabilities.sites,
            cpus = capabilities.cpus,
            memory_mb = capabilities.memory_mb,
            "node joined"
        );
        // No subscribers is fine.
        let _ = self.events.send(NodeEvent::Joined {
            node_id,
            capabilities,
            at: joined_at,
        });

        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.watch(node_id, rx).await });

        (node_id, HeartbeatHandle { node_id, tx })
    }

    async fn watch(self: Arc<Self>, node_id: NodeId, mut rx: mpsc::Receiver<Heartbeat>) {
        let mut current: Option<TaskId> = None;

        let reason = loop {
            match tokio::time::timeout(self.timeout, rx.recv()).await {
                Ok(Some(Heartbeat::Assigned(task))) => {
                    debug!(node_id = %node_id, task_id = ?task.map(|t| t.0), "heartbeat");
                    current = task;
                }
                Ok(Some(Heartbeat::Evict)) => break "evicted",
                Ok(None) => break "channel closed",
                Err(_) => break "timed out",
            }
        };

        // Refuse further beats, but honour the ones already queued so an
        // assignment made just before expiry is not lost.
        rx.close();
        while let Ok(msg) = rx.try_recv() {
            if let Heartbeat::Assigned(task) = msg {
                current = task;
            }
        }

        warn!(node_id = %node_id, task_id = ?current.map(|t| t.0), reason, "node lost");
        if let Some(task_id) = current {
            self.tracker.node_lost(task_id).await;
        }

        self.table.lock().await.nodes.remove(&node_id);
        let _ = self.events.send(NodeEvent::Lost {
            node_id,
            task_id: current,
            at: Utc::now(),
        });
    }

    /// Heartbeat handle of a live node.
    pub async fn heartbeat(&self, node_id: NodeId) -> Option<HeartbeatHandle> {
        let table = self.table.lock().await;
        table.nodes.get(&node_id).map(|entry| HeartbeatHandle {
            node_id,
            tx: entry.heartbeat.clone(),
        })
    }

    pub async fn is_live(&self, node_id: NodeId) -> bool {
        self.table.lock().await.nodes.contains_key(&node_id)
    }

    /// Drop a node as if its watchdog had timed out. Returns `false` if the
    /// node was not live.
    pub async fn evict(&self, node_id: NodeId) -> bool {
        let Some(handle) = self.heartbeat(node_id).await else {
            return false;
        };
        handle.tx.send(Heartbeat::Evict).await.is_ok()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.nodes.is_empty()
    }

    pub async fn nodes(&self) -> Vec<NodeInfo> {
        let table = self.table.lock().await;
        let mut nodes: Vec<NodeInfo> = table
            .nodes
            .iter()
            .map(|(id, entry)| NodeInfo {
                node_id: *id,
                capabilities: entry.capabilities.clone(),
                joined_at: entry.joined_at,
            })
            .collect();
        nodes.sort_by_key(|n| n.node_id);
        nodes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }
}
