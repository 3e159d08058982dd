//! Identities and records exchanged on the sync endpoint.
//!
//! A request body is a [`SyncRequest`] record, followed by an envelope record
//! when the node has been here before. A response body is always a
//! [`SyncResponse`] record followed by an envelope record.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::registry::TaskRegistry;
use crate::task::TaskRef;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Node identity, issued by the server on registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

/// Identity of a logical task, stable across requeues after node loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

/// Randomised per server process; a change tells nodes the server restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Resource hints a node declares about itself. Advisory only: the server
/// records them but does not use them for placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// `None` until the server has assigned an identity.
    pub node_id: Option<NodeId>,
    pub sites: u32,
    pub memory_mb: u64,
    pub cpus: u32,
    /// How long the node expects to stay up, if bounded.
    pub lifetime: Option<Duration>,
}

impl Default for NodeCapabilities {
    fn default() -> Self {
        Self {
            node_id: None,
            sites: 1,
            memory_mb: 0,
            cpus: 1,
            lifetime: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub version: u32,
    /// Server identity seen on the last successful sync, if any.
    pub server_id: Option<ServerId>,
    pub capabilities: NodeCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub version: u32,
    pub server_id: Option<ServerId>,
    pub node_id: Option<NodeId>,
    /// Human-readable status line.
    pub message: String,
}

impl SyncResponse {
    pub const MUST_UPGRADE: &'static str = "must upgrade";
    pub const NEW_TASK: &'static str = "new task";
    pub const NO_WORK: &'static str = "no work to do";
    pub const CONTINUE: &'static str = "work on current task";

    /// Reply to a node speaking another protocol version. Carries no
    /// identities so the node cannot mistake it for a registration.
    pub fn upgrade_required(server_version: u32) -> Self {
        Self {
            version: server_version,
            server_id: None,
            node_id: None,
            message: Self::MUST_UPGRADE.to_string(),
        }
    }
}

// ── Envelopes ────────────────────────────────────────────────────────

/// A task (or checkpoint) paired with its server-assigned identity.
///
/// `task: None` means there is no payload: either "no work" or, when
/// `task_id` is set, "keep working on that task".
#[derive(Debug, Clone, Default)]
pub struct TaskEnvelope {
    pub task_id: Option<TaskId>,
    pub task: Option<TaskRef>,
}

/// What a node should do after a sync, derived from the response envelope.
#[derive(Debug, Clone)]
pub enum Assignment {
    /// Nothing to run. Any running task should be stopped.
    Idle,
    /// Keep running the task with this id; the node already holds its state.
    Continue(TaskId),
    /// Stop whatever is running and start this task from the given state.
    Start(TaskId, TaskRef),
}

impl TaskEnvelope {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(task_id: TaskId, task: TaskRef) -> Self {
        Self {
            task_id: Some(task_id),
            task: Some(task),
        }
    }

    /// An envelope naming a task without carrying its state.
    pub fn reference(task_id: Option<TaskId>) -> Self {
        Self {
            task_id,
            task: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task_id.is_none() && self.task.is_none()
    }

    pub fn assignment(&self) -> Assignment {
        match (self.task_id, &self.task) {
            (Some(id), Some(task)) => Assignment::Start(id, task.clone()),
            (Some(id), None) => Assignment::Continue(id),
            (None, _) => Assignment::Idle,
        }
    }

    pub fn to_record(&self) -> Result<EnvelopeRecord, CodecError> {
        let task = match &self.task {
            Some(task) => Some(TaskRecord {
                kind: task.kind().to_string(),
                payload: task.encode()?,
            }),
            None => None,
        };
        Ok(EnvelopeRecord {
            task_id: self.task_id,
            task,
        })
    }

    pub fn from_record(record: EnvelopeRecord, registry: &TaskRegistry) -> Result<Self, CodecError> {
        let task = match record.task {
            Some(rec) => Some(registry.decode(&rec.kind, &rec.payload)?),
            None => None,
        };
        Ok(Self {
            task_id: record.task_id,
            task,
        })
    }
}

/// Wire form of a task: type tag plus opaque MessagePack payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub kind: String,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Wire form of a [`TaskEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeRecord {
    pub task_id: Option<TaskId>,
    pub task: Option<TaskRecord>,
}

/// Serialize `Vec<u8>` as a MessagePack bin instead of an array of ints.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}
