//! Sync decision table.
//!
//! Pure functions: nothing here touches coordinator state. The coordinator
//! gathers the facts (request, liveness, what happened to the report) and
//! these functions decide what they mean.

use weft_core::{NodeId, ServerId, SyncRequest, TaskId};

/// Who is calling, derived from the request and the node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// No node id yet. Registers; sends no envelope.
    First,
    /// Has a node id issued by another server incarnation. Registers afresh;
    /// its envelope goes to the recovery feed.
    ServerRestarted { previous: NodeId },
    /// Live node on its regular resync.
    Returning(NodeId),
    /// Node id issued here, but its watchdog already gave up on it.
    /// Registers afresh; its envelope is still read.
    Lapsed(NodeId),
}

impl Arrival {
    /// Whether the request carries an envelope record after the header.
    pub fn expects_report(&self) -> bool {
        !matches!(self, Self::First)
    }

    /// Whether the caller gets a new node id.
    pub fn registers(&self) -> bool {
        !matches!(self, Self::Returning(_))
    }
}

/// Classify a request whose version has already been checked.
pub fn classify(request: &SyncRequest, current: ServerId, is_live: bool) -> Arrival {
    let Some(node_id) = request.capabilities.node_id else {
        return Arrival::First;
    };
    if request.server_id != Some(current) {
        return Arrival::ServerRestarted { previous: node_id };
    }
    if is_live {
        Arrival::Returning(node_id)
    } else {
        Arrival::Lapsed(node_id)
    }
}

/// What became of the envelope a node sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// No envelope expected, or it named no task.
    Nothing,
    /// Handed to the recovery feed.
    Recovered,
    /// Checkpoint forwarded to the task's relay.
    Forwarded { task_id: TaskId, done: bool },
    /// Pure heartbeat for a task the tracker still follows.
    StillTracked(TaskId),
    /// A lapsed node took its own task back out of the queue.
    Reclaimed(TaskId),
    /// Task finished, was cancelled, or is owned elsewhere now.
    Stale,
}

/// What the response tells the node to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep running this task; no payload.
    Continue(TaskId),
    /// Try the queue; a new task or "no work".
    Assign,
}

pub fn dispose(arrival: &Arrival, report: &ReportOutcome) -> Disposition {
    match arrival {
        Arrival::Returning(_) | Arrival::Lapsed(_) => match *report {
            ReportOutcome::Forwarded { task_id, done: false }
            | ReportOutcome::StillTracked(task_id)
            | ReportOutcome::Reclaimed(task_id) => Disposition::Continue(task_id),
            _ => Disposition::Assign,
        },
        Arrival::First | Arrival::ServerRestarted { .. } => Disposition::Assign,
    }
}
