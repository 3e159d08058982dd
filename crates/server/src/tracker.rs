//! Task queue and progress tracker.
//!
//! Every submitted task gets a relay: a spawned loop that owns the task's
//! latest checkpoint, forwards progress to the submitter and puts the task
//! back in the queue when its node is lost. The task table only records
//! which ids have a live relay; a report for an id missing from the table
//! belongs to a task that finished or was cancelled.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use weft_core::{TaskId, TaskRef};

use crate::queue::PendingQueue;

const PROGRESS_BUFFER: usize = 16;
const CHECKPOINT_FEED_BUFFER: usize = 64;

/// Message delivered to a task's relay.
enum Progress {
    /// A checkpoint reported by the node running the task.
    Report(TaskRef),
    /// The node running the task went silent. Acked once the task is back
    /// in the queue.
    NodeLost(oneshot::Sender<()>),
}

struct TaskTable {
    next_id: u64,
    progress: HashMap<TaskId, mpsc::Sender<Progress>>,
}

pub struct TaskTracker {
    table: Mutex<TaskTable>,
    queue: PendingQueue,
}

/// Handle returned to whoever submitted a task.
pub struct Submission {
    pub id: TaskId,
    pub checkpoints: CheckpointStream,
    pub cancel: CancelHandle,
}

/// Finite stream of checkpoints for one task. Ends after the checkpoint that
/// satisfies `is_done()`, or after cancellation.
///
/// Holds a bounded backlog. While it is full, intermediate checkpoints are
/// dropped; the final one waits for the reader. Drop the stream if the
/// checkpoints are not wanted.
pub struct CheckpointStream {
    rx: mpsc::Receiver<TaskRef>,
}

impl CheckpointStream {
    pub async fn recv(&mut self) -> Option<TaskRef> {
        self.rx.recv().await
    }
}

impl Stream for CheckpointStream {
    type Item = TaskRef;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<TaskRef>> {
        self.rx.poll_recv(cx)
    }
}

/// Cancels a submitted task. Dropping the handle without calling
/// [`cancel`](Self::cancel) leaves the task running.
pub struct CancelHandle {
    tx: oneshot::Sender<()>,
}

impl CancelHandle {
    pub fn cancel(self) {
        let _ = self.tx.send(());
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(TaskTable {
                next_id: 1,
                progress: HashMap::new(),
            }),
            queue: PendingQueue::new(),
        }
    }

    /// Submit a task for distribution.
    ///
    /// With `block` set this waits until some node has dequeued the task.
    /// Otherwise it returns at once, and cancelling before any node took the
    /// task withdraws it from the queue.
    pub async fn submit(self: &Arc<Self>, task: TaskRef, block: bool) -> Submission {
        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_BUFFER);
        let (out_tx, out_rx) = mpsc::channel(CHECKPOINT_FEED_BUFFER);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let id = {
            let mut table = self.table.lock().await;
            let id = TaskId(table.next_id);
            table.next_id += 1;
            table.progress.insert(id, progress_tx);
            id
        };
        info!(task_id = %id, kind = task.kind(), block, "task submitted");

        let relay = Arc::clone(self);
        let original = task.clone();
        tokio::spawn(async move {
            relay.relay(id, original, progress_rx, cancel_rx, out_tx).await;
        });

        if block {
            let taken = self.queue.push_and_notify(id, task).await;
            // Err only if the entry was dropped without being handed out.
            let _ = taken.await;
        } else {
            self.queue.push(id, task).await;
        }

        Submission {
            id,
            checkpoints: CheckpointStream { rx: out_rx },
            cancel: CancelHandle { tx: cancel_tx },
        }
    }

    async fn relay(
        self: Arc<Self>,
        id: TaskId,
        original: TaskRef,
        mut progress: mpsc::Receiver<Progress>,
        mut cancel: oneshot::Receiver<()>,
        out: mpsc::Sender<TaskRef>,
    ) {
        let mut checkpoint = original;
        let mut cancel_dropped = false;

        loop {
            tokio::select! {
                msg = progress.recv() => match msg {
                    Some(Progress::Report(state)) => {
                        checkpoint = state.clone();
                        if state.done() {
                            self.untrack(id).await;
                            info!(task_id = %id, "task finished");
                            if out.send(state).await.is_err() {
                                debug!(task_id = %id, "checkpoint stream dropped by submitter");
                            }
                            break;
                        }
                        match out.try_send(state) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(task_id = %id, "checkpoint stream full, dropping checkpoint")
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!(task_id = %id, "checkpoint stream dropped by submitter")
                            }
                        }
                    }
                    Some(Progress::NodeLost(ack)) => {
                        warn!(task_id = %id, "node lost, requeueing from last checkpoint");
                        self.queue.requeue(id, checkpoint.clone()).await;
                        let _ = ack.send(());
                    }
                    None => break,
                },
                res = &mut cancel, if !cancel_dropped => match res {
                    Ok(()) => {
                        self.untrack(id).await;
                        let withdrawn = self.queue.withdraw(id).await;
                        info!(task_id = %id, withdrawn, "task cancelled");
                        break;
                    }
                    Err(_) => cancel_dropped = true,
                },
            }
        }
    }

    /// Drop the task from the table. From here on reports for it are stale.
    async fn untrack(&self, id: TaskId) {
        self.table.lock().await.progress.remove(&id);
    }

    /// Forward a checkpoint to the task's relay. Returns `false` when the
    /// task is no longer tracked (finished or cancelled).
    ///
    /// A finished checkpoint untracks the task before it is forwarded, so
    /// any later report for the same id is stale.
    pub async fn report(&self, id: TaskId, checkpoint: TaskRef) -> bool {
        let tx = {
            let mut table = self.table.lock().await;
            if checkpoint.done() {
                table.progress.remove(&id)
            } else {
                table.progress.get(&id).cloned()
            }
        };
        let Some(tx) = tx else {
            return false;
        };
        tx.send(Progress::Report(checkpoint)).await.is_ok()
    }

    /// Tell the relay its node is gone and wait until the task is back in
    /// the queue. No-op for untracked tasks.
    pub async fn node_lost(&self, id: TaskId) {
        let Some(tx) = self.endpoint(id).await else {
            debug!(task_id = %id, "lost node held an untracked task");
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Progress::NodeLost(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Pull the next pending task, if any, without waiting.
    pub async fn try_dequeue(&self) -> Option<(TaskId, TaskRef)> {
        let next = self.queue.try_pop().await;
        if let Some((id, _)) = &next {
            debug!(task_id = %id, "task dequeued");
        }
        next
    }

    /// Take a pending task back out of the queue so the node that lost it
    /// can keep running it. Returns `false` if it was not pending.
    pub async fn reclaim(&self, id: TaskId) -> bool {
        self.queue.withdraw(id).await
    }

    pub async fn is_tracked(&self, id: TaskId) -> bool {
        self.table.lock().await.progress.contains_key(&id)
    }

    pub async fn is_pending(&self, id: TaskId) -> bool {
        self.queue.contains(id).await
    }

    /// Tasks with a live relay, pending or assigned.
    pub async fn tracked(&self) -> usize {
        self.table.lock().await.progress.len()
    }

    pub async fn pending(&self) -> usize {
        self.queue.len().await
    }

    async fn endpoint(&self, id: TaskId) -> Option<mpsc::Sender<Progress>> {
        self.table.lock().await.progress.get(&id).cloned()
    }
}
