//! Pending-task queue.
//!
//! Tasks wait here until a node dequeues them during a sync. Every queued
//! id appears at most once; an entry can be withdrawn (cancellation, lapsed
//! node reclaiming its own task) or handed out, never both.

use std::collections::VecDeque;

use tokio::sync::{oneshot, Mutex};

use weft_core::{TaskId, TaskRef};

struct Entry {
    id: TaskId,
    task: TaskRef,
    /// Fired when a node takes the entry; blocking submitters wait on it.
    taken: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
pub struct PendingQueue {
    entries: Mutex<VecDeque<Entry>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task at the back.
    pub async fn push(&self, id: TaskId, task: TaskRef) {
        self.entries.lock().await.push_back(Entry {
            id,
            task,
            taken: None,
        });
    }

    /// Append a task and get notified once a node has taken it.
    pub async fn push_and_notify(&self, id: TaskId, task: TaskRef) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.entries.lock().await.push_back(Entry {
            id,
            task,
            taken: Some(tx),
        });
        rx
    }

    /// Put a task back at the front after its node was lost. If the id is
    /// somehow still queued, its payload is replaced instead of duplicated.
    pub async fn requeue(&self, id: TaskId, task: TaskRef) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
            entry.task = task;
            return;
        }
        entries.push_front(Entry {
            id,
            task,
            taken: None,
        });
    }

    /// Hand the oldest entry to a caller without waiting.
    pub async fn try_pop(&self) -> Option<(TaskId, TaskRef)> {
        let entry = self.entries.lock().await.pop_front()?;
        if let Some(taken) = entry.taken {
            let _ = taken.send(());
        }
        Some((entry.id, entry.task))
    }

    /// Remove a queued entry. Returns `false` if it was not queued (already
    /// handed out, or never there).
    pub async fn withdraw(&self, id: TaskId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub async fn contains(&self, id: TaskId) -> bool {
        self.entries.lock().await.iter().any(|e| e.id == id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
