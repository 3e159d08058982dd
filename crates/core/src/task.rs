//! Task abstraction.
//!
//! Applications describe work by implementing [`Task`] on a serde type. The
//! coordinator and nodes only ever handle the type-erased [`TaskRef`], which
//! carries enough to tag, encode and execute the value without knowing its
//! concrete type. Decoding goes the other way through
//! [`TaskRegistry`](crate::registry::TaskRegistry).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, watch};

use crate::error::CodecError;

/// A unit of work that can be shipped to a node, executed there and resumed
/// elsewhere from any checkpoint it emitted.
///
/// Checkpoints are values of the task type itself: resuming after a node
/// failure means running the last checkpoint instead of the original.
#[async_trait]
pub trait Task: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static {
    /// Type tag written next to the payload on the wire.
    const KIND: &'static str;

    /// Whether this state is final. The last checkpoint of a task must
    /// return `true`.
    fn is_done(&self) -> bool;

    /// Execute from the current state, emitting intermediate states on
    /// `checkpoints`. Implementations must observe `cancel` and return
    /// promptly once it fires.
    async fn run(&self, checkpoints: CheckpointSink, cancel: CancelSignal);
}

/// Object-safe view of a [`Task`]. Implemented for every task type.
#[async_trait]
pub trait ErasedTask: fmt::Debug + Send + Sync {
    fn kind(&self) -> &'static str;

    fn done(&self) -> bool;

    /// MessagePack payload, decodable by the decoder registered for `kind()`.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    async fn execute(&self, checkpoints: CheckpointSink, cancel: CancelSignal);

    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a type-erased task or checkpoint.
pub type TaskRef = Arc<dyn ErasedTask>;

#[async_trait]
impl<T: Task> ErasedTask for T {
    fn kind(&self) -> &'static str {
        T::KIND
    }

    fn done(&self) -> bool {
        Task::is_done(self)
    }

    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    async fn execute(&self, checkpoints: CheckpointSink, cancel: CancelSignal) {
        Task::run(self, checkpoints, cancel).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl dyn ErasedTask {
    /// Recover the concrete task type, e.g. to read a checkpoint's fields.
    pub fn downcast_ref<T: Task>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

// ── Checkpoints ──────────────────────────────────────────────────────

/// Where a running task reports its intermediate states.
#[derive(Debug, Clone)]
pub struct CheckpointSink {
    tx: mpsc::Sender<TaskRef>,
}

impl CheckpointSink {
    /// Emit a checkpoint. Waits while the previous one is still unconsumed.
    ///
    /// Returns `false` once nobody is listening any more; the task should
    /// treat that like cancellation.
    pub async fn emit<T: Task>(&self, state: T) -> bool {
        self.emit_ref(Arc::new(state)).await
    }

    pub async fn emit_ref(&self, state: TaskRef) -> bool {
        self.tx.send(state).await.is_ok()
    }
}

/// Create a checkpoint sink and the receiver that drains it.
pub fn checkpoint_channel(capacity: usize) -> (CheckpointSink, mpsc::Receiver<TaskRef>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (CheckpointSink { tx }, rx)
}

// ── Cancellation ─────────────────────────────────────────────────────

/// Owner side of a cooperative cancellation signal.
///
/// Dropping the trigger also counts as cancellation, so a task never
/// outlives the handle that started it.
#[derive(Debug)]
pub struct CancelTrigger {
    tx: watch::Sender<bool>,
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Task side of a cooperative cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Err means the trigger was dropped, which is cancellation too.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

pub fn cancel_pair() -> (CancelTrigger, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelTrigger { tx }, CancelSignal { rx })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Countdown {
        left: u32,
    }

    #[async_trait]
    impl Task for Countdown {
        const KIND: &'static str = "test.countdown";

        fn is_done(&self) -> bool {
            self.left == 0
        }

        async fn run(&self, checkpoints: CheckpointSink, cancel: CancelSignal) {
            let mut left = self.left;
            while left > 0 {
                if cancel.is_cancelled() {
                    return;
                }
                left -= 1;
                if !checkpoints.emit(Countdown { left }).await {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn erased_task_runs_and_downcasts_checkpoints() {
        let task: TaskRef = Arc::new(Countdown { left: 3 });
        assert_eq!(task.kind(), "test.countdown");
        assert!(!task.done());

        let (sink, mut rx) = checkpoint_channel(4);
        let (_trigger, signal) = cancel_pair();
        task.execute(sink, signal).await;

        let mut seen = Vec::new();
        while let Ok(cp) = rx.try_recv() {
            seen.push(cp.downcast_ref::<Countdown>().unwrap().left);
        }
        assert_eq!(seen, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn cancelled_task_stops_early() {
        let task: TaskRef = Arc::new(Countdown { left: 100 });
        let (sink, mut rx) = checkpoint_channel(1);
        let (trigger, signal) = cancel_pair();

        let handle = tokio::spawn(async move { task.execute(sink, signal).await });
        let first = rx.recv().await.unwrap();
        assert_eq!(first.downcast_ref::<Countdown>().unwrap().left, 99);

        trigger.cancel();
        // Drain so a pending emit can complete and observe cancellation.
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should stop after cancel")
            .unwrap();
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_cancel() {
        let (trigger, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        drop(trigger);
        assert!(signal.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("cancelled() should resolve after the trigger is dropped");
    }

    #[test]
    fn encode_uses_named_fields() {
        let bytes = Countdown { left: 7 }.encode().unwrap();
        let back: Countdown = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, Countdown { left: 7 });
    }
}
