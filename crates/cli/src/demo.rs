//! Demonstration task: counts up to a target, one checkpoint per step.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use weft_core::{CancelSignal, CheckpointSink, CodecError, Task, TaskRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tally {
    pub current: u64,
    pub target: u64,
    pub step_delay_ms: u64,
}

#[async_trait]
impl Task for Tally {
    const KIND: &'static str = "weft.demo.tally";

    fn is_done(&self) -> bool {
        self.current >= self.target
    }

    async fn run(&self, checkpoints: CheckpointSink, cancel: CancelSignal) {
        let mut state = self.clone();
        while !state.is_done() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_millis(state.step_delay_ms)) => {}
            }
            state.current += 1;
            if !checkpoints.emit(state.clone()).await {
                return;
            }
        }
    }
}

/// Every task kind this binary can send or run.
pub fn registry() -> Result<TaskRegistry, CodecError> {
    TaskRegistry::new().with::<Tally>()
}
