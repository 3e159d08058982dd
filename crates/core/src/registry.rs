//! Explicit task-kind → decoder table.
//!
//! Both ends of the protocol build one of these before serving or
//! connecting. A payload whose kind was never registered fails to decode.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::CodecError;
use crate::task::{Task, TaskRef};

type Decoder = fn(&[u8]) -> Result<TaskRef, CodecError>;

fn decode_as<T: Task>(payload: &[u8]) -> Result<TaskRef, CodecError> {
    let task: T = rmp_serde::from_slice(payload)?;
    Ok(Arc::new(task))
}

/// Maps task type tags to their decoders.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type. Returns error if its kind is already taken.
    pub fn register<T: Task>(&mut self) -> Result<(), CodecError> {
        if self.decoders.contains_key(T::KIND) {
            return Err(CodecError::DuplicateKind(T::KIND));
        }
        self.decoders.insert(T::KIND, decode_as::<T>);
        tracing::debug!(kind = T::KIND, "registered task kind");
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: Task>(mut self) -> Result<Self, CodecError> {
        self.register::<T>()?;
        Ok(self)
    }

    pub fn decode(&self, kind: &str, payload: &[u8]) -> Result<TaskRef, CodecError> {
        let decoder = self
            .decoders
            .get(kind)
            .ok_or_else(|| CodecError::UnknownKind(kind.to_string()))?;
        decoder(payload)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::task::{CancelSignal, CheckpointSink, ErasedTask};

    #[derive(Debug, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    #[async_trait]
    impl Task for Echo {
        const KIND: &'static str = "test.echo";

        fn is_done(&self) -> bool {
            true
        }

        async fn run(&self, _checkpoints: CheckpointSink, _cancel: CancelSignal) {}
    }

    #[test]
    fn register_and_decode() {
        let registry = TaskRegistry::new().with::<Echo>().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("test.echo"));

        let payload = Echo { text: "hi".into() }.encode().unwrap();
        let task = registry.decode("test.echo", &payload).unwrap();
        assert_eq!(task.downcast_ref::<Echo>().unwrap().text, "hi");
    }

    #[test]
    fn duplicate_registration() {
        let mut registry = TaskRegistry::new();
        registry.register::<Echo>().unwrap();
        assert!(matches!(
            registry.register::<Echo>(),
            Err(CodecError::DuplicateKind("test.echo"))
        ));
    }

    #[test]
    fn unknown_kind_fails_to_decode() {
        let registry = TaskRegistry::new();
        let payload = Echo { text: "hi".into() }.encode().unwrap();
        match registry.decode("test.echo", &payload) {
            Err(CodecError::UnknownKind(kind)) => assert_eq!(kind, "test.echo"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let registry = TaskRegistry::new().with::<Echo>().unwrap();
        assert!(matches!(
            registry.decode("test.echo", &[0xc1]),
            Err(CodecError::Deserialization(_))
        ));
    }
}
