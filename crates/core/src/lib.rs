//! Shared building blocks for the weft task-distribution protocol.
//!
//! - [`task`]: the [`Task`] trait, its type-erased form and the
//!   checkpoint/cancellation plumbing handed to a running task
//! - [`registry`]: explicit task-kind → decoder table
//! - [`wire`]: identities and the records exchanged on `/sync`
//! - [`codec`]: length-prefixed MessagePack record framing
//! - [`config`]: profile-aware environment configuration for both ends

pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod task;
pub mod wire;

pub use codec::{RecordReader, RecordWriter};
pub use config::Config;
pub use error::CodecError;
pub use registry::TaskRegistry;
pub use task::{
    cancel_pair, checkpoint_channel, CancelSignal, CancelTrigger, CheckpointSink, ErasedTask,
    Task, TaskRef,
};
pub use wire::{
    NodeCapabilities, NodeId, ServerId, SyncRequest, SyncResponse, TaskEnvelope, TaskId,
    PROTOCOL_VERSION,
};
