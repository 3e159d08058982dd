//! Coordinator for an elastic pool of worker nodes.
//!
//! Nodes pull tasks over `POST /sync`, report checkpoints on later syncs and
//! are dropped by a per-node watchdog when they go quiet. A dropped node's
//! task goes back to the front of the queue in its last reported state.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod nodes;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod server;
pub mod tracker;

pub use coordinator::{Coordinator, StatusReport};
pub use error::{ServerError, SyncError};
pub use events::{NodeEvent, RecoveredTask};
pub use nodes::NodeInfo;
pub use server::{Feeds, ServeHandle, Server};
pub use tracker::{CancelHandle, CheckpointStream, Submission, TaskTracker};
