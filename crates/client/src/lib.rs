//! Worker-node side of the weft sync protocol.

pub mod client;
pub mod error;
pub mod transport;

pub use client::Client;
pub use error::ClientError;
pub use transport::SyncTransport;
