use thiserror::Error;

use weft_core::CodecError;

/// Errors that end a client run loop.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("sync transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("sync codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("must upgrade: client speaks protocol {client_version}, server speaks {server_version}")]
    MustUpgrade { client_version: u32, server_version: u32 },
}

impl ClientError {
    /// A version mismatch is not worth retrying; the binary must change.
    pub fn is_upgrade_required(&self) -> bool {
        matches!(self, Self::MustUpgrade { .. })
    }
}
