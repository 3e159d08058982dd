use thiserror::Error;

/// Errors raised while framing, encoding or decoding protocol records.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("truncated record: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("expected another record but the body ended")]
    MissingRecord,

    #[error("unknown task kind: {0}")]
    UnknownKind(String),

    #[error("task kind '{0}' is already registered")]
    DuplicateKind(&'static str),
}
