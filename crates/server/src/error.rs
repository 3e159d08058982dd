use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use weft_core::CodecError;

/// Failures of a single sync exchange. Each maps to an HTTP status; none of
/// them touch coordinator state beyond the request that raised it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("bad method - must only POST to /sync")]
    BadMethod,

    #[error("could not decode SyncRequest: {0}")]
    BadRequest(#[source] CodecError),

    #[error("could not decode task: {0}")]
    BadTask(#[source] CodecError),

    #[error("could not encode SyncResponse: {0}")]
    Encode(#[source] CodecError),
}

impl SyncError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadMethod | Self::BadRequest(_) | Self::BadTask(_) => StatusCode::BAD_REQUEST,
            Self::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "sync failed");
        } else {
            tracing::debug!(error = %self, "rejected sync request");
        }
        (status, self.to_string()).into_response()
    }
}

/// Failures of the server lifecycle itself.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serve error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("serve task ended abnormally: {0}")]
    Join(#[from] tokio::task::JoinError),
}
