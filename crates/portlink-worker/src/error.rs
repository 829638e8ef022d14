//! Handler error types.

use portlink_core::{ClientId, RemoteError};
use thiserror::Error;

/// Errors raised while serving an operation.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Unknown client {0}")]
    UnknownClient(ClientId),

    #[error("Invalid payload for {operation}: {source}")]
    InvalidPayload {
        operation: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Wrap a decode failure for `operation`.
    #[must_use]
    pub fn invalid_payload(operation: &str, source: serde_json::Error) -> Self {
        Self::InvalidPayload {
            operation: operation.to_string(),
            source,
        }
    }
}

impl From<HandlerError> for RemoteError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::UnknownClient(client_id) => Self::unknown_client(&client_id),
            HandlerError::InvalidPayload { .. } => Self::invalid_payload(err.to_string()),
            HandlerError::Remote(err) => err,
            HandlerError::Other(err) => Self::handler(format!("{err:#}")),
        }
    }
}

/// Result type for handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;
