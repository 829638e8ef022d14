//! Client error types.

use portlink_core::{RemoteError, error::INVALID_PAYLOAD};
use portlink_transport::TransportError;
use thiserror::Error;

/// Errors from a single call or subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Channel closed")]
    Closed,

    #[error("Failed to encode input of {operation}: {message}")]
    Encode {
        operation: &'static str,
        message: String,
    },

    #[error("Failed to decode result of {operation}: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },

    #[error("{operation} returned a function where a value was expected")]
    UnexpectedHandle { operation: &'static str },

    #[error("{operation} returned a value where a disposer was expected")]
    ExpectedHandle { operation: &'static str },
}

impl CallError {
    /// The worker's error body, if the worker rejected the request.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the worker rejected the request with `code`.
    #[must_use]
    pub fn is(&self, code: &str) -> bool {
        self.remote().is_some_and(|err| err.is(code))
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Closed,
            TransportError::Remote(err) => Self::Remote(err),
        }
    }
}

impl From<CallError> for RemoteError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::Remote(err) => err,
            CallError::Closed => Self::channel_closed(err.to_string()),
            CallError::Encode { .. }
            | CallError::Decode { .. }
            | CallError::UnexpectedHandle { .. }
            | CallError::ExpectedHandle { .. } => Self::new(INVALID_PAYLOAD, err.to_string()),
        }
    }
}

/// Errors from creating or looking up a client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Registration failed: {0}")]
    Registration(#[from] CallError),

    #[error("Unknown endpoint {0}")]
    UnknownEndpoint(String),
}

#[cfg(test)]
mod tests {
    use portlink_core::{
        ClientId,
        error::{CHANNEL_CLOSED, UNKNOWN_CLIENT},
    };

    use super::*;

    #[test]
    fn transport_errors_convert() {
        assert_eq!(CallError::from(TransportError::Closed), CallError::Closed);

        let err = CallError::from(TransportError::Remote(RemoteError::unknown_client(
            &ClientId::new("c1"),
        )));
        assert!(err.is(UNKNOWN_CLIENT));
        assert_eq!(err.to_string(), "Unknown client c1");
    }

    #[test]
    fn local_failures_keep_their_own_codes() {
        let closed = RemoteError::from(CallError::Closed);
        assert!(closed.is(CHANNEL_CLOSED));
        assert_eq!(closed.message, "Channel closed");

        let decode = RemoteError::from(CallError::Decode {
            operation: "echo",
            message: "expected a string".to_string(),
        });
        assert!(decode.is(INVALID_PAYLOAD));
        assert_eq!(
            decode.message,
            "Failed to decode result of echo: expected a string"
        );

        let handle = RemoteError::from(CallError::ExpectedHandle {
            operation: "subscribeEcho",
        });
        assert!(handle.is(INVALID_PAYLOAD));

        let remote = RemoteError::unknown_client(&ClientId::new("c1"));
        assert_eq!(RemoteError::from(CallError::Remote(remote.clone())), remote);
    }
}
