//! Transport error types.

use portlink_core::RemoteError;

/// Errors surfaced by a port endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl TransportError {
    /// The remote error body, if the other side rejected the request.
    #[must_use]
    pub const fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(err) => Some(err),
            Self::Closed => None,
        }
    }
}
