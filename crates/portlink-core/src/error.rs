//! Error body carried by rejected replies and subscription errors.

use serde::{Deserialize, Serialize};

use crate::ClientId;

// ── Error code constants ────────────────────────────────────────────

/// Call or subscription referenced a client with no record.
pub const UNKNOWN_CLIENT: &str = "UNKNOWN_CLIENT";
/// Operation name is not part of the exposed contract.
pub const UNKNOWN_OPERATION: &str = "UNKNOWN_OPERATION";
/// Remote handle was released or never existed.
pub const UNKNOWN_HANDLE: &str = "UNKNOWN_HANDLE";
/// Arguments or return value did not match the declared types.
pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
/// Contract implementation returned an error.
pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
/// Contract implementation panicked.
pub const HANDLER_PANICKED: &str = "HANDLER_PANICKED";
/// Push source emitted an error.
pub const SOURCE_ERROR: &str = "SOURCE_ERROR";
/// Channel to the worker closed before a reply arrived.
pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";

/// Serializable error delivered across the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Create an error with an arbitrary code.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Unknown client.
    #[must_use]
    pub fn unknown_client(client_id: &ClientId) -> Self {
        Self::new(UNKNOWN_CLIENT, format!("Unknown client {client_id}"))
    }

    /// Unknown operation.
    #[must_use]
    pub fn unknown_operation(operation: &str) -> Self {
        Self::new(UNKNOWN_OPERATION, format!("Unknown operation {operation}"))
    }

    /// Unknown remote handle.
    #[must_use]
    pub fn unknown_handle(handle: u64) -> Self {
        Self::new(UNKNOWN_HANDLE, format!("Unknown handle {handle}"))
    }

    /// Malformed arguments or results.
    #[must_use]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(INVALID_PAYLOAD, message)
    }

    /// Handler failure.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(HANDLER_FAILED, message)
    }

    /// Handler panic.
    #[must_use]
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(HANDLER_PANICKED, message)
    }

    /// Push source failure.
    #[must_use]
    pub fn source(message: impl Into<String>) -> Self {
        Self::new(SOURCE_ERROR, message)
    }

    /// The channel closed under a pending request.
    #[must_use]
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::new(CHANNEL_CLOSED, message)
    }

    /// Check the error code.
    #[must_use]
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_the_message() {
        let err = RemoteError::source("boom");
        assert_eq!(err.to_string(), "boom");
        assert!(err.is(SOURCE_ERROR));
    }

    #[test]
    fn unknown_client_names_the_client() {
        let err = RemoteError::unknown_client(&ClientId::new("c9"));
        assert_eq!(err.message, "Unknown client c9");
        assert!(err.is(UNKNOWN_CLIENT));
    }

    #[test]
    fn serializes_as_plain_object() {
        let json = serde_json::to_value(RemoteError::handler("nope")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "code": "HANDLER_FAILED", "message": "nope" })
        );
    }
}
