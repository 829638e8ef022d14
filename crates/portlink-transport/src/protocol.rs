//! Wire protocol between a client endpoint and the worker.

use portlink_core::RemoteError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier correlating a request with its reply.
pub type RequestId = u64;

/// Identifier of a remotely callable function.
pub type HandleId = u64;

/// Argument as transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireArg {
    /// Plain value.
    Value { value: Value },
    /// Function living on the sender's side.
    Callback { handle: HandleId },
}

/// Successful reply payload as transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireReturn {
    /// Plain value.
    Value { value: Value },
    /// Function living on the worker's side.
    Handle { handle: HandleId },
}

/// Message from client to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke a named operation.
    Invoke {
        id: RequestId,
        operation: String,
        args: Vec<WireArg>,
    },
    /// Call a function the worker exposed as a handle.
    Apply {
        id: RequestId,
        handle: HandleId,
        args: Vec<Value>,
    },
    /// Forget a worker handle.
    Release { handle: HandleId },
}

/// Message from worker to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Reply to `Invoke` or `Apply`.
    Reply {
        id: RequestId,
        result: Result<WireReturn, RemoteError>,
    },
    /// Call a client callback.
    Callback { handle: HandleId, args: Vec<Value> },
    /// Forget a client callback.
    Release { handle: HandleId },
}

impl ServerMessage {
    /// Successful value reply.
    #[must_use]
    pub fn value(id: RequestId, value: Value) -> Self {
        Self::Reply {
            id,
            result: Ok(WireReturn::Value { value }),
        }
    }

    /// Rejected reply.
    #[must_use]
    pub fn error(id: RequestId, error: RemoteError) -> Self {
        Self::Reply {
            id,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_serialization() {
        let msg = ClientMessage::Invoke {
            id: 1,
            operation: "echo".into(),
            args: vec![
                WireArg::Value {
                    value: Value::from("c1"),
                },
                WireArg::Callback { handle: 4 },
            ],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "invoke");
        assert_eq!(json["args"][1]["kind"], "callback");

        let parsed: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn rejected_reply_carries_error_body() {
        let msg = ServerMessage::error(9, RemoteError::handler("nope"));
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("HANDLER_FAILED"));

        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        if let ServerMessage::Reply { id, result } = parsed {
            assert_eq!(id, 9);
            assert_eq!(result.unwrap_err().message, "nope");
        } else {
            panic!("Wrong message type");
        }
    }
}
