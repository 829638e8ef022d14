//! Values transmitted across the channel.

use std::{borrow::Borrow, fmt};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

/// Opaque client identifier.
///
/// Chosen by the client itself; uniqueness is best-effort (random UUID by
/// default).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create an identifier from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random identifier.
    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Binary buffer carried as base64 text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binary(pub Bytes);

impl Binary {
    /// Wrap raw bytes.
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// View the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Binary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Binary {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded)
            .map(|data| Self(Bytes::from(data)))
            .map_err(serde::de::Error::custom)
    }
}

/// Encode a value for the wire.
///
/// # Errors
/// Returns error if the value cannot be represented as JSON.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Value, serde_json::Error> {
    serde_json::to_value(value)
}

/// Decode a wire value.
///
/// # Errors
/// Returns error if the value does not match `T`.
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, serde_json::Error> {
    serde_json::from_value(value)
}

/// Encode an operation input.
///
/// Inputs that encode to `null` (`()`, `None`) are omitted from the
/// argument list entirely.
///
/// # Errors
/// Returns error if the input cannot be represented as JSON.
pub fn encode_input<T: Serialize + ?Sized>(input: &T) -> Result<Option<Value>, serde_json::Error> {
    match encode(input)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}

/// Decode an operation input; an omitted input decodes from `null`.
///
/// # Errors
/// Returns error if the input does not match `T`.
pub fn decode_input<T: DeserializeOwned>(input: Option<Value>) -> Result<T, serde_json::Error> {
    decode(input.unwrap_or(Value::Null))
}
