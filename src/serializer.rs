//! Encode/decode arbitrary application values and errors to/from opaque TEXT
//!
//! The durable tables only know about text columns; everything they store
//! passes through this module first. The format is a JSON envelope and is
//! considered opaque outside this crate — nothing else inspects it.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::SysDbError;

/// The literal token stored for an absent value, matching the journal's
/// "record null to mean no output" convention (durable sleep, notification
/// misses, `recv`/`get_event` timeouts).
pub const NULL_TOKEN: &str = "null";

/// Serialize a value to its durable TEXT representation.
pub fn serialize<T: Serialize>(value: &T) -> Result<String, SysDbError> {
    Ok(serde_json::to_string(value)?)
}

/// Serialize `()`/absence to the canonical null token.
pub fn serialize_null() -> String {
    NULL_TOKEN.to_string()
}

/// Deserialize a previously serialized value. `"null"` decodes to `None`.
pub fn deserialize<T: DeserializeOwned>(text: &str) -> Result<Option<T>, SysDbError> {
    if text == NULL_TOKEN {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(text)?))
}

/// Deserialize into a raw `serde_json::Value`, preserving `null` as
/// `Value::Null` rather than collapsing it to `None` — used by callers
/// that need to distinguish "recorded an explicit JSON null" from
/// "nothing was recorded" at a different layer (e.g. the operation row
/// itself being absent).
pub fn deserialize_value(text: &str) -> Result<Value, SysDbError> {
    Ok(serde_json::from_str(text)?)
}

/// An error captured for durable storage: enough to reconstruct a
/// reasonable exception on the recovering side without round-tripping
/// the original error type.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct SerializedError {
    pub message: String,
    pub kind: String,
}

impl SerializedError {
    pub fn new(message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: kind.into(),
        }
    }
}

impl std::fmt::Display for SerializedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// Serialize an application error for the `error` column of `workflow_status`
/// or `operation_outputs`.
pub fn serialize_error(err: &SerializedError) -> Result<String, SysDbError> {
    serialize(err)
}

/// Deserialize a previously serialized application error.
pub fn deserialize_error(text: &str) -> Result<Option<SerializedError>, SysDbError> {
    deserialize(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plain_values() {
        let text = serialize(&42i64).unwrap();
        assert_eq!(deserialize::<i64>(&text).unwrap(), Some(42));

        let text = serialize(&"hello").unwrap();
        assert_eq!(deserialize::<String>(&text).unwrap(), Some("hello".to_string()));
    }

    #[test]
    fn null_token_decodes_to_absence() {
        assert_eq!(deserialize::<i64>(NULL_TOKEN).unwrap(), None);
        assert_eq!(serialize_null(), NULL_TOKEN);
    }

    #[test]
    fn round_trips_structured_values() {
        let value = serde_json::json!({"args": [1, "two"], "kwargs": {"k": true}});
        let text = serialize(&value).unwrap();
        let back: Option<Value> = deserialize(&text).unwrap();
        assert_eq!(back, Some(value));
    }

    #[test]
    fn round_trips_errors() {
        let err = SerializedError::new("boom", "RuntimeError");
        let text = serialize_error(&err).unwrap();
        let back = deserialize_error(&text).unwrap();
        assert_eq!(back, Some(err));
    }

    #[test]
    fn deserialize_value_preserves_json_null() {
        let v = deserialize_value("null").unwrap();
        assert_eq!(v, Value::Null);
    }
}
