//! Wire envelopes exchanged with the editor.
//!
//! Every frame is a single JSON text message. Requests carry the operation
//! name, a parameter object and a correlation id generated on this side:
//!
//! ```text
//! {"type":"get_node_properties","params":{"node_path":"/root/Main"},"commandId":"cmd_7"}
//! ```
//!
//! The editor answers with the same `commandId`:
//!
//! ```text
//! {"commandId":"cmd_7","status":"success","result":{...}}
//! {"commandId":"cmd_7","status":"error","message":"node not found"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Parameter bag sent with every command.
pub type Params = Map<String, Value>;

/// Message used when the editor reports an error without a message.
const UNKNOWN_ERROR: &str = "Unknown error";

/// Outbound command envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Operation name understood by the editor plugin.
    #[serde(rename = "type")]
    pub kind: String,
    /// Operation parameters.
    pub params: Params,
    /// Correlation id echoed back by the editor.
    #[serde(rename = "commandId")]
    pub command_id: String,
}

impl CommandEnvelope {
    pub fn new(kind: impl Into<String>, params: Params, command_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params,
            command_id: command_id.into(),
        }
    }
}

/// Reply status reported by the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    /// Forward-compatible fallback for statuses this side does not know
    #[serde(other)]
    Unknown,
}

/// Inbound reply envelope.
///
/// Both `commandId` and `status` are optional on the wire so that frames the
/// editor pushes on its own can still be decoded and then discarded by the
/// router; a frame missing both is rejected by [`decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "commandId", default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResponseEnvelope {
    /// Convert the reply into the value or the remote error message it carries.
    ///
    /// Anything other than an explicit `success` counts as a failure. A
    /// successful reply without `result` yields `Value::Null`.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.status {
            Some(ResponseStatus::Success) => Ok(self.result.unwrap_or(Value::Null)),
            _ => Err(self.message.unwrap_or_else(|| UNKNOWN_ERROR.to_string())),
        }
    }
}

/// Errors produced while encoding outbound envelopes.
#[derive(Debug, Error)]
#[error("Failed to serialize command: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Errors produced while decoding inbound frames.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is not a JSON object")]
    NotAnObject,

    #[error("Frame has neither commandId nor status")]
    MissingFields,
}

/// Serialize a command envelope to its text frame.
pub fn encode(envelope: &CommandEnvelope) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Parse an inbound frame into a reply envelope.
pub fn decode(frame: &[u8]) -> Result<ResponseEnvelope, DecodeError> {
    let text = std::str::from_utf8(frame)?;
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(DecodeError::NotAnObject);
    }

    let envelope: ResponseEnvelope = serde_json::from_value(value)?;
    if envelope.command_id.is_none() && envelope.status.is_none() {
        return Err(DecodeError::MissingFields);
    }
    Ok(envelope)
}
