//! Wire shapes of the Maelstrom protocol.
//!
//! Every exchanged message is an [`Envelope`] carrying a [`Body`]. The body
//! has three well-known header fields (`type`, `msg_id`, `in_reply_to`) and
//! an open map with everything else, so fields a handler does not touch
//! survive a decode/encode cycle untouched.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub src: String,
    pub dest: String,
    pub body: Body,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Body {
    /// Creates a body with the given type tag and no other fields.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            msg_id: None,
            in_reply_to: None,
            payload: Map::new(),
        }
    }

    /// Builds a Maelstrom `error` body.
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Self::new("error")
            .with("code", code.as_u32())
            .with("text", Value::String(text.into()))
    }

    /// Adds a payload field, replacing any previous value under `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Deserializes the payload fields into a typed view.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
    }

    /// Returns the error code when this is an `error` body.
    pub fn error_code(&self) -> Option<u64> {
        if self.kind != "error" {
            return None;
        }
        self.payload.get("code").and_then(Value::as_u64)
    }
}

/// Payload of an `init` request.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct InitPayload {
    pub node_id: String,
    pub node_ids: Vec<String>,
}

/// Payload of an `echo` request. The echoed value may be any JSON value.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EchoPayload {
    pub echo: Value,
}

/// Error codes defined by the Maelstrom protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 30,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::NodeNotFound => "node-not-found",
            ErrorCode::NotSupported => "not-supported",
            ErrorCode::TemporarilyUnavailable => "temporarily-unavailable",
            ErrorCode::MalformedRequest => "malformed-request",
            ErrorCode::Crash => "crash",
            ErrorCode::Abort => "abort",
            ErrorCode::KeyDoesNotExist => "key-does-not-exist",
            ErrorCode::KeyAlreadyExists => "key-already-exists",
            ErrorCode::PreconditionFailed => "precondition-failed",
            ErrorCode::TxnConflict => "txn-conflict",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u32())
    }
}
