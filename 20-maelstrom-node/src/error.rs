//! Error taxonomy for the node.
//!
//! Decode, dispatch and handler errors are recoverable: they are logged or
//! turned into protocol `error` replies and the engine keeps going.
//! [`EncodeError`] and [`EngineError`] are fatal because the output stream
//! can no longer be trusted after a failed write.

use std::io;

use thiserror::Error;

use crate::message::ErrorCode;

/// A single input frame that could not be parsed as an envelope.
#[derive(Debug, Error)]
#[error("malformed frame on line {line}: {source}")]
pub struct DecodeError {
    pub line: usize,
    pub frame: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed {msg_type} body: {reason}")]
    MalformedBody { msg_type: String, reason: String },

    #[error("node already initialized as {node_id}")]
    AlreadyInitialized { node_id: String },

    #[error("{text}")]
    Rejected { code: ErrorCode, text: String },
}

impl HandlerError {
    pub fn malformed(msg_type: impl Into<String>, reason: impl ToString) -> Self {
        Self::MalformedBody {
            msg_type: msg_type.into(),
            reason: reason.to_string(),
        }
    }

    /// Protocol error code reported back to the requester.
    pub fn code(&self) -> ErrorCode {
        match self {
            HandlerError::MalformedBody { .. } => ErrorCode::MalformedRequest,
            HandlerError::AlreadyInitialized { .. } => ErrorCode::PreconditionFailed,
            HandlerError::Rejected { code, .. } => *code,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown message type {tag:?}")]
    UnknownType { tag: String },

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::UnknownType { .. } => ErrorCode::NotSupported,
            DispatchError::Handler(err) => err.code(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("could not serialize reply: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("could not write reply: {0}")]
    Io(#[from] io::Error),
}

/// Fatal failures that stop the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("reading input failed: {0}")]
    Input(#[source] io::Error),

    #[error("invalid engine configuration: {0}")]
    Config(String),
}
