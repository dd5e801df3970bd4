//! Shared error types.
//!
//! [`TaskError`] is the one error that crosses the wire: the server serializes
//! it into the `error` field of a task response and the client rebuilds it
//! from there. Everything else stays local to the process that raised it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Misuse of a [`Promise`](crate::Promise). These are programmer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PromiseError {
    #[error("promise already realized")]
    AlreadyRealized,
    #[error("promise already has a continuation")]
    AlreadyChained,
}

/// Returned by sends attempted while the transport is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transport is not connected")]
pub struct NotConnected;

/// A frame that could not be understood. Logged and dropped by receivers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("frame too short: {len} bytes")]
    Truncated { len: usize },
}

/// Why a task request was rejected.
///
/// Serialized as `{"kind": "<variant>", ...fields}` so the client can tell
/// timeouts and authorization failures apart from application errors.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskError {
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },
    #[error("unknown task `{task}`")]
    UnknownTask { task: String },
    #[error("task `{task}` timed out after {timeout_ms}ms")]
    Timeout { task: String, timeout_ms: u64 },
    #[error("worker pool saturated ({queued} jobs queued)")]
    Saturated { queued: usize },
    #[error("transport unavailable after {attempts} send attempts")]
    TransportUnavailable { attempts: u32 },
    #[error("invalid arguments: {message}")]
    InvalidArguments { message: String },
    #[error("task failed: {error}")]
    Failed { error: Value },
}

impl TaskError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        TaskError::Unauthorized {
            message: message.into(),
        }
    }

    pub fn failed(error: impl Into<Value>) -> Self {
        TaskError::Failed {
            error: error.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }

    /// Serialize for the `error` field of a response.
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::String(self.to_string()))
    }

    /// Rebuild from the `error` field of a response. Values that are not a
    /// tagged `TaskError` are kept verbatim as [`TaskError::Failed`].
    pub fn from_wire(value: Value) -> Self {
        match serde_json::from_value::<TaskError>(value.clone()) {
            Ok(err) => err,
            Err(_) => TaskError::Failed { error: value },
        }
    }
}
