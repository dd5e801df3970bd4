//! Wire protocol shared by the socket endpoint and the client.
//!
//! Every frame on the socket is a JSON [`Envelope`] addressed to a named
//! channel. Channel control uses the `subscribe`/`unsubscribe` events (client
//! to server) and their `subscribed`/`unsubscribed` acknowledgements. The
//! `tasks` channel carries [`TaskRequest`] and [`TaskResponse`] payloads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Channel carrying task requests and responses.
pub const TASKS_CHANNEL: &str = "tasks";

/// Control and task event names.
pub mod events {
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const REQUEST: &str = "request";
    pub const RESPONSE: &str = "response";
}

/// A single channel-multiplexed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub content: Value,
}

impl Envelope {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, content: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            content,
        }
    }

    /// Build a `subscribe` control frame for a channel.
    pub fn subscribe(channel: &str) -> Self {
        Self::new(channel, events::SUBSCRIBE, Value::Null)
    }

    /// Build an `unsubscribe` control frame for a channel.
    pub fn unsubscribe(channel: &str) -> Self {
        Self::new(channel, events::UNSUBSCRIBE, Value::Null)
    }

    pub fn is_control(&self) -> bool {
        matches!(
            self.event.as_str(),
            events::SUBSCRIBE | events::UNSUBSCRIBE | events::SUBSCRIBED | events::UNSUBSCRIBED
        )
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Signed identity attached to auth-required task requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSignature {
    pub id: String,
    pub signature: String,
}

/// Client to server: run the task `task` with keyword `args`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserSignature>,
}

/// Server to client: outcome of the request with the same `id`.
///
/// Exactly one of `result`/`error` is meaningful; `error` being non-null marks
/// a rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task: String,
    pub id: u64,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<Value>,
}

impl TaskResponse {
    pub fn resolved(task: impl Into<String>, id: u64, result: Value) -> Self {
        Self {
            task: task.into(),
            id,
            result,
            error: Value::Null,
            meta_data: None,
        }
    }

    pub fn rejected(task: impl Into<String>, id: u64, error: Value) -> Self {
        Self {
            task: task.into(),
            id,
            result: Value::Null,
            error,
            meta_data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_null()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new("tasks", "request", json!({"task": "echo"}));
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"channel": "tasks", "event": "request", "content": {"task": "echo"}})
        );
    }

    #[test]
    fn test_envelope_without_content_defaults_to_null() {
        let env = Envelope::parse(r#"{"channel":"chat","event":"subscribe"}"#).unwrap();
        assert!(env.is_control());
        assert_eq!(env.content, Value::Null);
    }

    #[test]
    fn test_malformed_frame_is_a_protocol_error() {
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_request_omits_missing_user() {
        let req = TaskRequest {
            task: "echo".into(),
            args: Map::new(),
            id: 7,
            user: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert!(value.get("user").is_none());
        assert_eq!(value["id"], 7);
    }

    #[test]
    fn test_response_error_marks_rejection() {
        let ok = TaskResponse::resolved("echo", 1, json!(2));
        let err = TaskResponse::rejected("echo", 2, json!("boom"));
        assert!(!ok.is_error());
        assert!(err.is_error());

        let parsed: TaskResponse =
            serde_json::from_str(r#"{"task":"echo","id":3,"result":4}"#).unwrap();
        assert_eq!(parsed.result, json!(4));
        assert!(!parsed.is_error());
    }
}
