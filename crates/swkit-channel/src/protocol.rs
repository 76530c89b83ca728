//! Wire shapes exchanged between page and worker.
//!
//! A request is `{ "action": string, "payload": any }`; the single reply is
//! `{ "status": "resolved" | "rejected", "value": any }`.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::ChannelError;

/// A command sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub action: String,
    #[serde(default)]
    pub payload: JsonValue,
}

impl Message {
    /// A message without payload.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            payload: JsonValue::Null,
        }
    }

    pub fn with_payload(action: impl Into<String>, payload: impl Into<JsonValue>) -> Self {
        Self {
            action: action.into(),
            payload: payload.into(),
        }
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::json!({
            "action": self.action,
            "payload": self.payload,
        })
    }

    /// Read a message out of raw port data.
    ///
    /// Returns `None` for anything that is not an object carrying a string
    /// `action`; such data is not addressed to the command listener.
    pub fn from_value(data: &JsonValue) -> Option<Self> {
        let object = data.as_object()?;
        let action = object.get("action")?.as_str()?;
        Some(Self {
            action: action.to_string(),
            payload: object.get("payload").cloned().unwrap_or(JsonValue::Null),
        })
    }
}

/// Outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Resolved,
    Rejected,
}

/// The single reply to a [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default)]
    pub value: JsonValue,
}

impl Reply {
    pub fn resolved(value: impl Into<JsonValue>) -> Self {
        Self {
            status: ReplyStatus::Resolved,
            value: value.into(),
        }
    }

    pub fn rejected(value: impl Into<JsonValue>) -> Self {
        Self {
            status: ReplyStatus::Rejected,
            value: value.into(),
        }
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::json!({
            "status": self.status,
            "value": self.value,
        })
    }

    pub fn from_value(data: JsonValue) -> Result<Self, ChannelError> {
        serde_json::from_value(data).map_err(|e| ChannelError::MalformedReply(e.to_string()))
    }

    /// Resolved value, or the rejection as an error.
    pub fn into_result(self) -> Result<JsonValue, ChannelError> {
        match self.status {
            ReplyStatus::Resolved => Ok(self.value),
            ReplyStatus::Rejected => Err(ChannelError::Rejected(self.value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_from_value() {
        let message = Message::from_value(&json!({"action": "ping"})).unwrap();
        assert_eq!(message, Message::new("ping"));

        let message =
            Message::from_value(&json!({"action": "removeCacheKey", "payload": "/a.css"}))
                .unwrap();
        assert_eq!(message.payload, json!("/a.css"));
    }

    #[test]
    fn test_message_from_non_command() {
        assert!(Message::from_value(&json!("skipWaiting")).is_none());
        assert!(Message::from_value(&json!({"payload": 1})).is_none());
        assert!(Message::from_value(&json!({"action": 3})).is_none());
    }

    #[test]
    fn test_reply_wire_shape() {
        assert_eq!(
            Reply::resolved("pong").to_value(),
            json!({"status": "resolved", "value": "pong"})
        );
        let reply = Reply::from_value(json!({"status": "rejected", "value": "boom"})).unwrap();
        assert!(matches!(
            reply.into_result(),
            Err(ChannelError::Rejected(v)) if v == json!("boom")
        ));
    }

    #[test]
    fn test_reply_malformed() {
        assert!(matches!(
            Reply::from_value(json!({"status": "pending"})),
            Err(ChannelError::MalformedReply(_))
        ));
    }
}
