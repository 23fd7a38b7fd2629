//! Business payload carried in STOMP MESSAGE/SEND bodies.
//!
//! The session never inspects bodies beyond `action`, `object`, the sender's
//! username and `data.text`; everything else is preserved in `extra` so a
//! decoded event re-encodes without loss.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ACTION_ADD: &str = "add";
pub const ACTION_ACK: &str = "ack";
pub const OBJECT_MESSAGE: &str = "message";
pub const OBJECT_CONVERSATION: &str = "conversation";

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid chat event payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventUser {
    #[serde(default)]
    pub username: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One chat event as exchanged with the broker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<EventUser>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatEvent {
    /// An `add`/`message` event from `username` with a fresh uuid.
    #[must_use]
    pub fn message(username: &str, text: &str, source: &str, domain: Option<&str>) -> Self {
        Self {
            action: ACTION_ADD.to_owned(),
            object: OBJECT_MESSAGE.to_owned(),
            user: Some(EventUser {
                username: username.to_owned(),
                extra: Map::new(),
            }),
            data: serde_json::json!({ "text": text }),
            source: Some(source.to_owned()),
            domain: domain.map(str::to_owned),
            uuid: Some(uuid::Uuid::new_v4().to_string()),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn is(&self, action: &str, object: &str) -> bool {
        self.action == action && self.object == object
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.username.as_str())
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.data.get("text").and_then(Value::as_str)
    }
}

/// Serialization boundary between the session and business payloads.
pub trait PayloadCodec: Send + Sync {
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the event cannot be serialized.
    fn encode(&self, event: &ChatEvent) -> Result<String, PayloadError>;

    /// # Errors
    ///
    /// Returns [`PayloadError`] if `body` is not a chat event.
    fn decode(&self, body: &str) -> Result<ChatEvent, PayloadError>;
}

/// Compact JSON, one object per body.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPayloadCodec;

impl PayloadCodec for JsonPayloadCodec {
    fn encode(&self, event: &ChatEvent) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(event)?)
    }

    fn decode(&self, body: &str) -> Result<ChatEvent, PayloadError> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
#[path = "payload_test.rs"]
mod tests;
