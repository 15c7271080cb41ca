//! Message-related models
//!
//! Messages reach the client from three places (history fetch, `newMessage`
//! events and the send-message response) with slightly different shapes.
//! Everything is deserialized into [`RawMessage`] first and then normalized
//! into a [`Message`] before it touches a timeline.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Message content type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
}

/// Who sent a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    /// Sender record was included with the message.
    Registered { id: String, name: String },
    /// Only the sender id is known.
    Unknown { id: String },
}

impl Sender {
    pub fn id(&self) -> &str {
        match self {
            Sender::Registered { id, .. } | Sender::Unknown { id } => id,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Sender::Registered { name, .. } => Some(name),
            Sender::Unknown { .. } => None,
        }
    }
}

/// A normalized chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender: Sender,
    pub content: Option<String>,
    pub kind: MessageKind,
    /// Attachment URL for image/audio messages.
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Text shown for the message body.
    pub fn body(&self) -> &str {
        match (&self.content, self.kind) {
            (Some(content), _) if !content.is_empty() => content,
            (_, MessageKind::Image) => "[image]",
            (_, MessageKind::Audio) => "[voice message]",
            _ => "No content",
        }
    }
}

/// Reasons a wire message cannot enter a timeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("message has no id")]
    MissingId,
    #[error("message {0} has no createdAt timestamp")]
    MissingTimestamp(String),
    #[error("message {0} has no sender")]
    MissingSender(String),
}

/// Sender record embedded in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSender {
    pub id: Option<String>,
    pub name: Option<String>,
}

/// Timestamps arrive as ISO-8601 strings from the API and occasionally as
/// epoch milliseconds from older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Text(DateTime<Utc>),
    Millis(i64),
}

impl RawTimestamp {
    fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            RawTimestamp::Text(t) => Some(*t),
            RawTimestamp::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
        }
    }
}

/// Message as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: Option<String>,
    pub chat_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender: Option<RawSender>,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MessageKind>,
    pub url: Option<String>,
    pub created_at: Option<RawTimestamp>,
}

impl RawMessage {
    /// Normalize into a [`Message`].
    ///
    /// `chat_id` is used when the payload omits its own chat id.
    pub fn normalize(self, chat_id: &str) -> Result<Message, MessageError> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or(MessageError::MissingId)?;

        let created_at = self
            .created_at
            .as_ref()
            .and_then(RawTimestamp::to_utc)
            .ok_or_else(|| MessageError::MissingTimestamp(id.clone()))?;

        let sender = match (self.sender, self.sender_id) {
            (Some(RawSender { id: Some(sid), name: Some(name) }), _) if !sid.is_empty() => {
                Sender::Registered { id: sid, name }
            }
            (Some(RawSender { id: Some(sid), .. }), _) if !sid.is_empty() => {
                Sender::Unknown { id: sid }
            }
            (Some(RawSender { id: None, name: Some(name) }), Some(sid)) if !sid.is_empty() => {
                Sender::Registered { id: sid, name }
            }
            (_, Some(sid)) if !sid.is_empty() => Sender::Unknown { id: sid },
            _ => return Err(MessageError::MissingSender(id)),
        };

        Ok(Message {
            id,
            chat_id: self.chat_id.unwrap_or_else(|| chat_id.to_string()),
            sender,
            content: self.content,
            kind: self.kind.unwrap_or_default(),
            url: self.url,
            created_at,
        })
    }
}

/// Outgoing message for the send-message mutation.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub content: Option<String>,
    pub attachment: Option<Attachment>,
}

/// Binary attachment (image or voice note).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: serde_json::Value) -> RawMessage {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_normalize_registered_sender() {
        let raw = parse(serde_json::json!({
            "id": "m1",
            "chatId": "c1",
            "senderId": "u1",
            "sender": { "id": "u1", "name": "Ada" },
            "content": "hello",
            "createdAt": "2024-05-01T10:00:00.000Z"
        }));
        let msg = raw.normalize("c1").unwrap();
        assert_eq!(msg.id, "m1");
        assert_eq!(
            msg.sender,
            Sender::Registered {
                id: "u1".into(),
                name: "Ada".into()
            }
        );
        assert_eq!(msg.kind, MessageKind::Text);
        assert_eq!(msg.body(), "hello");
    }

    #[test]
    fn test_normalize_bare_sender_id() {
        let raw = parse(serde_json::json!({
            "id": "m2",
            "senderId": "u9",
            "createdAt": 1_714_557_600_000_i64,
            "type": "IMAGE",
            "url": "https://cdn/x.png"
        }));
        let msg = raw.normalize("c7").unwrap();
        assert_eq!(msg.sender, Sender::Unknown { id: "u9".into() });
        assert_eq!(msg.chat_id, "c7");
        assert_eq!(msg.kind, MessageKind::Image);
        assert_eq!(msg.body(), "[image]");
        assert_eq!(msg.created_at.timestamp_millis(), 1_714_557_600_000);
    }

    #[test]
    fn test_normalize_rejects_missing_id() {
        let raw = parse(serde_json::json!({
            "senderId": "u1",
            "createdAt": "2024-05-01T10:00:00Z"
        }));
        assert_eq!(raw.normalize("c1"), Err(MessageError::MissingId));

        let raw = parse(serde_json::json!({
            "id": "",
            "senderId": "u1",
            "createdAt": "2024-05-01T10:00:00Z"
        }));
        assert_eq!(raw.normalize("c1"), Err(MessageError::MissingId));
    }

    #[test]
    fn test_normalize_rejects_missing_timestamp_and_sender() {
        let raw = parse(serde_json::json!({ "id": "m3", "senderId": "u1" }));
        assert_eq!(
            raw.normalize("c1"),
            Err(MessageError::MissingTimestamp("m3".into()))
        );

        let raw = parse(serde_json::json!({
            "id": "m4",
            "createdAt": "2024-05-01T10:00:00Z"
        }));
        assert_eq!(
            raw.normalize("c1"),
            Err(MessageError::MissingSender("m4".into()))
        );
    }
}
