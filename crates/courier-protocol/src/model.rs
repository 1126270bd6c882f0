//! Message bodies carried by Courier frames.
//!
//! Field names follow the JSON shape browser clients already speak:
//! the kind and severity are both serialized under `type`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// Regular chat line.
    Chat,
    /// A user announced themselves.
    Join,
    /// A user's connection went away.
    Leave,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Chat => "CHAT",
            MessageKind::Join => "JOIN",
            MessageKind::Leave => "LEAVE",
        };
        f.write_str(s)
    }
}

/// A chat message as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Free-text content.
    pub content: String,
    /// Username of the sender.
    pub sender: String,
    /// Server-assigned timestamp in milliseconds since the epoch.
    pub timestamp: u64,
}

impl ChatMessage {
    /// Create a regular chat message.
    #[must_use]
    pub fn chat(sender: impl Into<String>, content: impl Into<String>, timestamp: u64) -> Self {
        Self {
            kind: MessageKind::Chat,
            content: content.into(),
            sender: sender.into(),
            timestamp,
        }
    }

    /// Create the announcement for a user joining.
    #[must_use]
    pub fn join(username: &str, timestamp: u64) -> Self {
        Self {
            kind: MessageKind::Join,
            content: format!("{username} joined"),
            sender: username.to_string(),
            timestamp,
        }
    }

    /// Create the announcement for a user leaving.
    #[must_use]
    pub fn leave(username: &str, timestamp: u64) -> Self {
        Self {
            kind: MessageKind::Leave,
            content: format!("{username} left"),
            sender: username.to_string(),
            timestamp,
        }
    }
}

/// Notification severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

/// A notification, either broadcast or addressed to one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Short title.
    pub title: String,
    /// Body text.
    pub message: String,
    /// Severity.
    #[serde(rename = "type")]
    pub severity: Severity,
    /// Target username; `None` for broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Server-assigned timestamp in milliseconds since the epoch.
    pub timestamp: u64,
}

impl Notification {
    /// Whether the notification targets a single user.
    #[must_use]
    pub fn is_targeted(&self) -> bool {
        self.recipient.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_json_shape() {
        let msg = ChatMessage::chat("bob", "hi", 1_700_000_000_000);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "CHAT",
                "content": "hi",
                "sender": "bob",
                "timestamp": 1_700_000_000_000u64
            })
        );
    }

    #[test]
    fn test_presence_content() {
        assert_eq!(ChatMessage::join("alice", 1).content, "alice joined");
        assert_eq!(ChatMessage::leave("alice", 2).content, "alice left");
        assert_eq!(ChatMessage::leave("alice", 2).kind, MessageKind::Leave);
    }

    #[test]
    fn test_notification_parses_client_json() {
        let n: Notification = serde_json::from_value(json!({
            "title": "Deploy",
            "message": "done",
            "type": "SUCCESS",
            "timestamp": 0
        }))
        .unwrap();
        assert_eq!(n.severity, Severity::Success);
        assert!(!n.is_targeted());
    }
}
