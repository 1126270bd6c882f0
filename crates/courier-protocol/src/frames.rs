//! Frame types for the Courier protocol.
//!
//! Every frame is a tagged object. Clients send `subscribe`, `join`, `send`
//! and `notify`; the server answers with `ack`/`error` and pushes `message`
//! and `notification` frames to subscribers.

use crate::model::{ChatMessage, Notification, Severity};
use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    /// Frame could not be decoded or is not valid from a client.
    pub const INVALID_FRAME: u16 = 1001;
    /// Subscribe or unsubscribe was rejected.
    pub const SUBSCRIPTION_FAILED: u16 = 1002;
    /// Inbound message failed validation.
    pub const VALIDATION: u16 = 1003;
    /// Connection is already bound to another username.
    pub const ALREADY_BOUND: u16 = 1004;
    /// Connection is unknown to the server.
    pub const UNKNOWN_CONNECTION: u16 = 1005;
    /// Client protocol version is not supported.
    pub const UNSUPPORTED_VERSION: u16 = 1006;
}

/// Frame type identifiers, used for logging and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Subscribe = 0x03,
    Unsubscribe = 0x04,
    Join = 0x05,
    Send = 0x06,
    Notify = 0x07,
    Message = 0x08,
    Notification = 0x09,
    Ack = 0x0A,
    Error = 0x0B,
    Ping = 0x0C,
    Pong = 0x0D,
}

impl FrameType {
    /// Static label for the frame type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::Subscribe => "subscribe",
            FrameType::Unsubscribe => "unsubscribe",
            FrameType::Join => "join",
            FrameType::Send => "send",
            FrameType::Notify => "notify",
            FrameType::Message => "message",
            FrameType::Notification => "notification",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }

    /// Whether a client is allowed to send this frame type.
    #[must_use]
    pub fn is_client_frame(self) -> bool {
        matches!(
            self,
            FrameType::Connect
                | FrameType::Subscribe
                | FrameType::Unsubscribe
                | FrameType::Join
                | FrameType::Send
                | FrameType::Notify
                | FrameType::Ping
                | FrameType::Pong
        )
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client handshake.
    Connect {
        /// Client protocol major version.
        version: u8,
        /// Opaque token, accepted but not interpreted.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Server handshake reply, sent right after the upgrade.
    Connected {
        /// Server-assigned connection identifier.
        connection_id: String,
        /// Server protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Subscribe to a topic.
    Subscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic name.
        topic: String,
    },

    /// Unsubscribe from a topic.
    Unsubscribe {
        /// Request ID for acknowledgment.
        id: u64,
        /// Topic name.
        topic: String,
    },

    /// Announce the connection's username.
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
    },

    /// Send a chat line to the chat topic.
    Send {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender: Option<String>,
        #[serde(default)]
        content: String,
    },

    /// Send a notification, targeted when `recipient` is set.
    Notify {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        #[serde(default)]
        title: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        severity: Severity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recipient: Option<String>,
    },

    /// Chat message pushed to a subscriber.
    Message {
        /// Topic the message was published on.
        destination: String,
        /// The stamped message.
        message: ChatMessage,
    },

    /// Notification pushed to a subscriber or a targeted user.
    Notification {
        /// Topic or user destination.
        destination: String,
        /// The stamped notification.
        notification: Notification,
    },

    /// Acknowledgment of a request.
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::Join { .. } => FrameType::Join,
            Frame::Send { .. } => FrameType::Send,
            Frame::Notify { .. } => FrameType::Notify,
            Frame::Message { .. } => FrameType::Message,
            Frame::Notification { .. } => FrameType::Notification,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Request ID carried by the frame, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Frame::Subscribe { id, .. } | Frame::Unsubscribe { id, .. } => Some(*id),
            Frame::Join { id, .. } | Frame::Send { id, .. } | Frame::Notify { id, .. } => *id,
            _ => None,
        }
    }

    /// Create a Subscribe frame.
    #[must_use]
    pub fn subscribe(id: u64, topic: impl Into<String>) -> Self {
        Frame::Subscribe {
            id,
            topic: topic.into(),
        }
    }

    /// Create a Join frame.
    #[must_use]
    pub fn join(sender: impl Into<String>) -> Self {
        Frame::Join {
            id: None,
            sender: Some(sender.into()),
        }
    }

    /// Create a Send frame.
    #[must_use]
    pub fn send(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Frame::Send {
            id: None,
            sender: Some(sender.into()),
            content: content.into(),
        }
    }

    /// Create a Message frame.
    #[must_use]
    pub fn message(destination: impl Into<String>, message: ChatMessage) -> Self {
        Frame::Message {
            destination: destination.into(),
            message,
        }
    }

    /// Create a Notification frame.
    #[must_use]
    pub fn notification(destination: impl Into<String>, notification: Notification) -> Self {
        Frame::Notification {
            destination: destination.into(),
            notification,
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create an Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(connection_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            version,
            heartbeat,
        }
    }
}
