//! Outbound deliveries and the server clock.

use courier_protocol::{ChatMessage, Frame, Notification};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Last timestamp handed out by [`stamp`].
static LAST_STAMP: AtomicU64 = AtomicU64::new(0);

/// Wall-clock milliseconds since the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Assign a server timestamp.
///
/// Stamps are never earlier than the wall clock at the time of the call and
/// strictly increase across the process, so a message dispatched later always
/// carries a larger stamp than one dispatched before it.
#[must_use]
pub fn stamp() -> u64 {
    let now = now_millis();
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Body of an outbound delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Chat(ChatMessage),
    Notification(Notification),
}

impl Payload {
    /// Server timestamp of the message.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        match self {
            Payload::Chat(m) => m.timestamp,
            Payload::Notification(n) => n.timestamp,
        }
    }
}

/// A stamped message on its way to one or more connections.
///
/// Deliveries are shared behind an `Arc` so fan-out never copies the body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic or user destination the message was addressed to.
    pub destination: String,
    /// The message.
    pub payload: Payload,
}

impl Delivery {
    #[must_use]
    pub fn new(destination: impl Into<String>, payload: Payload) -> Self {
        Self {
            destination: destination.into(),
            payload,
        }
    }

    /// Build the wire frame pushed to a client.
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        match &self.payload {
            Payload::Chat(m) => Frame::message(self.destination.clone(), m.clone()),
            Payload::Notification(n) => Frame::notification(self.destination.clone(), n.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::MessageKind;

    #[test]
    fn test_stamp_strictly_increases() {
        let mut prev = stamp();
        for _ in 0..1000 {
            let next = stamp();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn test_stamp_not_before_wall_clock() {
        let before = now_millis();
        assert!(stamp() >= before);
    }

    #[test]
    fn test_delivery_to_frame() {
        let delivery = Delivery::new(
            "/topic/public",
            Payload::Chat(ChatMessage::join("alice", 10)),
        );
        assert_eq!(delivery.payload.timestamp(), 10);
        match delivery.to_frame() {
            Frame::Message {
                destination,
                message,
            } => {
                assert_eq!(destination, "/topic/public");
                assert_eq!(message.kind, MessageKind::Join);
            }
            other => panic!("Expected Message frame, got {:?}", other),
        }
    }
}
