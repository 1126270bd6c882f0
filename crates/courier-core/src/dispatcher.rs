//! Message dispatcher.
//!
//! Entry point for inbound client messages: validates them, stamps the
//! server timestamp and hands them to the topic broker or the user router.
//! Identity binding is left to the presence coordinator.

use crate::broker::TopicBroker;
use crate::message::{stamp, Payload};
use crate::outbox::DeliveryReport;
use crate::presence::{Identification, PresenceCoordinator, PresenceError};
use crate::session::{ConnectionId, RegistryError};
use crate::topics::{CHAT_TOPIC, NOTIFICATION_TOPIC};
use crate::users::UserRouter;
use courier_protocol::{codes, ChatMessage, Notification, Severity};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Maximum username length in bytes.
pub const MAX_USERNAME_LENGTH: usize = 64;

/// Dispatch errors, reported back to the originating connection only.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The inbound message is malformed.
    #[error("Validation failed: {0}")]
    Validation(&'static str),

    /// Identity binding failed.
    #[error(transparent)]
    Presence(#[from] PresenceError),
}

impl DispatchError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            DispatchError::Validation(_) => codes::VALIDATION,
            DispatchError::Presence(e) => e.code(),
        }
    }
}

impl PresenceError {
    /// Wire error code for this failure.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            PresenceError::InvalidTopic(_) => codes::SUBSCRIPTION_FAILED,
            PresenceError::Registry(RegistryError::AlreadyBound { .. }) => codes::ALREADY_BOUND,
            PresenceError::Registry(RegistryError::SubscriptionLimit { .. }) => {
                codes::SUBSCRIPTION_FAILED
            }
            PresenceError::Registry(
                RegistryError::UnknownConnection(_) | RegistryError::AlreadyRegistered(_),
            ) => codes::UNKNOWN_CONNECTION,
        }
    }
}

/// A notification before it is stamped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationDraft {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    /// Target username; `None` broadcasts on the notification topic.
    pub recipient: Option<String>,
}

/// An inbound message as received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The client announces its username.
    Join { sender: Option<String> },
    /// A chat line for the chat topic.
    Chat {
        sender: Option<String>,
        content: String,
    },
    /// A notification, targeted or broadcast.
    Notification(NotificationDraft),
}

/// What a successful dispatch did.
#[derive(Debug, Clone)]
pub enum Receipt {
    /// The connection is identified; see [`Identification::is_new`].
    Joined(Identification),
    /// A chat message was published on the chat topic.
    Chat {
        message: ChatMessage,
        report: DeliveryReport,
    },
    /// A notification was routed or broadcast.
    Notification {
        notification: Notification,
        report: DeliveryReport,
    },
}

/// Validates, stamps and routes inbound messages.
pub struct Dispatcher {
    presence: Arc<PresenceCoordinator>,
    broker: Arc<TopicBroker>,
    users: Arc<UserRouter>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        presence: Arc<PresenceCoordinator>,
        broker: Arc<TopicBroker>,
        users: Arc<UserRouter>,
    ) -> Self {
        Self {
            presence,
            broker,
            users,
        }
    }

    /// Dispatch a message received on `source`.
    ///
    /// `Join` and `Chat` identify the connection with their sender; the
    /// first one observed performs the JOIN announcement, later ones must
    /// carry the same sender.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] for malformed input and
    /// [`DispatchError::Presence`] if the sender cannot be bound.
    pub fn dispatch(&self, source: &ConnectionId, inbound: Inbound) -> Result<Receipt, DispatchError> {
        match inbound {
            Inbound::Join { sender } => {
                let sender = require_sender(sender)?;
                let identification = self.presence.identify(source, &sender)?;
                Ok(Receipt::Joined(identification))
            }
            Inbound::Chat { sender, content } => {
                let sender = require_sender(sender)?;
                if content.trim().is_empty() {
                    return Err(DispatchError::Validation("content must not be empty"));
                }
                self.presence.identify(source, &sender)?;

                let message = ChatMessage::chat(sender, content, stamp());
                let report = self
                    .broker
                    .publish(CHAT_TOPIC, Payload::Chat(message.clone()));
                debug!(
                    connection = %source,
                    user = %message.sender,
                    recipients = report.delivered,
                    "Chat dispatched"
                );
                Ok(Receipt::Chat { message, report })
            }
            Inbound::Notification(draft) => {
                let (notification, report) = self.notify(draft)?;
                Ok(Receipt::Notification {
                    notification,
                    report,
                })
            }
        }
    }

    /// Stamp and deliver a notification.
    ///
    /// Targeted notifications go to every connection of the recipient and
    /// are dropped if the recipient is offline. Untargeted ones are
    /// published on the notification topic.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Validation`] if the message body is empty
    /// or the recipient is blank.
    pub fn notify(
        &self,
        draft: NotificationDraft,
    ) -> Result<(Notification, DeliveryReport), DispatchError> {
        if draft.message.trim().is_empty() {
            return Err(DispatchError::Validation("message must not be empty"));
        }
        if draft.recipient.as_deref().is_some_and(|r| r.trim().is_empty()) {
            return Err(DispatchError::Validation("recipient must not be blank"));
        }

        let notification = Notification {
            title: draft.title,
            message: draft.message,
            severity: draft.severity,
            recipient: draft.recipient,
            timestamp: stamp(),
        };
        let payload = Payload::Notification(notification.clone());

        let report = match notification.recipient.as_deref() {
            Some(recipient) => self.users.route(recipient, payload),
            None => self.broker.publish(NOTIFICATION_TOPIC, payload),
        };

        debug!(
            recipient = notification.recipient.as_deref().unwrap_or("*"),
            severity = ?notification.severity,
            delivered = report.delivered,
            "Notification dispatched"
        );

        Ok((notification, report))
    }
}

fn require_sender(sender: Option<String>) -> Result<String, DispatchError> {
    match sender {
        Some(s) if s.trim().is_empty() => Err(DispatchError::Validation("sender is required")),
        Some(s) if s.len() > MAX_USERNAME_LENGTH => {
            Err(DispatchError::Validation("sender is too long"))
        }
        Some(s) => Ok(s),
        None => Err(DispatchError::Validation("sender is required")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Delivery;
    use crate::outbox::Mailbox;
    use crate::session::SessionRegistry;
    use courier_protocol::MessageKind;

    struct Fixture {
        presence: Arc<PresenceCoordinator>,
        users: Arc<UserRouter>,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(32, 8));
        let broker = Arc::new(TopicBroker::new());
        let users = Arc::new(UserRouter::new());
        let presence = Arc::new(PresenceCoordinator::new(
            registry,
            broker.clone(),
            users.clone(),
        ));
        let dispatcher = Dispatcher::new(presence.clone(), broker, users.clone());
        Fixture {
            presence,
            users,
            dispatcher,
        }
    }

    fn drain(rx: &mut Mailbox) -> Vec<Arc<Delivery>> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    fn chat(sender: Option<&str>, content: &str) -> Inbound {
        Inbound::Chat {
            sender: sender.map(str::to_string),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_validation_errors() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let _rx = f.presence.connect(id.clone()).unwrap();

        for inbound in [
            chat(None, "hi"),
            chat(Some("  "), "hi"),
            chat(Some("bob"), ""),
            chat(Some("bob"), "   "),
            Inbound::Join { sender: None },
            chat(Some("x".repeat(MAX_USERNAME_LENGTH + 1).as_str()), "hi"),
        ] {
            let err = f.dispatcher.dispatch(&id, inbound).unwrap_err();
            assert!(matches!(err, DispatchError::Validation(_)));
            assert_eq!(err.code(), codes::VALIDATION);
        }

        // Nothing was bound by rejected messages.
        assert_eq!(f.presence.state(&id), crate::PresenceState::Connected);
    }

    #[test]
    fn test_first_chat_identifies_then_publishes() {
        let f = fixture();
        let id = ConnectionId::new("b");
        let mut rx = f.presence.connect(id.clone()).unwrap();

        let receipt = f.dispatcher.dispatch(&id, chat(Some("bob"), "hi")).unwrap();
        let Receipt::Chat { message, report } = receipt else {
            panic!("Expected chat receipt");
        };
        assert_eq!(message.sender, "bob");
        assert_eq!(report.delivered, 1);

        let seen = drain(&mut rx);
        let kinds: Vec<MessageKind> = seen
            .iter()
            .map(|d| match &d.payload {
                Payload::Chat(m) => m.kind,
                Payload::Notification(_) => panic!("unexpected notification"),
            })
            .collect();
        assert_eq!(kinds, vec![MessageKind::Join, MessageKind::Chat]);
        assert!(seen[1].payload.timestamp() > seen[0].payload.timestamp());
    }

    #[test]
    fn test_chat_with_other_sender_is_rejected() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let _rx = f.presence.connect(id.clone()).unwrap();
        f.dispatcher
            .dispatch(&id, Inbound::Join { sender: Some("alice".into()) })
            .unwrap();

        let err = f
            .dispatcher
            .dispatch(&id, chat(Some("mallory"), "hi"))
            .unwrap_err();
        assert_eq!(err.code(), codes::ALREADY_BOUND);
    }

    #[test]
    fn test_repeated_join_is_idempotent() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let mut rx = f.presence.connect(id.clone()).unwrap();
        let join = || Inbound::Join {
            sender: Some("alice".into()),
        };

        let Receipt::Joined(first) = f.dispatcher.dispatch(&id, join()).unwrap() else {
            panic!("Expected join receipt");
        };
        let Receipt::Joined(second) = f.dispatcher.dispatch(&id, join()).unwrap() else {
            panic!("Expected join receipt");
        };
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_chat_after_unsubscribe_does_not_resubscribe() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let mut rx = f.presence.connect(id.clone()).unwrap();
        f.dispatcher
            .dispatch(&id, Inbound::Join { sender: Some("alice".into()) })
            .unwrap();
        f.presence.unsubscribe(&id, CHAT_TOPIC).unwrap();
        drain(&mut rx);

        let Receipt::Chat { report, .. } =
            f.dispatcher.dispatch(&id, chat(Some("alice"), "hi")).unwrap()
        else {
            panic!("Expected chat receipt");
        };
        assert_eq!(report.attempted(), 0);
        assert!(drain(&mut rx).is_empty());
        assert!(!f.presence.unsubscribe(&id, CHAT_TOPIC).unwrap());
    }

    #[test]
    fn test_chat_from_unknown_connection() {
        let f = fixture();
        let err = f
            .dispatcher
            .dispatch(&"ghost".into(), chat(Some("bob"), "hi"))
            .unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_CONNECTION);
    }

    #[test]
    fn test_targeted_notification_reaches_only_recipient() {
        let f = fixture();
        let alice = ConnectionId::new("a");
        let bob = ConnectionId::new("b");
        let mut alice_rx = f.presence.connect(alice.clone()).unwrap();
        let mut bob_rx = f.presence.connect(bob.clone()).unwrap();
        f.presence.identify(&alice, "alice").unwrap();
        f.presence.identify(&bob, "bob").unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let (n, report) = f
            .dispatcher
            .notify(NotificationDraft {
                title: "Hi".into(),
                message: "only for alice".into(),
                severity: Severity::Warning,
                recipient: Some("alice".into()),
            })
            .unwrap();
        assert!(n.timestamp > 0);
        assert_eq!(report.delivered, 1);

        let got = drain(&mut alice_rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].destination, crate::topics::USER_NOTIFICATION_DESTINATION);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn test_notification_to_offline_user_is_not_an_error() {
        let f = fixture();
        let (n, report) = f
            .dispatcher
            .notify(NotificationDraft {
                message: "anyone there?".into(),
                recipient: Some("carol".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(n.recipient.as_deref(), Some("carol"));
        assert_eq!(report.attempted(), 0);
        assert!(!f.users.is_online("carol"));
    }

    #[test]
    fn test_broadcast_notification_uses_notification_topic() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let mut rx = f.presence.connect(id.clone()).unwrap();
        f.presence.subscribe(&id, NOTIFICATION_TOPIC).unwrap();

        let receipt = f
            .dispatcher
            .dispatch(
                &id,
                Inbound::Notification(NotificationDraft {
                    title: "Maintenance".into(),
                    message: "at noon".into(),
                    ..Default::default()
                }),
            )
            .unwrap();
        assert!(matches!(receipt, Receipt::Notification { .. }));

        let got = drain(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].destination, NOTIFICATION_TOPIC);
        // Notifications never identify the sending connection.
        assert_eq!(f.presence.state(&id), crate::PresenceState::Connected);
    }

    #[test]
    fn test_notification_validation() {
        let f = fixture();
        assert!(matches!(
            f.dispatcher.notify(NotificationDraft::default()),
            Err(DispatchError::Validation(_))
        ));
        assert!(matches!(
            f.dispatcher.notify(NotificationDraft {
                message: "x".into(),
                recipient: Some(" ".into()),
                ..Default::default()
            }),
            Err(DispatchError::Validation(_))
        ));
    }
}
