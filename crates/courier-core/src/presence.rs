//! Presence coordinator.
//!
//! Drives each connection through `Connected -> Identified -> Disconnected`
//! and keeps the session registry, topic broker and user router in step.
//! Every change that touches more than one of those stores runs under a
//! single lifecycle lock. The lock covers only in-memory bookkeeping and
//! non-blocking queue writes, so it is held briefly and ordinary publish
//! and route traffic never takes it.

use crate::broker::TopicBroker;
use crate::message::{stamp, Payload};
use crate::outbox::{DeliveryReport, Mailbox};
use crate::session::{ConnectionId, RegistryError, SessionRegistry};
use crate::topics::{carries_presence, validate_topic_name, CHAT_TOPIC};
use crate::users::UserRouter;
use courier_protocol::ChatMessage;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresenceState {
    /// Transport is up, no username yet.
    Connected,
    /// Username bound and announced.
    Identified,
    /// Terminal.
    Disconnected,
}

/// Presence errors.
#[derive(Debug, Error)]
pub enum PresenceError {
    /// Topic name failed validation.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// Registry rejected the change.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result of identifying a connection.
#[derive(Debug, Clone)]
pub struct Identification {
    /// The bound username.
    pub username: String,
    /// The JOIN announcement and its fan-out, when this call performed the
    /// `Connected -> Identified` transition.
    pub announcement: Option<(ChatMessage, DeliveryReport)>,
}

impl Identification {
    /// Whether this call identified the connection.
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.announcement.is_some()
    }
}

/// What a disconnect cleaned up.
#[derive(Debug, Clone)]
pub struct Departure {
    /// Username the connection had, if it was identified.
    pub username: Option<String>,
    /// Topics it was removed from.
    pub topics: Vec<String>,
    /// The LEAVE announcement, if one was published.
    pub announcement: Option<ChatMessage>,
}

/// Coordinates connection lifecycle across the three stores.
pub struct PresenceCoordinator {
    registry: Arc<SessionRegistry>,
    broker: Arc<TopicBroker>,
    users: Arc<UserRouter>,
    lifecycle: Mutex<()>,
}

impl PresenceCoordinator {
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        broker: Arc<TopicBroker>,
        users: Arc<UserRouter>,
    ) -> Self {
        Self {
            registry,
            broker,
            users,
            lifecycle: Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle a transport connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection ID is already registered.
    pub fn connect(&self, id: ConnectionId) -> Result<Mailbox, RegistryError> {
        let (conn, mailbox) = self.registry.register(id)?;
        info!(connection = %conn.id, "Connection opened");
        Ok(mailbox)
    }

    /// Bind a username to a connection.
    ///
    /// On the first successful call the connection joins the chat topic and
    /// a JOIN message is published there. Once bound, repeating the call
    /// with the same username changes nothing, including subscriptions the
    /// client has since dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or already bound to a
    /// different username.
    pub fn identify(
        &self,
        id: &ConnectionId,
        username: &str,
    ) -> Result<Identification, PresenceError> {
        let _guard = self.lock();

        let outbox = self
            .registry
            .outbox(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        if let Some(bound) = self.registry.username(id) {
            if bound != username {
                return Err(RegistryError::AlreadyBound {
                    connection: id.clone(),
                    bound,
                    requested: username.to_string(),
                }
                .into());
            }
            return Ok(Identification {
                username: bound,
                announcement: None,
            });
        }

        // The default chat topic does not count against the limit, so a
        // connection can always identify.
        let subscribed = self.registry.subscribe_exempt(id, CHAT_TOPIC)?;
        if let Err(e) = self.registry.bind_username(id, username) {
            if subscribed {
                if let Err(rollback) = self.registry.unsubscribe(id, CHAT_TOPIC) {
                    warn!(
                        connection = %id,
                        error = %rollback,
                        "Failed to roll back chat subscription"
                    );
                }
            }
            return Err(e.into());
        }

        if subscribed {
            self.broker.add_subscriber(CHAT_TOPIC, outbox.clone());
        }
        self.users.bind(username, outbox);

        let join = ChatMessage::join(username, stamp());
        let report = self
            .broker
            .publish(CHAT_TOPIC, Payload::Chat(join.clone()));

        info!(
            connection = %id,
            user = %username,
            recipients = report.delivered,
            "Connection identified"
        );

        Ok(Identification {
            username: username.to_string(),
            announcement: Some((join, report)),
        })
    }

    /// Subscribe a connection to a topic.
    ///
    /// Returns `true` if the subscription is new.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is invalid, the connection is
    /// unknown, or it reached its subscription limit.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, PresenceError> {
        validate_topic_name(topic).map_err(PresenceError::InvalidTopic)?;

        let _guard = self.lock();
        if !self.registry.subscribe(id, topic)? {
            return Ok(false);
        }
        let outbox = self
            .registry
            .outbox(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
        self.broker.add_subscriber(topic, outbox);
        Ok(true)
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// Returns `true` if it was subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, PresenceError> {
        let _guard = self.lock();
        let removed = self.registry.unsubscribe(id, topic)?;
        if removed {
            self.broker.remove_subscriber(topic, id);
        }
        Ok(removed)
    }

    /// Handle a transport disconnect.
    ///
    /// Removes the connection from the registry, every topic it was on, and
    /// the user router, in that order. If it had been identified, a LEAVE
    /// message then goes to the remaining subscribers of its chat topics.
    /// Disconnecting an unknown or already removed connection returns `None`.
    pub fn disconnect(&self, id: &ConnectionId) -> Option<Departure> {
        let _guard = self.lock();

        let Some(gone) = self.registry.unregister(id) else {
            debug!(connection = %id, "Disconnect for unknown connection");
            return None;
        };

        let mut topics: Vec<String> = gone.topics.into_iter().collect();
        topics.sort();
        for topic in &topics {
            self.broker.remove_subscriber(topic, id);
        }

        let announcement = gone.username.as_deref().map(|username| {
            self.users.unbind(username, id);

            let leave = ChatMessage::leave(username, stamp());
            for topic in topics.iter().filter(|t| carries_presence(t)) {
                self.broker.publish(topic, Payload::Chat(leave.clone()));
            }
            leave
        });

        info!(
            connection = %id,
            user = gone.username.as_deref().unwrap_or("-"),
            topics = topics.len(),
            "Connection closed"
        );

        Some(Departure {
            username: gone.username,
            topics,
            announcement,
        })
    }

    /// Current lifecycle state of a connection.
    #[must_use]
    pub fn state(&self, id: &ConnectionId) -> PresenceState {
        self.registry
            .get(id)
            .map_or(PresenceState::Disconnected, |c| c.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Delivery;
    use crate::topics::NOTIFICATION_TOPIC;
    use courier_protocol::MessageKind;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        broker: Arc<TopicBroker>,
        users: Arc<UserRouter>,
        presence: PresenceCoordinator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(32, 8));
        let broker = Arc::new(TopicBroker::new());
        let users = Arc::new(UserRouter::new());
        let presence =
            PresenceCoordinator::new(registry.clone(), broker.clone(), users.clone());
        Fixture {
            registry,
            broker,
            users,
            presence,
        }
    }

    fn drain(rx: &mut Mailbox) -> Vec<Arc<Delivery>> {
        let mut out = Vec::new();
        while let Ok(d) = rx.try_recv() {
            out.push(d);
        }
        out
    }

    fn chat_kinds(deliveries: &[Arc<Delivery>]) -> Vec<(MessageKind, String)> {
        deliveries
            .iter()
            .filter_map(|d| match &d.payload {
                Payload::Chat(m) => Some((m.kind, m.content.clone())),
                Payload::Notification(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_identify_announces_once() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let mut rx = f.presence.connect(id.clone()).unwrap();
        assert_eq!(f.presence.state(&id), PresenceState::Connected);

        let first = f.presence.identify(&id, "alice").unwrap();
        assert!(first.is_new());
        let second = f.presence.identify(&id, "alice").unwrap();
        assert!(!second.is_new());

        assert_eq!(f.presence.state(&id), PresenceState::Identified);
        assert!(f.broker.is_subscribed(CHAT_TOPIC, &id));
        assert_eq!(f.users.connections("alice"), vec![id]);
        assert_eq!(
            chat_kinds(&drain(&mut rx)),
            vec![(MessageKind::Join, "alice joined".to_string())]
        );
    }

    #[test]
    fn test_identify_rejects_rebind() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let _rx = f.presence.connect(id.clone()).unwrap();
        f.presence.identify(&id, "alice").unwrap();

        let err = f.presence.identify(&id, "mallory").unwrap_err();
        assert!(matches!(
            err,
            PresenceError::Registry(RegistryError::AlreadyBound { .. })
        ));
        assert!(!f.users.is_online("mallory"));
        assert!(f.broker.is_subscribed(CHAT_TOPIC, &id));
    }

    #[test]
    fn test_disconnect_before_identify_is_silent() {
        let f = fixture();
        let watcher = ConnectionId::new("w");
        let mut watcher_rx = f.presence.connect(watcher.clone()).unwrap();
        f.presence.identify(&watcher, "watcher").unwrap();
        drain(&mut watcher_rx);

        let anon = ConnectionId::new("anon");
        let _rx = f.presence.connect(anon.clone()).unwrap();
        f.presence.subscribe(&anon, CHAT_TOPIC).unwrap();

        let gone = f.presence.disconnect(&anon).unwrap();
        assert!(gone.username.is_none());
        assert!(gone.announcement.is_none());
        assert!(drain(&mut watcher_rx).is_empty());
        assert!(!f.broker.is_subscribed(CHAT_TOPIC, &anon));
    }

    #[test]
    fn test_disconnect_cleans_every_store_and_announces_once() {
        let f = fixture();
        let alice = ConnectionId::new("a");
        let bob = ConnectionId::new("b");
        let _alice_rx = f.presence.connect(alice.clone()).unwrap();
        let mut bob_rx = f.presence.connect(bob.clone()).unwrap();
        f.presence.identify(&bob, "bob").unwrap();
        f.presence.identify(&alice, "alice").unwrap();
        f.presence.subscribe(&alice, NOTIFICATION_TOPIC).unwrap();
        f.presence.subscribe(&alice, "room:1").unwrap();
        f.presence.subscribe(&bob, NOTIFICATION_TOPIC).unwrap();
        drain(&mut bob_rx);

        let gone = f.presence.disconnect(&alice).unwrap();
        assert_eq!(gone.username.as_deref(), Some("alice"));
        assert_eq!(gone.topics.len(), 3);

        for topic in [CHAT_TOPIC, NOTIFICATION_TOPIC, "room:1"] {
            assert!(!f.broker.is_subscribed(topic, &alice));
        }
        assert!(!f.users.is_online("alice"));
        assert!(!f.registry.contains(&alice));
        assert_eq!(f.presence.state(&alice), PresenceState::Disconnected);

        // Bob shares only the chat topic with alice, and no LEAVE goes to
        // the notification topic.
        let seen = drain(&mut bob_rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].destination, CHAT_TOPIC);
        assert_eq!(
            chat_kinds(&seen),
            vec![(MessageKind::Leave, "alice left".to_string())]
        );

        assert!(f.presence.disconnect(&alice).is_none());
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn test_subscribe_validates_topic() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let _rx = f.presence.connect(id.clone()).unwrap();

        assert!(matches!(
            f.presence.subscribe(&id, "$internal"),
            Err(PresenceError::InvalidTopic(_))
        ));
        assert!(f.presence.subscribe(&id, "room").unwrap());
        assert!(!f.presence.subscribe(&id, "room").unwrap());
        assert!(f.presence.unsubscribe(&id, "room").unwrap());
        assert!(!f.broker.is_subscribed("room", &id));
    }

    #[test]
    fn test_repeat_identify_keeps_dropped_chat_subscription() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let mut rx = f.presence.connect(id.clone()).unwrap();
        f.presence.identify(&id, "alice").unwrap();
        assert!(f.presence.unsubscribe(&id, CHAT_TOPIC).unwrap());

        let again = f.presence.identify(&id, "alice").unwrap();
        assert!(!again.is_new());
        assert!(!f.broker.is_subscribed(CHAT_TOPIC, &id));
        assert!(!f.registry.get(&id).unwrap().topics.contains(CHAT_TOPIC));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_identify_at_subscription_limit() {
        let f = fixture();
        let id = ConnectionId::new("a");
        let _rx = f.presence.connect(id.clone()).unwrap();
        for i in 0..8 {
            f.presence.subscribe(&id, &format!("room:{i}")).unwrap();
        }
        assert!(f.presence.subscribe(&id, "room:extra").is_err());

        let joined = f.presence.identify(&id, "alice").unwrap();
        assert!(joined.is_new());
        assert!(f.broker.is_subscribed(CHAT_TOPIC, &id));
        assert_eq!(f.registry.get(&id).unwrap().topics.len(), 9);
    }

    #[test]
    fn test_subscribe_unknown_connection() {
        let f = fixture();
        assert!(matches!(
            f.presence.subscribe(&"ghost".into(), "room"),
            Err(PresenceError::Registry(RegistryError::UnknownConnection(_)))
        ));
    }
}
