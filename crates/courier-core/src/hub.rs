//! The hub wires the session registry, topic broker, user router, presence
//! coordinator and dispatcher together behind one handle.

use crate::broker::TopicBroker;
use crate::dispatcher::{DispatchError, Dispatcher, Inbound, NotificationDraft, Receipt};
use crate::message::Payload;
use crate::outbox::{DeliveryReport, Mailbox};
use crate::presence::{Departure, PresenceCoordinator, PresenceError, PresenceState};
use crate::session::{Connection, ConnectionId, RegistryError, SessionRegistry};
use crate::users::UserRouter;
use courier_protocol::Notification;
use std::sync::Arc;
use tracing::info;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue.
    pub outbox_capacity: usize,
    /// Maximum subscriptions per connection.
    pub max_subscriptions_per_connection: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            max_subscriptions_per_connection: 100,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Live connections.
    pub connections: usize,
    /// Connections with a bound username.
    pub identified: usize,
    /// Topic entries, including empty ones.
    pub topics: usize,
    /// Total subscriptions across connections.
    pub subscriptions: usize,
    /// Distinct users online.
    pub users: usize,
}

/// Shared routing state for one server process.
pub struct Hub {
    registry: Arc<SessionRegistry>,
    broker: Arc<TopicBroker>,
    users: Arc<UserRouter>,
    presence: Arc<PresenceCoordinator>,
    dispatcher: Dispatcher,
}

impl Hub {
    /// Create a hub with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(config: HubConfig) -> Self {
        info!("Creating hub with config: {:?}", config);

        let registry = Arc::new(SessionRegistry::new(
            config.outbox_capacity,
            config.max_subscriptions_per_connection,
        ));
        let broker = Arc::new(TopicBroker::new());
        let users = Arc::new(UserRouter::new());
        let presence = Arc::new(PresenceCoordinator::new(
            registry.clone(),
            broker.clone(),
            users.clone(),
        ));
        let dispatcher = Dispatcher::new(presence.clone(), broker.clone(), users.clone());

        Self {
            registry,
            broker,
            users,
            presence,
            dispatcher,
        }
    }

    /// Register a new connection and return its outbound mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is already registered.
    pub fn connect(&self, id: ConnectionId) -> Result<Mailbox, RegistryError> {
        self.presence.connect(id)
    }

    /// Tear down a connection. Safe to call more than once.
    pub fn disconnect(&self, id: &ConnectionId) -> Option<Departure> {
        self.presence.disconnect(id)
    }

    /// Subscribe a connection to a topic.
    ///
    /// # Errors
    ///
    /// See [`PresenceCoordinator::subscribe`].
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, PresenceError> {
        self.presence.subscribe(id, topic)
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// # Errors
    ///
    /// See [`PresenceCoordinator::unsubscribe`].
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, PresenceError> {
        self.presence.unsubscribe(id, topic)
    }

    /// Dispatch an inbound client message.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch`].
    pub fn dispatch(&self, source: &ConnectionId, inbound: Inbound) -> Result<Receipt, DispatchError> {
        self.dispatcher.dispatch(source, inbound)
    }

    /// Stamp and deliver a notification on behalf of an external caller.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::notify`].
    pub fn notify(
        &self,
        draft: NotificationDraft,
    ) -> Result<(Notification, DeliveryReport), DispatchError> {
        self.dispatcher.notify(draft)
    }

    /// Publish an already stamped payload on a topic.
    pub fn publish(&self, topic: &str, payload: Payload) -> DeliveryReport {
        self.broker.publish(topic, payload)
    }

    /// Deliver an already stamped payload to every connection of a user.
    pub fn send_to_user(&self, username: &str, payload: Payload) -> DeliveryReport {
        self.users.route(username, payload)
    }

    /// Snapshot of a connection.
    #[must_use]
    pub fn connection(&self, id: &ConnectionId) -> Option<Connection> {
        self.registry.get(id)
    }

    /// Lifecycle state of a connection.
    #[must_use]
    pub fn state(&self, id: &ConnectionId) -> PresenceState {
        self.presence.state(id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.broker.subscriber_count(topic)
    }

    /// Connections currently bound to a username.
    #[must_use]
    pub fn user_connections(&self, username: &str) -> Vec<ConnectionId> {
        self.users.connections(username)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            connections: self.registry.len(),
            identified: self.registry.identified_count(),
            topics: self.broker.topic_count(),
            subscriptions: self.registry.subscription_count(),
            users: self.users.user_count(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
