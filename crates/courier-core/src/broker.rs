//! Topic broker.
//!
//! Maps topic names to the connections subscribed to them and fans each
//! published message out to the subscribers present at call time.

use crate::message::{Delivery, Payload};
use crate::outbox::{fan_out, DeliveryReport, Outbox};
use crate::session::ConnectionId;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Topic name to subscriber set.
///
/// Topic entries are created on first subscribe and kept when they empty.
#[derive(Default)]
pub struct TopicBroker {
    topics: DashMap<String, HashMap<ConnectionId, Outbox>>,
}

impl TopicBroker {
    /// Create an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber to a topic.
    ///
    /// Returns `true` if it was not subscribed before.
    pub fn add_subscriber(&self, topic: &str, outbox: Outbox) -> bool {
        let mut subscribers = self.topics.entry(topic.to_string()).or_default();
        let id = outbox.connection_id().clone();
        let added = subscribers.insert(id.clone(), outbox).is_none();
        if added {
            debug!(
                topic = %topic,
                connection = %id,
                subscribers = subscribers.len(),
                "Subscribed"
            );
        }
        added
    }

    /// Remove a subscriber from a topic.
    ///
    /// Returns `true` if it was subscribed.
    pub fn remove_subscriber(&self, topic: &str, connection_id: &ConnectionId) -> bool {
        let Some(mut subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = subscribers.remove(connection_id).is_some();
        if removed {
            debug!(
                topic = %topic,
                connection = %connection_id,
                subscribers = subscribers.len(),
                "Unsubscribed"
            );
        }
        removed
    }

    /// Publish a message to every current subscriber of a topic.
    ///
    /// The subscriber set is copied before delivery starts, so the topic is
    /// not locked while queues are written and connections added meanwhile
    /// do not see this message.
    pub fn publish(&self, topic: &str, payload: Payload) -> DeliveryReport {
        let targets: Vec<Outbox> = match self.topics.get(topic) {
            Some(subscribers) => subscribers.values().cloned().collect(),
            None => {
                trace!(topic = %topic, "Publish to topic with no subscribers");
                return DeliveryReport::default();
            }
        };

        let delivery = Arc::new(Delivery::new(topic, payload));
        fan_out(&targets, &delivery)
    }

    /// Whether a connection is subscribed to a topic.
    #[must_use]
    pub fn is_subscribed(&self, topic: &str, connection_id: &ConnectionId) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|s| s.contains_key(connection_id))
    }

    /// Number of subscribers on a topic.
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|s| s.len()).unwrap_or(0)
    }

    /// Connection IDs subscribed to a topic.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<ConnectionId> {
        self.topics
            .get(topic)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether a topic entry exists.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Number of topic entries, including empty ones.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// All topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }
}
