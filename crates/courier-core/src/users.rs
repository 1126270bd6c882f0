//! User router.
//!
//! Reverse index from username to the connections bound to it. A user may
//! be online from several connections at once; targeted messages reach all
//! of them and nobody else.

use crate::message::{Delivery, Payload};
use crate::outbox::{fan_out, DeliveryReport, Outbox};
use crate::session::ConnectionId;
use crate::topics::USER_NOTIFICATION_DESTINATION;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Username to bound connections.
#[derive(Default)]
pub struct UserRouter {
    users: DashMap<String, HashMap<ConnectionId, Outbox>>,
}

impl UserRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a username.
    ///
    /// Returns `true` if the binding is new.
    pub fn bind(&self, username: &str, outbox: Outbox) -> bool {
        let mut connections = self.users.entry(username.to_string()).or_default();
        let id = outbox.connection_id().clone();
        let added = connections.insert(id.clone(), outbox).is_none();
        if added {
            debug!(
                user = %username,
                connection = %id,
                devices = connections.len(),
                "Bound user connection"
            );
        }
        added
    }

    /// Remove a connection from a username. Unknown pairs are ignored.
    ///
    /// Returns `true` if a binding was removed.
    pub fn unbind(&self, username: &str, connection_id: &ConnectionId) -> bool {
        let removed = match self.users.get_mut(username) {
            Some(mut connections) => connections.remove(connection_id).is_some(),
            None => return false,
        };

        // Drop the user entry once its last connection is gone; the check
        // runs under the shard lock so a concurrent bind is never lost.
        self.users
            .remove_if(username, |_, connections| connections.is_empty());

        if removed {
            debug!(user = %username, connection = %connection_id, "Unbound user connection");
        }
        removed
    }

    /// Deliver a message to every connection bound to `username`.
    ///
    /// A user with no live connections is not an error; the message is
    /// dropped and the report is empty.
    pub fn route(&self, username: &str, payload: Payload) -> DeliveryReport {
        let targets: Vec<Outbox> = match self.users.get(username) {
            Some(connections) => connections.values().cloned().collect(),
            None => {
                trace!(user = %username, "User offline, dropping targeted message");
                return DeliveryReport::default();
            }
        };

        let delivery = Arc::new(Delivery::new(USER_NOTIFICATION_DESTINATION, payload));
        fan_out(&targets, &delivery)
    }

    /// Connections bound to a username.
    #[must_use]
    pub fn connections(&self, username: &str) -> Vec<ConnectionId> {
        self.users
            .get(username)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any connection is bound to a username.
    #[must_use]
    pub fn is_online(&self, username: &str) -> bool {
        self.users.get(username).is_some_and(|c| !c.is_empty())
    }

    /// Number of users with at least one bound connection.
    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::outbox;
    use courier_protocol::{Notification, Severity};

    fn notice(recipient: &str) -> Payload {
        Payload::Notification(Notification {
            title: "Build".to_string(),
            message: "green".to_string(),
            severity: Severity::Success,
            recipient: Some(recipient.to_string()),
            timestamp: 1,
        })
    }

    #[test]
    fn test_route_reaches_all_devices_of_user() {
        let router = UserRouter::new();
        let (phone, mut phone_rx) = outbox("phone".into(), 4);
        let (laptop, mut laptop_rx) = outbox("laptop".into(), 4);
        let (other, mut other_rx) = outbox("other".into(), 4);
        router.bind("alice", phone);
        router.bind("alice", laptop);
        router.bind("bob", other);

        let report = router.route("alice", notice("alice"));
        assert_eq!(report.delivered, 2);

        let got = phone_rx.try_recv().unwrap();
        assert_eq!(got.destination, USER_NOTIFICATION_DESTINATION);
        assert!(laptop_rx.try_recv().is_ok());
        assert!(other_rx.try_recv().is_err());
    }

    #[test]
    fn test_route_to_offline_user_is_noop() {
        let router = UserRouter::new();
        let report = router.route("nobody", notice("nobody"));
        assert_eq!(report.attempted(), 0);
    }

    #[test]
    fn test_unbind_is_idempotent_and_cleans_up() {
        let router = UserRouter::new();
        let (tx, _rx) = outbox("c1".into(), 4);
        router.bind("alice", tx);
        assert!(router.is_online("alice"));

        assert!(router.unbind("alice", &"c1".into()));
        assert!(!router.unbind("alice", &"c1".into()));
        assert!(!router.unbind("ghost", &"c1".into()));

        assert!(!router.is_online("alice"));
        assert!(router.connections("alice").is_empty());
        assert_eq!(router.user_count(), 0);
    }
}
