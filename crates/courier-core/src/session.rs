//! Session registry.
//!
//! Maps a connection identifier to its fixed-schema record: the bound
//! username, the topics it is subscribed to, and its outbound queue. The
//! registry never delivers anything itself.

use crate::message::now_millis;
use crate::outbox::{outbox, Mailbox, Outbox};
use crate::presence::PresenceState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;

/// Counter mixed into generated IDs so two IDs minted in the same
/// nanosecond still differ.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a live transport link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn_{:x}_{:x}", nanos, seq))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The identifier is already in use by a live connection.
    #[error("Connection already registered: {0}")]
    AlreadyRegistered(ConnectionId),

    /// No live connection has this identifier.
    #[error("Unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The connection is bound to a different username.
    #[error("Connection {connection} is already bound to '{bound}', cannot rebind to '{requested}'")]
    AlreadyBound {
        connection: ConnectionId,
        bound: String,
        requested: String,
    },

    /// The connection hit its subscription limit.
    #[error("Connection {connection} reached the limit of {limit} subscriptions")]
    SubscriptionLimit { connection: ConnectionId, limit: usize },
}

/// Snapshot of a connection record.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Username, once the client has announced itself.
    pub username: Option<String>,
    /// Topics the connection is subscribed to.
    pub topics: HashSet<String>,
    /// When the connection was registered.
    pub connected_at: u64,
}

impl Connection {
    /// Lifecycle state implied by the record.
    #[must_use]
    pub fn state(&self) -> PresenceState {
        if self.username.is_some() {
            PresenceState::Identified
        } else {
            PresenceState::Connected
        }
    }
}

/// What is left of a connection after it is unregistered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unregistered {
    /// Bound username, if the connection ever identified.
    pub username: Option<String>,
    /// Topics it was subscribed to at removal time.
    pub topics: HashSet<String>,
}

struct Session {
    username: Option<String>,
    topics: HashSet<String>,
    outbox: Outbox,
    connected_at: u64,
}

impl Session {
    fn snapshot(&self, id: &ConnectionId) -> Connection {
        Connection {
            id: id.clone(),
            username: self.username.clone(),
            topics: self.topics.clone(),
            connected_at: self.connected_at,
        }
    }
}

/// Registry of live connections.
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
    outbox_capacity: usize,
    max_subscriptions: usize,
    identified: AtomicUsize,
    subscriptions: AtomicUsize,
}

impl SessionRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(outbox_capacity: usize, max_subscriptions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            outbox_capacity,
            max_subscriptions,
            identified: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
        }
    }

    /// Register a new connection with no username and no topics.
    ///
    /// Returns the record and the receiving end of the connection's queue.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] if the ID is taken.
    pub fn register(&self, id: ConnectionId) -> Result<(Connection, Mailbox), RegistryError> {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = outbox(id.clone(), self.outbox_capacity);
                let session = Session {
                    username: None,
                    topics: HashSet::new(),
                    outbox: tx,
                    connected_at: now_millis(),
                };
                let record = session.snapshot(&id);
                slot.insert(session);
                debug!(connection = %id, "Registered connection");
                Ok((record, rx))
            }
        }
    }

    /// Bind a username to a connection.
    ///
    /// Returns `true` if the username was newly bound, `false` if the same
    /// username was already bound.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or bound to another name.
    pub fn bind_username(&self, id: &ConnectionId, username: &str) -> Result<bool, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        match &session.username {
            None => {
                session.username = Some(username.to_string());
                self.identified.fetch_add(1, Ordering::Relaxed);
                debug!(connection = %id, user = %username, "Bound username");
                Ok(true)
            }
            Some(bound) if bound == username => Ok(false),
            Some(bound) => Err(RegistryError::AlreadyBound {
                connection: id.clone(),
                bound: bound.clone(),
                requested: username.to_string(),
            }),
        }
    }

    /// Add a topic to the connection's set.
    ///
    /// Returns `true` if the topic was added, `false` if already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown or at its limit.
    pub fn subscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        self.add_topic(id, topic, Some(self.max_subscriptions))
    }

    /// Add a topic to the connection's set without applying the
    /// subscription limit. Reserved for the default chat topic joined on
    /// identify.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn subscribe_exempt(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        self.add_topic(id, topic, None)
    }

    fn add_topic(
        &self,
        id: &ConnectionId,
        topic: &str,
        limit: Option<usize>,
    ) -> Result<bool, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;

        if session.topics.contains(topic) {
            return Ok(false);
        }
        if let Some(limit) = limit.filter(|&limit| session.topics.len() >= limit) {
            return Err(RegistryError::SubscriptionLimit {
                connection: id.clone(),
                limit,
            });
        }
        session.topics.insert(topic.to_string());
        self.subscriptions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Remove a topic from the connection's set.
    ///
    /// Returns `true` if the topic was removed, `false` if it was not there.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is unknown.
    pub fn unsubscribe(&self, id: &ConnectionId, topic: &str) -> Result<bool, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownConnection(id.clone()))?;
        let removed = session.topics.remove(topic);
        if removed {
            self.subscriptions.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Remove a connection, returning its username and topics.
    ///
    /// Returns `None` if the connection was not registered.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Unregistered> {
        let (_, session) = self.sessions.remove(id)?;
        if session.username.is_some() {
            self.identified.fetch_sub(1, Ordering::Relaxed);
        }
        self.subscriptions
            .fetch_sub(session.topics.len(), Ordering::Relaxed);
        debug!(
            connection = %id,
            topics = session.topics.len(),
            "Unregistered connection"
        );
        Some(Unregistered {
            username: session.username,
            topics: session.topics,
        })
    }

    /// Get a snapshot of a connection.
    #[must_use]
    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.sessions.get(id).map(|s| s.snapshot(id))
    }

    /// Get the username bound to a connection.
    #[must_use]
    pub fn username(&self, id: &ConnectionId) -> Option<String> {
        self.sessions.get(id).and_then(|s| s.username.clone())
    }

    /// Get the sending end of a connection's queue.
    #[must_use]
    pub fn outbox(&self, id: &ConnectionId) -> Option<Outbox> {
        self.sessions.get(id).map(|s| s.outbox.clone())
    }

    /// Whether a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no live connections.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of connections that have bound a username.
    #[must_use]
    pub fn identified_count(&self) -> usize {
        self.identified.load(Ordering::Relaxed)
    }

    /// Total topic subscriptions across all connections.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::Relaxed)
    }
}
