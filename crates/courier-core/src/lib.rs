//! # courier-core
//!
//! Connection bookkeeping and message routing for the Courier chat and
//! notification server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Session** - Live connections, their usernames and subscriptions
//! - **Broker** - Topic pub/sub fan-out
//! - **Users** - Username to connection routing for targeted delivery
//! - **Presence** - Connect, identify and disconnect lifecycle with JOIN/LEAVE
//! - **Dispatcher** - Validation, stamping and routing of inbound messages
//! - **Hub** - One handle over all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│ Dispatcher  │────▶│   Broker    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   ▲
//!                            ▼                   │
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │  Presence   │────▶│    Users    │
//!                     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │  Sessions   │
//!                     └─────────────┘
//! ```
//!
//! Every connection owns a bounded [`Mailbox`]. Routing code only ever
//! writes to the matching [`Outbox`] without waiting, so a slow reader
//! loses messages instead of stalling everyone else.

pub mod broker;
pub mod dispatcher;
pub mod hub;
pub mod message;
pub mod outbox;
pub mod presence;
pub mod session;
pub mod topics;
pub mod users;

pub use broker::TopicBroker;
pub use dispatcher::{DispatchError, Dispatcher, Inbound, NotificationDraft, Receipt};
pub use hub::{Hub, HubConfig, HubStats};
pub use message::{stamp, Delivery, Payload};
pub use outbox::{outbox, DeliveryError, DeliveryReport, Mailbox, Outbox};
pub use presence::{Departure, Identification, PresenceCoordinator, PresenceError, PresenceState};
pub use session::{Connection, ConnectionId, RegistryError, SessionRegistry};
pub use topics::{CHAT_TOPIC, NOTIFICATION_TOPIC, USER_NOTIFICATION_DESTINATION};
pub use users::UserRouter;
