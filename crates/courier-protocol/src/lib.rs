//! # courier-protocol
//!
//! Wire protocol for the Courier chat and notification router.
//!
//! ## Frame Types
//!
//! - `subscribe` / `unsubscribe` - Topic membership
//! - `join` / `send` / `notify` - Client messages
//! - `message` / `notification` - Server pushes
//! - `ack` / `error` - Request outcomes
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Frame};
//!
//! let frame = Frame::send("alice", "hello");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), frame);
//!
//! let text = codec::encode_json(&frame).unwrap();
//! assert_eq!(codec::decode_json(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod model;
pub mod version;

pub use codec::{decode, encode, ProtocolError, WireFormat};
pub use frames::{codes, Frame, FrameType};
pub use model::{ChatMessage, MessageKind, Notification, Severity};
pub use version::{Version, PROTOCOL_VERSION};
