//! Protocol versioning.
//!
//! Only the major version travels on the wire; a client is accepted when
//! its major matches the server's.

use serde::{Deserialize, Serialize};

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a client announcing `client_major` can talk to this version.
    #[must_use]
    pub fn accepts(&self, client_major: u8) -> bool {
        self.major == client_major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_same_major_only() {
        assert!(PROTOCOL_VERSION.accepts(1));
        assert!(!PROTOCOL_VERSION.accepts(2));
        assert!(!PROTOCOL_VERSION.accepts(0));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Version::new(1, 2).to_string(), "1.2");
    }
}
