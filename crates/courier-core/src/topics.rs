//! Well-known destinations and topic name rules.

/// Broadcast topic for chat traffic and presence announcements.
pub const CHAT_TOPIC: &str = "/topic/public";

/// Broadcast topic for untargeted notifications.
pub const NOTIFICATION_TOPIC: &str = "/topic/notifications";

/// Destination stamped on notifications routed to a single user.
pub const USER_NOTIFICATION_DESTINATION: &str = "/user/queue/notifications";

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("Topic name too long");
    }
    if name.starts_with('$') {
        return Err("Topic names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic name contains invalid characters");
    }
    Ok(())
}

/// Whether presence announcements are published on this topic.
///
/// Every topic except the notification broadcast carries chat traffic.
#[must_use]
pub fn carries_presence(name: &str) -> bool {
    name != NOTIFICATION_TOPIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name_validation() {
        assert!(validate_topic_name(CHAT_TOPIC).is_ok());
        assert!(validate_topic_name("room:42").is_ok());
        assert!(validate_topic_name("").is_err());
        assert!(validate_topic_name("$sys").is_err());
        assert!(validate_topic_name("tab\there").is_err());
        assert!(validate_topic_name(&"a".repeat(MAX_TOPIC_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_carries_presence() {
        assert!(carries_presence(CHAT_TOPIC));
        assert!(carries_presence("room:42"));
        assert!(!carries_presence(NOTIFICATION_TOPIC));
    }
}
