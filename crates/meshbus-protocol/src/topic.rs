//! Topic naming helpers.

use crate::constants::INTERNAL_TOPIC_PREFIX;

/// Topic on which replies to requests sent on `namespace` by `instance_id` arrive.
pub fn response_topic(namespace: &str, instance_id: &str) -> String {
    format!("{namespace}:response:{instance_id}")
}

/// Whether a topic is reserved for protocol traffic (heartbeats, announces, ...).
pub fn is_internal(topic: &str) -> bool {
    topic.starts_with(INTERNAL_TOPIC_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_topic_includes_instance() {
        assert_eq!(response_topic("orders:create", "abc"), "orders:create:response:abc");
    }

    #[test]
    fn test_internal_topics() {
        assert!(is_internal("_channels:announce"));
        assert!(!is_internal("orders:create"));
        assert!(!is_internal(""));
    }
}
