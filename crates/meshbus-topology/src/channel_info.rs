use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use meshbus_protocol::is_internal;
use meshbus_transport::TopicEvent;

/// One process's own view of a topic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalChannelInfo {
    pub producers: bool,
    pub consumers: bool,
    pub last_consumed_at: Option<DateTime<Utc>>,
}

/// A topic as seen across the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelInfo {
    /// Instance ids that publish on the topic.
    pub producers: BTreeSet<String>,
    /// Instance ids that subscribe to the topic.
    pub consumers: BTreeSet<String>,
    pub last_consumed_at: Option<DateTime<Utc>>,
}

pub type LocalTopology = BTreeMap<String, LocalChannelInfo>;
pub type Topology = BTreeMap<String, ChannelInfo>;

/// Payload of heartbeat replies and announcements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelReport {
    #[serde(default)]
    pub info_by_topic: LocalTopology,
}

/// Merge one instance's local report into an aggregated topology.
///
/// Instance ids are only ever added, and `last_consumed_at` only moves
/// forward, so merging is idempotent and order-independent.
pub fn merge_channel_info(target: &mut Topology, remote: &LocalTopology, instance_id: &str) {
    for (topic, info) in remote {
        let entry = target.entry(topic.clone()).or_default();
        if info.producers {
            entry.producers.insert(instance_id.to_string());
        }
        if info.consumers {
            entry.consumers.insert(instance_id.to_string());
        }
        entry.last_consumed_at = entry.last_consumed_at.max(info.last_consumed_at);
    }
}

/// Apply a transport topic event to the local topology.
///
/// Internal topics are ignored. Returns `true` when the event registered a
/// new producer or consumer role, which is worth announcing.
pub fn apply_topic_event(local: &mut LocalTopology, event: &TopicEvent, now: DateTime<Utc>) -> bool {
    let topic = event.topic();
    if is_internal(topic) {
        return false;
    }

    let entry = local.entry(topic.to_string()).or_default();
    match event {
        TopicEvent::NewProducerTopic(_) => {
            entry.producers = true;
            true
        }
        TopicEvent::NewConsumerTopic(_) => {
            entry.consumers = true;
            true
        }
        TopicEvent::ConsumedMessage(_) => {
            entry.last_consumed_at = Some(now);
            false
        }
    }
}

/// Mark every non-internal topic in `producers` and `consumers` with its role.
///
/// Used to recover registrations whose topic events were lost. Returns
/// `true` when any role was newly set.
pub fn resync_local_roles(local: &mut LocalTopology, producers: &[String], consumers: &[String]) -> bool {
    let mut changed = false;
    for topic in producers.iter().filter(|t| !is_internal(t)) {
        let entry = local.entry(topic.clone()).or_default();
        changed |= !entry.producers;
        entry.producers = true;
    }
    for topic in consumers.iter().filter(|t| !is_internal(t)) {
        let entry = local.entry(topic.clone()).or_default();
        changed |= !entry.consumers;
        entry.consumers = true;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_consumed_message_does_not_ask_for_announce() {
        let mut local = LocalTopology::new();
        let announce = apply_topic_event(&mut local, &TopicEvent::ConsumedMessage("a".into()), at(10));
        assert!(!announce);
        assert_eq!(local["a"].last_consumed_at, Some(at(10)));
        assert!(!local["a"].producers);
    }

    #[test]
    fn test_internal_topics_are_not_tracked() {
        let mut local = LocalTopology::new();
        assert!(!apply_topic_event(&mut local, &TopicEvent::NewProducerTopic("_channels:announce".into()), at(1)));
        assert!(local.is_empty());
    }

    #[test]
    fn test_resync_restores_missing_roles_only() {
        let mut local = LocalTopology::new();
        local.insert("a".into(), LocalChannelInfo { producers: true, ..Default::default() });

        let producers = vec!["a".to_string(), "_channels:announce".to_string()];
        let consumers = vec!["b".to_string()];
        assert!(resync_local_roles(&mut local, &producers, &consumers));
        assert!(local["b"].consumers);
        assert!(!local.contains_key("_channels:announce"));

        assert!(!resync_local_roles(&mut local, &producers, &consumers));
    }

    #[test]
    fn test_report_wire_shape() {
        let mut report = ChannelReport::default();
        report.info_by_topic.insert(
            "orders:create".into(),
            LocalChannelInfo { producers: true, ..Default::default() },
        );
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["infoByTopic"]["orders:create"]["producers"], true);
        assert!(json["infoByTopic"]["orders:create"]["lastConsumedAt"].is_null());
    }
}
