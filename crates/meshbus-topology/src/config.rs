use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshbus_protocol::{
    DEFAULT_ANNOUNCE_TOPIC, DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_TOPIC,
};

use crate::MonitorError;

/// Channel monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub announce_on_topic: String,
    pub heartbeats_on_topic: String,
    /// Time responders get to answer a heartbeat.
    pub heartbeat_timeout_ms: u64,
    /// Time between heartbeats. Zero disables them.
    pub heartbeat_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            announce_on_topic: DEFAULT_ANNOUNCE_TOPIC.to_string(),
            heartbeats_on_topic: DEFAULT_HEARTBEAT_TOPIC.to_string(),
            heartbeat_timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }
}

impl MonitorConfig {
    /// `None` when heartbeats are disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    pub fn validate(&self) -> Result<(), MonitorError> {
        if self.announce_on_topic.is_empty() || self.heartbeats_on_topic.is_empty() {
            return Err(MonitorError::InvalidConfig("topics must not be empty".into()));
        }
        if self.heartbeat_interval_ms > 0 && self.heartbeat_timeout_ms >= self.heartbeat_interval_ms {
            return Err(MonitorError::InvalidConfig(format!(
                "heartbeat_timeout_ms ({}) must be below heartbeat_interval_ms ({})",
                self.heartbeat_timeout_ms, self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}
