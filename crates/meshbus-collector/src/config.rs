use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshbus_protocol::DEFAULT_RESPONSE_TIMEOUT_MS;

/// Settings for one scatter-gather collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Overall deadline, measured from the start of the collection.
    pub response_timeout_ms: u64,
    /// Grace window extended by acks. Zero disables it.
    pub ack_timeout_ms: u64,
    /// Number of responses to wait for. `None` waits until the deadline.
    pub wait_for_responses: Option<u64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            ack_timeout_ms: 0,
            wait_for_responses: None,
        }
    }
}

impl CollectorConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms))
    }

    pub fn with_response_timeout_ms(mut self, ms: u64) -> Self {
        self.response_timeout_ms = ms;
        self
    }

    pub fn with_ack_timeout_ms(mut self, ms: u64) -> Self {
        self.ack_timeout_ms = ms;
        self
    }

    pub fn with_wait_for_responses(mut self, count: u64) -> Self {
        self.wait_for_responses = Some(count);
        self
    }

    /// Whether a request with this config is complete as soon as it is published.
    pub fn expects_nothing(&self) -> bool {
        self.wait_for_responses == Some(0) && self.ack_timeout().is_none()
    }
}
