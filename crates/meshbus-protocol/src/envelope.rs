use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::service::ServiceDetails;
use crate::topic::response_topic;

/// Acknowledgement block attached by a responder.
///
/// An ack lets a responder tell the requester how much longer to wait and
/// how many more replies to expect from it. Both hints are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub responder_id: String,
    /// Deadline hint in milliseconds, relative to the start of the collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Positive: more replies coming. Zero: done. Negative: replies consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responses_remaining: Option<i64>,
}

impl Ack {
    pub fn new(responder_id: impl Into<String>) -> Self {
        Self {
            responder_id: responder_id.into(),
            timeout_ms: None,
            responses_remaining: None,
        }
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_responses_remaining(mut self, remaining: i64) -> Self {
        self.responses_remaining = Some(remaining);
        self
    }
}

/// Routing block of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topics {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// Sender metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
    pub service_details: ServiceDetails,
}

/// Transport-level message unit.
///
/// A response without a payload is a pure acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub correlation_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub topics: Topics,
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<Ack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Envelope {
    /// A fresh message addressed to `namespace`, with new id and correlation id.
    pub fn base(namespace: &str, service: &ServiceDetails) -> Self {
        Self {
            id: new_id(),
            correlation_id: new_id(),
            tags: Vec::new(),
            topics: Topics {
                to: namespace.to_string(),
                response: None,
            },
            meta: Meta {
                created_at: Utc::now(),
                published_at: None,
                service_details: service.clone(),
            },
            ack: None,
            payload: None,
        }
    }

    /// A request on `namespace` whose replies are routed back to this instance.
    pub fn request(namespace: &str, service: &ServiceDetails, tags: Vec<String>) -> Self {
        let mut envelope = Self::base(namespace, service);
        envelope.tags = tags;
        envelope.topics.response = Some(response_topic(namespace, &service.instance_id));
        envelope
    }

    /// A reply to `request`, correlated with it and addressed to its response topic.
    pub fn response_to(request: &Envelope, service: &ServiceDetails) -> Result<Self, ProtocolError> {
        let to = request
            .topics
            .response
            .clone()
            .ok_or_else(|| ProtocolError::MissingResponseTopic(request.id.clone()))?;

        let mut envelope = Self::base(&to, service);
        envelope.correlation_id = request.correlation_id.clone();
        envelope.tags = request.tags.clone();
        Ok(envelope)
    }

    /// Stamp the publish time. Called right before the envelope leaves.
    pub fn complete_meta(&mut self) {
        self.meta.published_at = Some(Utc::now());
    }

    /// Instance that sent this envelope.
    pub fn instance_id(&self) -> &str {
        &self.meta.service_details.instance_id
    }

    pub fn is_ack_only(&self) -> bool {
        self.payload.is_none()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
