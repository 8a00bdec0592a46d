//! Publish/subscribe transport seam.
//!
//! The collector and the channel monitor only need three things from the
//! underlying broker: publish an envelope on a topic, subscribe to a topic,
//! and learn when this process starts producing or consuming a topic. The
//! [`Transport`] trait captures exactly that; [`MemoryBus`] implements it
//! in-process for tests and local clusters.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

use meshbus_protocol::{Envelope, ServiceDetails};

pub mod memory;
pub mod subscription;

pub use memory::{MemoryBus, MemoryTransport};
pub use subscription::Subscription;

/// Capacity of the per-transport topic event channel.
pub const TOPIC_EVENT_CAPACITY: usize = 1024;

/// Errors surfaced by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] meshbus_protocol::ProtocolError),
}

/// Local producer/consumer activity reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicEvent {
    /// This process published on the topic for the first time.
    NewProducerTopic(String),
    /// This process subscribed to the topic for the first time.
    NewConsumerTopic(String),
    /// A message on the topic was delivered to a local subscriber.
    ConsumedMessage(String),
}

impl TopicEvent {
    pub fn topic(&self) -> &str {
        match self {
            Self::NewProducerTopic(t) | Self::NewConsumerTopic(t) | Self::ConsumedMessage(t) => t,
        }
    }
}

/// Boxed future returned by [`Transport::publish`].
pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + 'a>>;

/// A connection to the publish/subscribe broker, scoped to one service instance.
pub trait Transport: Send + Sync {
    /// Identity stamped on envelopes created by this instance.
    fn service(&self) -> &ServiceDetails;

    /// Publish `envelope` on `topic`.
    ///
    /// The first publish on a topic registers this instance as a producer
    /// and raises [`TopicEvent::NewProducerTopic`].
    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> PublishFuture<'a>;

    /// Start receiving envelopes published on `topic`.
    ///
    /// The first subscription on a topic raises [`TopicEvent::NewConsumerTopic`].
    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    /// Topics this instance has published on.
    fn producer_topics(&self) -> Vec<String>;

    /// Topics this instance has subscribed to.
    fn consumer_topics(&self) -> Vec<String>;

    /// Stream of local producer/consumer activity.
    fn topic_events(&self) -> broadcast::Receiver<TopicEvent>;
}
