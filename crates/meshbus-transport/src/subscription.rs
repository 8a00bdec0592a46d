use tokio::sync::{broadcast, mpsc};

use meshbus_protocol::Envelope;

use crate::TopicEvent;

/// A live subscription to one topic.
///
/// Dropping the subscription detaches it from the topic.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    events: broadcast::Sender<TopicEvent>,
}

impl Subscription {
    pub fn new(
        topic: String,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        events: broadcast::Sender<TopicEvent>,
    ) -> Self {
        Self { topic, rx, events }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next well-formed envelope.
    ///
    /// Malformed messages are dropped. Returns `None` once the topic is gone.
    /// Cancel safe: nothing is lost if the future is dropped before completion.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let data = self.rx.recv().await?;
            let _ = self
                .events
                .send(TopicEvent::ConsumedMessage(self.topic.clone()));

            match Envelope::from_slice(&data) {
                Ok(envelope) => return Some(envelope),
                Err(e) => {
                    tracing::debug!(topic = %self.topic, error = %e, "Dropping malformed envelope");
                }
            }
        }
    }
}
