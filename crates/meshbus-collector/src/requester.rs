//! Single-shot request: publish once, gather replies.

use std::sync::Arc;

use tokio::sync::mpsc;

use meshbus_protocol::Envelope;
use meshbus_transport::Transport;

use crate::collector::{AcceptFn, Collected, CollectorEvent};
use crate::config::CollectorConfig;
use crate::driver::{CollectorHandle, EventSender, ResponseCollector};
use crate::CollectorError;

/// What to publish and how to collect the replies.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    /// Topic the request is published on.
    pub namespace: String,
    pub tags: Vec<String>,
    pub collector: CollectorConfig,
}

impl RequestConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            tags: Vec::new(),
            collector: CollectorConfig::default(),
        }
    }

    pub fn with_collector(mut self, collector: CollectorConfig) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Publishes one request and drives a collector over its response topic.
pub struct Requester {
    transport: Arc<dyn Transport>,
    config: CollectorConfig,
    message: Envelope,
}

impl Requester {
    pub fn new(transport: Arc<dyn Transport>, config: RequestConfig) -> Self {
        let message = Envelope::request(&config.namespace, transport.service(), config.tags);
        Self {
            transport,
            config: config.collector,
            message,
        }
    }

    pub fn message(&self) -> &Envelope {
        &self.message
    }

    /// Mutable access to the request, e.g. to attach a payload before publishing.
    pub fn message_mut(&mut self) -> &mut Envelope {
        &mut self.message
    }

    /// Whether `envelope` is a reply to this request and not an echo of it.
    pub fn should_accept(&self, envelope: &Envelope) -> bool {
        accepts(&self.message.correlation_id, &self.message.tags, envelope)
    }

    /// Publish and collect, with notifications on a fresh channel.
    pub async fn publish(self) -> RequestHandle {
        let (tx, events) = mpsc::unbounded_channel();
        let collector = self.publish_to(tx).await;
        RequestHandle { events, collector }
    }

    /// Publish and collect, sending notifications to `observer`.
    ///
    /// Returns the running collection, or `None` when the request completed
    /// on publish (nothing to wait for) or failed to publish. Failures are
    /// reported as [`CollectorEvent::Error`].
    pub async fn publish_to(self, observer: EventSender) -> Option<CollectorHandle> {
        let namespace = self.message.topics.to.clone();

        if self.config.expects_nothing() {
            match self.transport.publish(&namespace, &self.message).await {
                Ok(()) => {
                    let _ = observer.send(CollectorEvent::End(Collected::default()));
                }
                Err(e) => {
                    tracing::warn!(topic = %namespace, error = %e, "Request publish failed");
                    let _ = observer.send(CollectorEvent::Error(e));
                }
            }
            return None;
        }

        let response_topic = match self.message.topics.response.clone() {
            Some(topic) => topic,
            None => namespace.clone(),
        };

        // Subscribe before publishing so fast responders cannot be missed.
        let subscription = match self.transport.subscribe(&response_topic) {
            Ok(sub) => sub,
            Err(e) => {
                tracing::warn!(topic = %response_topic, error = %e, "Response subscription failed");
                let _ = observer.send(CollectorEvent::Error(e));
                return None;
            }
        };

        let correlation_id = self.message.correlation_id.clone();
        let tags = self.message.tags.clone();
        let accept: Arc<AcceptFn> = Arc::new(move |env: &Envelope| accepts(&correlation_id, &tags, env));

        let handle = ResponseCollector::new(&self.config).listen_for_responses(
            subscription,
            Some(accept),
            observer.clone(),
        );

        if let Err(e) = self.transport.publish(&namespace, &self.message).await {
            tracing::warn!(topic = %namespace, error = %e, "Request publish failed");
            handle.cancel();
            let _ = observer.send(CollectorEvent::Error(e));
            return None;
        }

        tracing::debug!(
            topic = %namespace,
            correlation_id = %self.message.correlation_id,
            "Request published"
        );
        Some(handle)
    }
}

fn accepts(correlation_id: &str, tags: &[String], envelope: &Envelope) -> bool {
    envelope.correlation_id == correlation_id && !tags.iter().any(|t| *t == envelope.id)
}

/// Caller-side view of a published request.
pub struct RequestHandle {
    pub events: mpsc::UnboundedReceiver<CollectorEvent>,
    collector: Option<CollectorHandle>,
}

impl RequestHandle {
    /// Abandon the collection.
    pub fn cancel(&self) {
        if let Some(collector) = &self.collector {
            collector.cancel();
        }
    }

    /// Wait for the terminal notification, skipping partial results.
    pub async fn collect(mut self) -> Result<Collected, CollectorError> {
        while let Some(event) = self.events.recv().await {
            match event {
                CollectorEvent::End(collected) => return Ok(collected),
                CollectorEvent::Error(e) => return Err(CollectorError::Transport(e)),
                CollectorEvent::Payload(_) | CollectorEvent::Ack(_) => {}
            }
        }
        Err(CollectorError::Cancelled)
    }
}
