//! In-process broker.
//!
//! A [`MemoryBus`] is the shared "network"; every simulated instance obtains
//! its own [`MemoryTransport`] with [`MemoryBus::connect`], so producer and
//! consumer registrations (and the topic events they raise) stay per-instance
//! exactly as they would with a real broker connection.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, mpsc};

use meshbus_protocol::{Envelope, ServiceDetails};

use crate::{PublishFuture, Subscription, TopicEvent, Transport, TransportError, TOPIC_EVENT_CAPACITY};

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory topic fan-out.
#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Mutex<Subscribers>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection for one service instance.
    pub fn connect(&self, service: ServiceDetails) -> MemoryTransport {
        let (events, _) = broadcast::channel(TOPIC_EVENT_CAPACITY);
        MemoryTransport {
            bus: self.clone(),
            service,
            producers: Mutex::new(HashSet::new()),
            consumers: Mutex::new(HashSet::new()),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver raw bytes to every live subscriber of `topic`.
    ///
    /// Returns the number of subscribers reached. Subscribers that have been
    /// dropped are pruned.
    pub fn publish_raw(&self, topic: &str, data: Vec<u8>) -> usize {
        let mut topics = lock(&self.topics);
        let Some(subscribers) = topics.get_mut(topic) else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(data.clone()).is_ok());
        let delivered = subscribers.len();
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        delivered
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.topics)
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn register(&self, topic: &str) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.topics).entry(topic.to_string()).or_default().push(tx);
        rx
    }
}

/// One instance's connection to a [`MemoryBus`].
pub struct MemoryTransport {
    bus: MemoryBus,
    service: ServiceDetails,
    producers: Mutex<HashSet<String>>,
    consumers: Mutex<HashSet<String>>,
    events: broadcast::Sender<TopicEvent>,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Make every subsequent publish and subscribe fail with [`TransportError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }

    fn publish_now(&self, topic: &str, envelope: &Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut envelope = envelope.clone();
        envelope.complete_meta();
        let data = envelope.to_bytes()?;

        if lock(&self.producers).insert(topic.to_string()) {
            let _ = self.events.send(TopicEvent::NewProducerTopic(topic.to_string()));
        }

        let delivered = self.bus.publish_raw(topic, data);
        tracing::trace!(topic, delivered, id = %envelope.id, "Published envelope");
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn service(&self) -> &ServiceDetails {
        &self.service
    }

    fn publish<'a>(&'a self, topic: &'a str, envelope: &'a Envelope) -> PublishFuture<'a> {
        Box::pin(async move { self.publish_now(topic, envelope) })
    }

    fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let rx = self.bus.register(topic);
        if lock(&self.consumers).insert(topic.to_string()) {
            let _ = self.events.send(TopicEvent::NewConsumerTopic(topic.to_string()));
        }
        Ok(Subscription::new(topic.to_string(), rx, self.events.clone()))
    }

    fn producer_topics(&self) -> Vec<String> {
        lock(&self.producers).iter().cloned().collect()
    }

    fn consumer_topics(&self) -> Vec<String> {
        lock(&self.consumers).iter().cloned().collect()
    }

    fn topic_events(&self) -> broadcast::Receiver<TopicEvent> {
        self.events.subscribe()
    }
}
