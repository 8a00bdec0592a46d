use meshbus_protocol::{Envelope, ServiceDetails};
use meshbus_transport::{MemoryBus, TopicEvent, Transport};

#[tokio::test]
async fn test_first_producer_and_consumer_raise_events_once() {
    let bus = MemoryBus::new();
    let node = bus.connect(ServiceDetails::new("orders"));
    let mut events = node.topic_events();

    let _sub1 = node.subscribe("orders:create").unwrap();
    let _sub2 = node.subscribe("orders:create").unwrap();
    let msg = Envelope::base("orders:audit", node.service());
    node.publish("orders:audit", &msg).await.unwrap();
    node.publish("orders:audit", &msg).await.unwrap();

    assert_eq!(events.try_recv().unwrap(), TopicEvent::NewConsumerTopic("orders:create".into()));
    assert_eq!(events.try_recv().unwrap(), TopicEvent::NewProducerTopic("orders:audit".into()));
    assert!(events.try_recv().is_err(), "registrations are reported once per topic");
}

#[tokio::test]
async fn test_consumed_message_event_on_delivery() {
    let bus = MemoryBus::new();
    let producer = bus.connect(ServiceDetails::new("a"));
    let consumer = bus.connect(ServiceDetails::new("b"));

    let mut sub = consumer.subscribe("stock:update").unwrap();
    let mut events = consumer.topic_events();

    producer
        .publish("stock:update", &Envelope::base("stock:update", producer.service()))
        .await
        .unwrap();
    sub.recv().await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event, TopicEvent::ConsumedMessage("stock:update".into()));
    assert_eq!(event.topic(), "stock:update");
}

#[tokio::test]
async fn test_events_are_scoped_per_instance() {
    let bus = MemoryBus::new();
    let a = bus.connect(ServiceDetails::new("a"));
    let b = bus.connect(ServiceDetails::new("b"));
    let mut b_events = b.topic_events();

    let _sub = a.subscribe("orders:create").unwrap();
    assert!(b_events.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_messages_are_skipped() {
    let bus = MemoryBus::new();
    let node = bus.connect(ServiceDetails::new("a"));
    let mut sub = node.subscribe("x:y").unwrap();

    bus.publish_raw("x:y", b"garbage".to_vec());
    let good = Envelope::base("x:y", node.service());
    bus.publish_raw("x:y", serde_json::to_vec(&good).unwrap());

    let got = sub.recv().await.unwrap();
    assert_eq!(got.id, good.id);
}
