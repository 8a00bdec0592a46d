use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use meshbus_collector::{
    AckHint, CollectorConfig, CollectorError, CollectorEvent, Contributor, RequestConfig,
    Requester, Responder,
};
use meshbus_protocol::{Envelope, ServiceDetails};
use meshbus_transport::{MemoryBus, MemoryTransport, Transport};

fn node(bus: &MemoryBus, name: &str) -> Arc<MemoryTransport> {
    Arc::new(bus.connect(ServiceDetails::new(name)))
}

#[tokio::test(start_paused = true)]
async fn test_request_gathers_every_contributor() {
    let bus = MemoryBus::new();
    let mut contributors = Vec::new();
    for i in 0..3 {
        let transport = node(&bus, &format!("stock-{i}"));
        let handle = Contributor::attach(transport, "stock:check", move |responder: Responder| async move {
            let _ = responder.send(json!({ "shard": i })).await;
        })
        .unwrap();
        contributors.push(handle);
    }

    let requester = node(&bus, "orders");
    let config = RequestConfig::new("stock:check")
        .with_collector(CollectorConfig::default().with_wait_for_responses(3));
    let start = Instant::now();
    let collected = Requester::new(requester, config).publish().await.collect().await.unwrap();

    let mut shards: Vec<i64> = collected
        .payloads()
        .map(|p| p["shard"].as_i64().unwrap())
        .collect();
    shards.sort_unstable();
    assert_eq!(shards, vec![0, 1, 2]);
    assert!(start.elapsed() < Duration::from_millis(10));
}

#[tokio::test(start_paused = true)]
async fn test_slow_contributor_buys_time_with_ack() {
    let bus = MemoryBus::new();
    let transport = node(&bus, "reports");
    let _slow = Contributor::attach(transport, "reports:build", |responder: Responder| async move {
        responder
            .ack(AckHint { timeout_ms: Some(8000), responses_remaining: 1 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(6000)).await;
        responder.send(json!("report")).await.unwrap();
    })
    .unwrap();

    let requester = node(&bus, "dashboard");
    let start = Instant::now();
    let config = RequestConfig::new("reports:build")
        .with_collector(CollectorConfig::default().with_wait_for_responses(1));
    let mut handle = Requester::new(requester, config).publish().await;

    let mut payloads = Vec::new();
    let mut acks = 0;
    while let Some(event) = handle.events.recv().await {
        match event {
            CollectorEvent::Ack(_) => acks += 1,
            CollectorEvent::Payload(env) => payloads.push(env.payload.unwrap()),
            CollectorEvent::End(_) => break,
            CollectorEvent::Error(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(acks, 1);
    assert_eq!(payloads, vec![json!("report")]);
    let ms = start.elapsed().as_millis();
    assert!((6000..6010).contains(&ms), "ended after {ms}ms");
}

#[tokio::test(start_paused = true)]
async fn test_slow_reply_does_not_hold_up_other_requests() {
    let bus = MemoryBus::new();
    let transport = node(&bus, "reports");
    let _slow = Contributor::attach(transport, "reports:build", |responder: Responder| async move {
        responder
            .ack(AckHint { timeout_ms: Some(8000), responses_remaining: 1 })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(6000)).await;
        responder.send(json!("report")).await.unwrap();
    })
    .unwrap();

    let config = RequestConfig::new("reports:build")
        .with_collector(CollectorConfig::default().with_wait_for_responses(1));
    let first = Requester::new(node(&bus, "dashboard-a"), config.clone()).publish().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = Requester::new(node(&bus, "dashboard-b"), config).publish().await;

    let (first, second) = tokio::join!(first.collect(), second.collect());
    for collected in [first.unwrap(), second.unwrap()] {
        assert_eq!(collected.ack_messages.len(), 1);
        assert_eq!(collected.payloads().cloned().collect::<Vec<_>>(), vec![json!("report")]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_ack_window_without_expected_count_keeps_request_open() {
    let bus = MemoryBus::new();
    let transport = node(&bus, "stock");
    let _contributor = Contributor::attach(transport, "stock:check", |responder: Responder| async move {
        responder.ack(AckHint::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        responder.send(json!({ "level": 7 })).await.unwrap();
    })
    .unwrap();

    let config = RequestConfig::new("stock:check").with_collector(
        CollectorConfig::default()
            .with_wait_for_responses(0)
            .with_ack_timeout_ms(800),
    );
    assert!(!config.collector.expects_nothing());

    let start = Instant::now();
    let collected = Requester::new(node(&bus, "orders"), config).publish().await.collect().await.unwrap();

    assert_eq!(collected.ack_messages.len(), 1);
    assert_eq!(collected.payload_messages.len(), 1);
    let ms = start.elapsed().as_millis();
    assert!((800..810).contains(&ms), "ended after {ms}ms");
}

#[tokio::test(start_paused = true)]
async fn test_expecting_no_responses_ends_on_publish() {
    let bus = MemoryBus::new();
    let requester = node(&bus, "audit");
    let watcher = bus.connect(ServiceDetails::new("watcher"));
    let mut requests = watcher.subscribe("audit:log").unwrap();

    let config = RequestConfig::new("audit:log")
        .with_collector(CollectorConfig::default().with_wait_for_responses(0));
    let collected = Requester::new(requester, config).publish().await.collect().await.unwrap();

    assert!(collected.payload_messages.is_empty());
    assert!(requests.recv().await.is_some(), "request still published");
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_is_reported_as_error() {
    let bus = MemoryBus::new();
    let requester = node(&bus, "orders");
    requester.close();

    let result = Requester::new(requester, RequestConfig::new("stock:check"))
        .publish()
        .await
        .collect()
        .await;

    assert!(matches!(result, Err(CollectorError::Transport(_))));
}

#[tokio::test(start_paused = true)]
async fn test_should_accept_filters_foreign_and_echoed_envelopes() {
    let bus = MemoryBus::new();
    let requester_transport = node(&bus, "orders");
    let responder = bus.connect(ServiceDetails::new("stock"));
    let origin = Envelope::base("orders:created", responder.service());

    let requester = Requester::new(
        requester_transport,
        RequestConfig::new("stock:check").with_tags(vec![origin.id.clone()]),
    );
    let request = requester.message().clone();

    let reply = Envelope::response_to(&request, responder.service()).unwrap();
    assert!(requester.should_accept(&reply));

    let foreign = Envelope::base("x", responder.service());
    assert!(!requester.should_accept(&foreign));

    let mut echo = origin.clone();
    echo.correlation_id = request.correlation_id.clone();
    assert!(!requester.should_accept(&echo), "envelope named in tags is an echo");
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_request_yields_cancelled() {
    let bus = MemoryBus::new();
    let requester = node(&bus, "orders");
    let handle = Requester::new(requester, RequestConfig::new("stock:check")).publish().await;

    handle.cancel();
    assert!(matches!(handle.collect().await, Err(CollectorError::Cancelled)));
}

#[tokio::test(start_paused = true)]
async fn test_contributor_ignores_requests_without_response_topic() {
    let bus = MemoryBus::new();
    let transport = node(&bus, "stock");
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    let _contributor = Contributor::attach(transport, "stock:check", move |responder: Responder| {
        let seen_tx = seen_tx.clone();
        async move {
            let _ = seen_tx.send(responder.request().id.clone());
        }
    })
    .unwrap();

    let publisher = bus.connect(ServiceDetails::new("orders"));
    let plain = Envelope::base("stock:check", publisher.service());
    publisher.publish("stock:check", &plain).await.unwrap();
    let request = Envelope::request("stock:check", publisher.service(), vec![]);
    publisher.publish("stock:check", &request).await.unwrap();

    assert_eq!(seen_rx.recv().await, Some(request.id.clone()));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(seen_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_ended_contributor_detaches() {
    let bus = MemoryBus::new();
    let transport = node(&bus, "stock");
    let contributor = Contributor::attach(transport, "stock:check", |_responder: Responder| async {}).unwrap();
    assert_eq!(bus.subscriber_count("stock:check"), 1);

    contributor.end();
    contributor.end();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(contributor.is_finished());
    assert_eq!(bus.subscriber_count("stock:check"), 0);
}
