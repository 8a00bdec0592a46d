use std::time::Duration;

use meshbus_node::commands::DEMO_TOPIC;
use meshbus_node::{run_request, run_topology, NodeConfig};

#[test]
fn test_load_partial_toml_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        "[collector]\nack_timeout_ms = 250\nwait_for_responses = 2\n\n[monitor]\nheartbeat_interval_ms = 0\n",
    )
    .unwrap();

    let config = NodeConfig::load(Some(&path)).unwrap();
    assert_eq!(config.collector.ack_timeout_ms, 250);
    assert_eq!(config.collector.wait_for_responses, Some(2));
    assert_eq!(config.collector.response_timeout_ms, 3000);
    assert_eq!(config.monitor.heartbeat_interval_ms, 0);
    assert_eq!(config.monitor.announce_on_topic, "_channels:announce");
}

#[test]
fn test_missing_explicit_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(NodeConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
}

#[test]
fn test_invalid_monitor_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[monitor]\nheartbeat_timeout_ms = 20000\n").unwrap();
    assert!(NodeConfig::load(Some(&path)).is_err());
}

#[test]
fn test_malformed_toml_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[collector\n").unwrap();
    assert!(NodeConfig::load_from(&path).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_request_demo_gathers_all_responders() {
    let mut config = NodeConfig::default();
    config.collector.wait_for_responses = Some(4);

    let payloads = run_request(&config, 4, "demo:request").await.unwrap();

    let mut responders: Vec<u64> = payloads.iter().map(|p| p["responder"].as_u64().unwrap()).collect();
    responders.sort_unstable();
    assert_eq!(responders, vec![0, 1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_request_demo_without_responders_times_out_empty() {
    let payloads = run_request(&NodeConfig::default(), 0, "demo:request").await.unwrap();
    assert!(payloads.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_topology_demo_discovers_roles() {
    let topology = run_topology(&NodeConfig::default(), 3, Duration::from_millis(6000))
        .await
        .unwrap();

    let info = &topology[DEMO_TOPIC];
    assert_eq!(info.producers.len(), 2);
    assert_eq!(info.consumers.len(), 1);
}
