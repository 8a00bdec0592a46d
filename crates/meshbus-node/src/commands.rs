//! In-process cluster demos run by the `meshbus` binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;

use meshbus_collector::{Contributor, RequestConfig, Requester, Responder};
use meshbus_protocol::{Envelope, ServiceDetails};
use meshbus_topology::{ChannelMonitor, Topology};
use meshbus_transport::{MemoryBus, MemoryTransport, Transport};

use crate::config::NodeConfig;

/// Topic the topology demo wires its instances through.
pub const DEMO_TOPIC: &str = "orders:create";

fn connect(bus: &MemoryBus, name: String) -> Arc<MemoryTransport> {
    Arc::new(bus.connect(ServiceDetails::new(name)))
}

/// Start `instances` broadcasting instances, monitor from the first one and
/// return the aggregated topology after `duration`.
///
/// Even instances produce on [`DEMO_TOPIC`], odd ones consume from it.
pub async fn run_topology(config: &NodeConfig, instances: usize, duration: Duration) -> anyhow::Result<Topology> {
    anyhow::ensure!(instances > 0, "at least one instance is required");

    let bus = MemoryBus::new();
    let mut nodes = Vec::with_capacity(instances);
    for i in 0..instances {
        let transport = connect(&bus, format!("node-{i}"));
        let mut monitor = ChannelMonitor::new(transport.clone(), config.monitor.clone())?;
        monitor.start_broadcasting()?;
        nodes.push((transport, monitor));
    }
    nodes[0].1.start_monitoring()?;

    let mut subscriptions = Vec::new();
    for (i, (transport, _)) in nodes.iter().enumerate() {
        if i % 2 == 0 {
            let envelope = Envelope::base(DEMO_TOPIC, transport.service());
            transport.publish(DEMO_TOPIC, &envelope).await?;
        } else {
            subscriptions.push(transport.subscribe(DEMO_TOPIC)?);
        }
    }
    tracing::info!(instances, duration_ms = duration.as_millis() as u64, "Topology demo running");

    tokio::time::sleep(duration).await;
    Ok(nodes[0].1.info_by_topic().await)
}

/// Attach `responders` contributors to `topic`, scatter one request and return
/// the gathered payloads.
pub async fn run_request(
    config: &NodeConfig,
    responders: usize,
    topic: &str,
) -> anyhow::Result<Vec<serde_json::Value>> {
    let bus = MemoryBus::new();
    let mut contributors = Vec::with_capacity(responders);
    for i in 0..responders {
        let transport = connect(&bus, format!("responder-{i}"));
        let instance_id = transport.service().instance_id.clone();
        let handle = Contributor::attach(transport, topic, move |responder: Responder| {
            let instance_id = instance_id.clone();
            async move {
                if let Err(e) = responder.send(json!({ "responder": i, "instanceId": instance_id })).await {
                    tracing::warn!(error = %e, "Reply failed");
                }
            }
        })?;
        contributors.push(handle);
    }

    let requester = connect(&bus, "requester".to_string());
    let request = RequestConfig::new(topic).with_collector(config.collector.clone());
    let collected = Requester::new(requester, request)
        .publish()
        .await
        .collect()
        .await
        .context("Request failed")?;

    tracing::info!(payloads = collected.payload_messages.len(), "Request collected");
    Ok(collected.payloads().cloned().collect())
}
