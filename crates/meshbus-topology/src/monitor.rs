//! Cluster channel topology via heartbeat and announce gossip.
//!
//! Lifecycle:
//! 1. `new()` validates the config; nothing runs yet.
//! 2. `start_broadcasting()` tracks this instance's own topic usage, answers
//!    heartbeats with it and announces every new producer or consumer role.
//! 3. `start_monitoring()` listens for announcements and, unless the interval
//!    is zero, opens a heartbeat round on every tick. A closed round replaces
//!    the aggregated topology with what it gathered.
//! 4. `stop_*()` undo the matching start. Dropping the monitor stops both.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Interval;

use meshbus_collector::{
    CollectorConfig, CollectorEvent, Contributor, ContributorHandle, RequestConfig, RequestHandle,
    Requester, Responder,
};
use meshbus_protocol::Envelope;
use meshbus_transport::{Subscription, TopicEvent, Transport};

use crate::channel_info::{
    apply_topic_event, merge_channel_info, resync_local_roles, ChannelReport, LocalTopology,
    Topology,
};
use crate::config::MonitorConfig;
use crate::MonitorError;

/// Buffered `updated` notifications per subscriber.
pub const UPDATES_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct MonitorState {
    local: LocalTopology,
    aggregated: Topology,
    /// Accumulator of the heartbeat round in progress.
    collecting: Option<Topology>,
}

enum Broadcasting {
    Stopped,
    Running {
        contributor: ContributorHandle,
        topic_events: JoinHandle<()>,
    },
}

enum Monitoring {
    Stopped,
    Running {
        control: mpsc::UnboundedSender<MonitorCommand>,
        task: JoinHandle<()>,
    },
}

#[derive(Debug, Clone, Copy)]
enum MonitorCommand {
    Heartbeat,
    Stop,
}

pub struct ChannelMonitor {
    transport: Arc<dyn Transport>,
    config: MonitorConfig,
    state: Arc<RwLock<MonitorState>>,
    updates: broadcast::Sender<Topology>,
    broadcasting: Broadcasting,
    monitoring: Monitoring,
}

impl ChannelMonitor {
    pub fn new(transport: Arc<dyn Transport>, config: MonitorConfig) -> Result<Self, MonitorError> {
        config.validate()?;
        let (updates, _) = broadcast::channel(UPDATES_CAPACITY);
        Ok(Self {
            transport,
            config,
            state: Arc::new(RwLock::new(MonitorState::default())),
            updates,
            broadcasting: Broadcasting::Stopped,
            monitoring: Monitoring::Stopped,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_broadcasting(&self) -> bool {
        matches!(self.broadcasting, Broadcasting::Running { .. })
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(self.monitoring, Monitoring::Running { .. })
    }

    /// Receive the aggregated topology every time it changes.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Topology> {
        self.updates.subscribe()
    }

    /// Cluster-wide topology as last gathered.
    pub async fn info_by_topic(&self) -> Topology {
        self.state.read().await.aggregated.clone()
    }

    /// This instance's own topic usage.
    pub async fn local_info_by_topic(&self) -> LocalTopology {
        self.state.read().await.local.clone()
    }

    /// Start tracking local topics and answering heartbeats. No-op if running.
    pub fn start_broadcasting(&mut self) -> Result<(), MonitorError> {
        if self.is_broadcasting() {
            return Ok(());
        }

        let state = self.state.clone();
        let contributor = Contributor::attach(
            self.transport.clone(),
            &self.config.heartbeats_on_topic,
            move |responder: Responder| {
                let state = state.clone();
                async move { answer_heartbeat(responder, &state).await }
            },
        )?;

        let events = self.transport.topic_events();
        let topic_events = tokio::spawn(track_local_topics(
            self.transport.clone(),
            self.config.announce_on_topic.clone(),
            self.state.clone(),
            events,
        ));

        self.broadcasting = Broadcasting::Running { contributor, topic_events };
        tracing::info!(
            instance_id = %self.transport.service().instance_id,
            topic = %self.config.heartbeats_on_topic,
            "Channel broadcasting started"
        );
        Ok(())
    }

    /// Stop answering heartbeats and tracking local topics. No-op if stopped.
    pub fn stop_broadcasting(&mut self) {
        if let Broadcasting::Running { contributor, topic_events } =
            std::mem::replace(&mut self.broadcasting, Broadcasting::Stopped)
        {
            contributor.end();
            topic_events.abort();
            tracing::info!("Channel broadcasting stopped");
        }
    }

    /// Announce the local topology to all monitors.
    pub async fn do_broadcast(&self) -> Result<(), MonitorError> {
        announce(self.transport.as_ref(), &self.config.announce_on_topic, &self.state).await
    }

    /// Start listening for announcements and running heartbeat rounds.
    /// No-op if running.
    pub fn start_monitoring(&mut self) -> Result<(), MonitorError> {
        if self.is_monitoring() {
            return Ok(());
        }

        let announcements = self.transport.subscribe(&self.config.announce_on_topic)?;
        let (control, commands) = mpsc::unbounded_channel();
        let run_loop = MonitorLoop {
            transport: self.transport.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            updates: self.updates.clone(),
        };
        let task = tokio::spawn(run_loop.run(announcements, commands));

        self.monitoring = Monitoring::Running { control, task };
        tracing::info!(
            topic = %self.config.announce_on_topic,
            heartbeat_interval_ms = self.config.heartbeat_interval_ms,
            "Channel monitoring started"
        );
        Ok(())
    }

    /// Stop monitoring and abandon any open heartbeat round. No-op if stopped.
    pub fn stop_monitoring(&mut self) {
        if let Monitoring::Running { control, task } =
            std::mem::replace(&mut self.monitoring, Monitoring::Stopped)
        {
            if control.send(MonitorCommand::Stop).is_err() {
                task.abort();
            }
        }
    }

    /// Open a heartbeat round now, superseding any round still open.
    pub fn do_heartbeat(&self) -> Result<(), MonitorError> {
        match &self.monitoring {
            Monitoring::Running { control, .. } => control
                .send(MonitorCommand::Heartbeat)
                .map_err(|_| MonitorError::NotMonitoring),
            Monitoring::Stopped => Err(MonitorError::NotMonitoring),
        }
    }
}

impl Drop for ChannelMonitor {
    fn drop(&mut self) {
        self.stop_broadcasting();
        self.stop_monitoring();
    }
}

async fn answer_heartbeat(responder: Responder, state: &RwLock<MonitorState>) {
    let report = ChannelReport {
        info_by_topic: state.read().await.local.clone(),
    };
    let payload = match serde_json::to_value(&report) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to encode heartbeat reply");
            return;
        }
    };
    if let Err(e) = responder.send(payload).await {
        tracing::debug!(error = %e, "Heartbeat reply failed");
    }
}

async fn announce(
    transport: &dyn Transport,
    topic: &str,
    state: &RwLock<MonitorState>,
) -> Result<(), MonitorError> {
    let report = ChannelReport {
        info_by_topic: state.read().await.local.clone(),
    };
    let mut envelope = Envelope::base(topic, transport.service());
    envelope.payload = Some(serde_json::to_value(&report)?);
    transport.publish(topic, &envelope).await?;
    Ok(())
}

async fn track_local_topics(
    transport: Arc<dyn Transport>,
    announce_topic: String,
    state: Arc<RwLock<MonitorState>>,
    mut events: broadcast::Receiver<TopicEvent>,
) {
    loop {
        let registered = match events.recv().await {
            Ok(event) => {
                let registered = apply_topic_event(&mut state.write().await.local, &event, Utc::now());
                if registered {
                    tracing::debug!(topic = %event.topic(), "Local channel registered");
                }
                registered
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Topic events lagged; resyncing local roles");
                let producers = transport.producer_topics();
                let consumers = transport.consumer_topics();
                resync_local_roles(&mut state.write().await.local, &producers, &consumers)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        if registered {
            if let Err(e) = announce(transport.as_ref(), &announce_topic, &state).await {
                tracing::debug!(error = %e, "Announce failed");
            }
        }
    }
}

struct MonitorLoop {
    transport: Arc<dyn Transport>,
    config: MonitorConfig,
    state: Arc<RwLock<MonitorState>>,
    updates: broadcast::Sender<Topology>,
}

impl MonitorLoop {
    async fn run(
        self,
        mut announcements: Subscription,
        mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
    ) {
        let mut heartbeat = self.config.heartbeat_interval().map(tokio::time::interval);
        let mut round: Option<RequestHandle> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Heartbeat) => self.open_round(&mut round).await,
                    Some(MonitorCommand::Stop) | None => break,
                },
                envelope = announcements.recv() => match envelope {
                    Some(envelope) => self.on_announcement(&envelope).await,
                    None => {
                        tracing::warn!("Announce topic closed");
                        break;
                    }
                },
                _ = next_tick(&mut heartbeat) => self.open_round(&mut round).await,
                event = next_round_event(&mut round) => self.on_round_event(event, &mut round).await,
            }
        }

        if let Some(open) = round.take() {
            open.cancel();
        }
        self.state.write().await.collecting = None;
        tracing::info!("Channel monitoring stopped");
    }

    async fn open_round(&self, round: &mut Option<RequestHandle>) {
        if let Some(previous) = round.take() {
            tracing::debug!("Superseding open heartbeat round");
            previous.cancel();
        }
        let report = {
            let mut state = self.state.write().await;
            state.collecting = Some(Topology::new());
            ChannelReport { info_by_topic: state.local.clone() }
        };

        let collector = CollectorConfig::default().with_response_timeout_ms(self.config.heartbeat_timeout_ms);
        let request = RequestConfig::new(self.config.heartbeats_on_topic.clone()).with_collector(collector);
        let mut requester = Requester::new(self.transport.clone(), request);
        match serde_json::to_value(&report) {
            Ok(payload) => requester.message_mut().payload = Some(payload),
            Err(e) => tracing::warn!(error = %e, "Failed to encode heartbeat report"),
        }
        tracing::debug!(
            topic = %self.config.heartbeats_on_topic,
            correlation_id = %requester.message().correlation_id,
            timeout_ms = self.config.heartbeat_timeout_ms,
            "Heartbeat round opened"
        );
        *round = Some(requester.publish().await);
    }

    async fn on_round_event(&self, event: Option<CollectorEvent>, round: &mut Option<RequestHandle>) {
        match event {
            Some(CollectorEvent::Payload(envelope)) => {
                let Some(report) = report_from(&envelope) else {
                    return;
                };
                if let Some(collecting) = self.state.write().await.collecting.as_mut() {
                    merge_channel_info(collecting, &report.info_by_topic, envelope.instance_id());
                }
            }
            Some(CollectorEvent::Ack(_)) => {}
            Some(CollectorEvent::End(collected)) => {
                *round = None;
                let snapshot = {
                    let mut state = self.state.write().await;
                    state.aggregated = state.collecting.take().unwrap_or_default();
                    state.aggregated.clone()
                };
                tracing::debug!(replies = collected.payload_messages.len(), "Heartbeat round closed");
                self.emit_updated(snapshot);
            }
            Some(CollectorEvent::Error(e)) => {
                tracing::warn!(error = %e, "Heartbeat request failed");
                *round = None;
                self.state.write().await.collecting = None;
            }
            None => {
                *round = None;
                self.state.write().await.collecting = None;
            }
        }
    }

    async fn on_announcement(&self, envelope: &Envelope) {
        let Some(report) = report_from(envelope) else {
            return;
        };
        let instance_id = envelope.instance_id();
        let snapshot = {
            let mut state = self.state.write().await;
            merge_channel_info(&mut state.aggregated, &report.info_by_topic, instance_id);
            if let Some(collecting) = state.collecting.as_mut() {
                merge_channel_info(collecting, &report.info_by_topic, instance_id);
            }
            state.aggregated.clone()
        };
        tracing::debug!(instance_id = %instance_id, "Announcement merged");
        self.emit_updated(snapshot);
    }

    fn emit_updated(&self, topology: Topology) {
        tracing::debug!(topics = topology.len(), "Topology updated");
        if tracing::enabled!(tracing::Level::TRACE) {
            if let Ok(dump) = serde_json::to_string_pretty(&topology) {
                tracing::trace!("{dump}");
            }
        }
        let _ = self.updates.send(topology);
    }
}

fn report_from(envelope: &Envelope) -> Option<ChannelReport> {
    let payload = envelope.payload.as_ref()?;
    match serde_json::from_value(payload.clone()) {
        Ok(report) => Some(report),
        Err(e) => {
            tracing::debug!(id = %envelope.id, error = %e, "Ignoring malformed channel report");
            None
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn next_round_event(round: &mut Option<RequestHandle>) -> Option<CollectorEvent> {
    match round {
        Some(handle) => handle.events.recv().await,
        None => std::future::pending().await,
    }
}
