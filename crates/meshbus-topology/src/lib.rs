//! meshbus topology - who produces and consumes which topic, cluster-wide.
//!
//! Every instance tracks its own channel usage. Monitors gather those local
//! views into one aggregated topology, through unsolicited announcements and
//! periodic heartbeat rounds.

pub mod channel_info;
pub mod config;
pub mod monitor;

pub use channel_info::{
    apply_topic_event, merge_channel_info, resync_local_roles, ChannelInfo, ChannelReport,
    LocalChannelInfo, LocalTopology, Topology,
};
pub use config::MonitorConfig;
pub use monitor::ChannelMonitor;

use meshbus_collector::CollectorError;
use meshbus_transport::TransportError;

/// Errors raised by the channel monitor.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid monitor config: {0}")]
    InvalidConfig(String),

    #[error("monitoring is not running")]
    NotMonitoring,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
