//! Scatter-gather over publish/subscribe.
//!
//! A [`Requester`] publishes one request and runs a [`Collector`] over the
//! correlated response topic until the responders' self-reported quotas are
//! met or the (ack-extendable) deadline passes. A [`Contributor`] is the
//! reply side: it answers each request on a topic exactly once.

pub mod collector;
pub mod config;
pub mod contributor;
pub mod driver;
pub mod requester;

pub use collector::{
    AcceptFn, Collected, Collector, CollectorEvent, CollectorPhase, QuotaAdjustment, Remaining,
};
pub use config::CollectorConfig;
pub use contributor::{
    AckHint, Contributor, ContributorHandle, HandlerFuture, RequestHandler, Responder,
};
pub use driver::{CollectorHandle, EventSender, ResponseCollector};
pub use requester::{RequestConfig, RequestHandle, Requester};

pub use meshbus_transport::TransportError;

/// Errors raised by collection and reply operations.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] meshbus_protocol::ProtocolError),

    #[error("collection ended without a result")]
    Cancelled,
}
