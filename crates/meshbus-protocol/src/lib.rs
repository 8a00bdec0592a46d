//! meshbus protocol - envelope and metadata types
//!
//! Defines the wire unit exchanged over the publish/subscribe transport:
//! request and response envelopes, acknowledgement hints, and the service
//! metadata that identifies which instance sent a message.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod service;
pub mod topic;

pub use constants::*;
pub use envelope::*;
pub use error::*;
pub use service::*;
pub use topic::{is_internal, response_topic};
