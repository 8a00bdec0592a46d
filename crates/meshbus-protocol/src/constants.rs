/// Protocol version carried in service metadata.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Default overall deadline for a collection, measured from its start.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 3_000;

/// Topics starting with this prefix are protocol-internal.
pub const INTERNAL_TOPIC_PREFIX: char = '_';

/// Topic on which instances announce their local channel usage.
pub const DEFAULT_ANNOUNCE_TOPIC: &str = "_channels:announce";

/// Topic on which heartbeat requests are scattered.
pub const DEFAULT_HEARTBEAT_TOPIC: &str = "_channels:heartbeat";

/// Time responders have to answer a heartbeat (must be < interval).
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;

/// Time between heartbeats (must be > timeout).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
