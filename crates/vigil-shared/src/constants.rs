/// Application name
pub const APP_NAME: &str = "Vigil";

/// Version tag reported by `/info`
pub const PROTOCOL_VERSION: &str = "vigil-comms/1";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Client heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

/// Silence after which the server evicts a connection (3 missed heartbeats)
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 30;

/// Reconnect backoff: first delay in milliseconds
pub const RECONNECT_BASE_MS: u64 = 1_000;

/// Reconnect backoff: upper bound in milliseconds
pub const RECONNECT_MAX_MS: u64 = 30_000;

/// Reconnect backoff: maximum random jitter added per attempt
pub const RECONNECT_JITTER_MS: u64 = 1_000;

/// Maximum chat message length in characters
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Per-connection outbound frame queue depth
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Default page size for `GET /messages/:userId`
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Hard cap on page size for `GET /messages/:userId`
pub const MAX_PAGE_SIZE: u32 = 500;
