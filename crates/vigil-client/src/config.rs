//! Client configuration.

use std::time::Duration;

use vigil_shared::constants::{
    DEFAULT_HTTP_PORT, HEARTBEAT_INTERVAL_SECS, OUTBOUND_QUEUE_CAPACITY, RECONNECT_BASE_MS,
    RECONNECT_JITTER_MS, RECONNECT_MAX_MS,
};
use vigil_shared::types::UserId;

/// Reconnection delay parameters. See [`crate::backoff::Backoff`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(RECONNECT_BASE_MS),
            max: Duration::from_millis(RECONNECT_MAX_MS),
            jitter: Duration::from_millis(RECONNECT_JITTER_MS),
        }
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the server, e.g. `http://localhost:8080`.
    pub server_url: String,
    pub session_token: String,
    pub user_id: UserId,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
    /// Capacity of the command and notification channels.
    pub channel_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, session_token: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            session_token: session_token.into(),
            user_id,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            backoff: BackoffConfig::default(),
            channel_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }

    /// Local development server on the default port.
    pub fn localhost(session_token: impl Into<String>, user_id: UserId) -> Self {
        Self::new(
            format!("http://127.0.0.1:{DEFAULT_HTTP_PORT}"),
            session_token,
            user_id,
        )
    }

    pub fn http_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Socket URL derived from the HTTP base: `http` becomes `ws`, `https`
    /// becomes `wss`, with the session token in the query string.
    pub fn socket_url(&self) -> String {
        let base = self.http_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/ws?token={}", self.session_token)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("session_token", &"***")
            .field("user_id", &self.user_id)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("backoff", &self.backoff)
            .finish()
    }
}
