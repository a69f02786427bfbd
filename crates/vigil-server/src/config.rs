//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use vigil_shared::constants::{DEFAULT_HTTP_PORT, HEARTBEAT_TIMEOUT_SECS, MAX_MESSAGE_LEN};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP/WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./vigil.db`
    pub database_path: PathBuf,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Connections silent for longer than this are evicted from presence.
    /// Env: `HEARTBEAT_TIMEOUT_SECS`
    /// Default: `30`
    pub heartbeat_timeout: Duration,

    /// Maximum chat message length in characters.
    /// Env: `MAX_MESSAGE_LEN`
    pub max_message_len: usize,

    /// Sustained per-IP HTTP request rate.
    /// Env: `RATE_LIMIT_PER_SEC`
    pub rate_limit_per_sec: f64,

    /// Per-IP burst capacity.
    /// Env: `RATE_LIMIT_BURST`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./vigil.db"),
            admin_token: None,
            heartbeat_timeout: Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
            max_message_len: MAX_MESSAGE_LEN,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

// Keeps the admin token out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("admin_enabled", &self.admin_token.is_some())
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("max_message_len", &self.max_message_len)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = get("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(token) = get("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(val) = get("HEARTBEAT_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.heartbeat_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid HEARTBEAT_TIMEOUT_SECS, using default"),
            }
        }

        if let Some(val) = get("MAX_MESSAGE_LEN") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_message_len = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_MESSAGE_LEN, using default"),
            }
        }

        if let Some(val) = get("RATE_LIMIT_PER_SEC") {
            match val.parse::<f64>() {
                Ok(rate) if rate > 0.0 => config.rate_limit_per_sec = rate,
                _ => tracing::warn!(value = %val, "Invalid RATE_LIMIT_PER_SEC, using default"),
            }
        }

        if let Some(val) = get("RATE_LIMIT_BURST") {
            match val.parse::<f64>() {
                Ok(burst) if burst >= 1.0 => config.rate_limit_burst = burst,
                _ => tracing::warn!(value = %val, "Invalid RATE_LIMIT_BURST, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}
