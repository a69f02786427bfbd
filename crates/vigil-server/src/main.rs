//! # vigil-server
//!
//! Real-time communications server for election observer teams.
//!
//! This binary provides:
//! - **REST API** (axum) for sending messages, listing conversations, read
//!   receipts and presence lookups
//! - **Communications socket** (`/ws`) for presence broadcasts, message push
//!   and WebRTC call-signaling relay (the server never touches media)
//! - **Heartbeat sweep** that evicts silent connections from presence
//! - **Per-IP rate limiting** to protect against abuse

mod api;
mod auth;
mod config;
mod error;
mod presence;
mod rate_limit;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil_store::Database;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::presence::{broadcast_online_users, InMemoryPresence, PresenceRegistry};
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,vigil_server=debug")),
        )
        .init();

    info!("Starting Vigil communications server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Arc::new(Mutex::new(Database::open_at(&config.database_path)?));

    let presence: Arc<dyn PresenceRegistry> = Arc::new(InMemoryPresence::new());

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);

    let app_state = AppState {
        db,
        presence: presence.clone(),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(600.0).await;
        }
    });

    // Heartbeat sweep, twice per timeout window
    let timeout = config.heartbeat_timeout;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(timeout / 2);
        loop {
            interval.tick().await;
            let evicted = presence.sweep(timeout).await;
            if !evicted.is_empty() {
                info!(count = evicted.len(), "Heartbeat sweep evicted connections");
                broadcast_online_users(presence.as_ref()).await;
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
