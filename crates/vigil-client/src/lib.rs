//! # vigil-client
//!
//! Client side of the Vigil communications layer.
//!
//! - [`connection`] and [`backoff`]: the socket lifecycle as an explicit state
//!   machine (register, heartbeat, reconnect with jittered backoff)
//! - [`call`]: the per-peer call state machine with ICE candidate buffering
//!   and guaranteed media release
//! - [`driver`]: a tokio task that owns the socket and wires the machines to
//!   real timers, exposed through command/notification channels
//! - [`api`] and [`cache`]: HTTP endpoints and the local message cache they
//!   invalidate

pub mod api;
pub mod backoff;
pub mod cache;
pub mod call;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod events;

pub use api::{ApiClient, Messenger};
pub use cache::{MessageCache, SharedCache};
pub use call::{CallManager, CallOutput, CallState, MediaEngine};
pub use config::{BackoffConfig, ClientConfig};
pub use connection::{ConnectionMachine, ConnectionState};
pub use driver::{spawn_client, ClientCommand};
pub use error::{CallError, ClientError};
pub use events::{CallEvent, ClientNotification};
