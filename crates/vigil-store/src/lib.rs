//! # vigil-store
//!
//! Durable storage for the communications layer, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users, sessions and
//! direct messages. Conversations are never stored; they are derived from
//! message rows on every query.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::NewMessage;
