//! Online-user tracking and best-effort socket delivery.
//!
//! Callers only see the [`PresenceRegistry`] trait, so the single-process
//! [`InMemoryPresence`] map can be swapped for a shared broker in a
//! multi-instance deployment.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use vigil_shared::protocol::Frame;
use vigil_shared::types::{PresenceStatus, UserId};

/// Outbound half of one socket's frame queue.
pub type FrameSender = mpsc::Sender<Frame>;

/// Identifies one registration of a user. A newer registration for the same
/// user replaces the older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    /// Bind `user` to a socket. Any previous socket of the same user is
    /// dropped from the registry (last registration wins).
    async fn register(&self, user: UserId, conn: ConnectionId, tx: FrameSender);

    /// Remove `user` only if `conn` is still its current registration.
    /// Returns whether an entry was removed.
    async fn unregister(&self, user: UserId, conn: ConnectionId) -> bool;

    /// Record liveness for the current registration.
    async fn touch(&self, user: UserId, conn: ConnectionId);

    /// Best-effort push. Returns `false` when the user is offline or the
    /// socket's queue is full; the caller is expected to tolerate both.
    async fn send_to_user(&self, user: UserId, frame: Frame) -> bool;

    async fn active_users(&self) -> Vec<UserId>;

    async fn status(&self, user: UserId) -> PresenceStatus;

    /// Evict registrations silent for longer than `max_idle`; returns the
    /// evicted users.
    async fn sweep(&self, max_idle: Duration) -> Vec<UserId>;
}

struct PresenceSlot {
    conn: ConnectionId,
    tx: FrameSender,
    last_seen: Instant,
}

#[derive(Default)]
pub struct InMemoryPresence {
    slots: RwLock<HashMap<UserId, PresenceSlot>>,
}

impl InMemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceRegistry for InMemoryPresence {
    async fn register(&self, user: UserId, conn: ConnectionId, tx: FrameSender) {
        let mut slots = self.slots.write().await;
        let replaced = slots.insert(
            user,
            PresenceSlot {
                conn,
                tx,
                last_seen: Instant::now(),
            },
        );

        if let Some(old) = replaced {
            info!(user = %user, old = %old.conn, new = %conn, "Registration replaced older socket");
        } else {
            info!(user = %user, conn = %conn, online = slots.len(), "User online");
        }
    }

    async fn unregister(&self, user: UserId, conn: ConnectionId) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get(&user) {
            Some(slot) if slot.conn == conn => {
                slots.remove(&user);
                info!(user = %user, conn = %conn, online = slots.len(), "User offline");
                true
            }
            _ => false,
        }
    }

    async fn touch(&self, user: UserId, conn: ConnectionId) {
        if let Some(slot) = self.slots.write().await.get_mut(&user) {
            if slot.conn == conn {
                slot.last_seen = Instant::now();
            }
        }
    }

    async fn send_to_user(&self, user: UserId, frame: Frame) -> bool {
        let slots = self.slots.read().await;
        let Some(slot) = slots.get(&user) else {
            debug!(user = %user, kind = frame.kind(), "Recipient offline, skipping push");
            return false;
        };

        match slot.tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(user = %user, error = %e, "Dropping frame for slow or closed socket");
                false
            }
        }
    }

    async fn active_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.slots.read().await.keys().copied().collect();
        users.sort();
        users
    }

    async fn status(&self, user: UserId) -> PresenceStatus {
        if self.slots.read().await.contains_key(&user) {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }

    async fn sweep(&self, max_idle: Duration) -> Vec<UserId> {
        let mut slots = self.slots.write().await;
        let now = Instant::now();
        let stale: Vec<UserId> = slots
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_seen) > max_idle)
            .map(|(user, _)| *user)
            .collect();

        for user in &stale {
            slots.remove(user);
            info!(user = %user, "Evicted connection after heartbeat timeout");
        }
        stale
    }
}

/// Push the full online list to every connected user.
pub async fn broadcast_online_users(registry: &dyn PresenceRegistry) {
    let users = registry.active_users().await;
    for user in &users {
        registry
            .send_to_user(
                *user,
                Frame::Users {
                    users: users.clone(),
                },
            )
            .await;
    }
}
