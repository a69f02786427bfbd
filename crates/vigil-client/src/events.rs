//! Notifications emitted by the client task to the application layer.

use std::time::Duration;

use vigil_shared::protocol::EndReason;
use vigil_shared::types::{MediaType, Message, MessageId, UserId};

use crate::connection::ConnectionState;

/// Call lifecycle events for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Incoming { from: UserId, media_type: MediaType },
    RingtoneStart,
    RingtoneStop,
    Connected { peer: UserId },
    /// The call ended. `by_peer` is false when this side hung up.
    Ended { peer: UserId, reason: EndReason, by_peer: bool },
    /// The callee was already in a call.
    Busy { peer: UserId },
    /// A media or negotiation fault aborted the call.
    Failed { peer: UserId, error: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    ConnectionChanged(ConnectionState),
    ReconnectScheduled(Duration),
    OnlineUsers(Vec<UserId>),
    NewMessage(Message),
    MessageRead { message_id: MessageId, read_by: UserId },
    AllMessagesRead { read_by: UserId, count: u64 },
    Call(CallEvent),
    /// An error frame from the server.
    ServerError(String),
}
