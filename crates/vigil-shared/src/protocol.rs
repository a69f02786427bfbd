use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::types::{MediaType, Message, MessageId, UserId};

/// All frames exchanged over the communications socket.
///
/// Frames are JSON objects discriminated by a kebab-case `type` field, e.g.
/// `{"type":"message-read","messageId":12,"readBy":7}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Client → server: bind this socket to a user.
    #[serde(rename_all = "camelCase")]
    Register { user_id: UserId },

    /// Client → server liveness ping.
    Heartbeat,

    /// Server → client: full list of online users.
    Users { users: Vec<UserId> },

    /// Server → client: a newly persisted message addressed to the receiver.
    Message { message: Message },

    /// Server → original sender: one message was read.
    #[serde(rename_all = "camelCase")]
    MessageRead { message_id: MessageId, read_by: UserId },

    /// Server → original sender: every unread message to `read_by` was read.
    #[serde(rename_all = "camelCase")]
    AllMessagesRead { read_by: UserId, count: u64 },

    CallOffer(CallOffer),
    CallAnswer(CallAnswer),
    CallCandidate(CallCandidate),
    CallEnd(CallEnd),
    CallBusy(CallBusy),

    /// Server → client: the previous frame was rejected.
    Error { message: String },
}

/// WebRTC session description (`RTCSessionDescriptionInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// ICE candidate (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOffer {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub media_type: MediaType,
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallAnswer {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallCandidate {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Ended,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEnd {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallBusy {
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

impl Frame {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Short name used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "register",
            Frame::Heartbeat => "heartbeat",
            Frame::Users { .. } => "users",
            Frame::Message { .. } => "message",
            Frame::MessageRead { .. } => "message-read",
            Frame::AllMessagesRead { .. } => "all-messages-read",
            Frame::CallOffer(_) => "call-offer",
            Frame::CallAnswer(_) => "call-answer",
            Frame::CallCandidate(_) => "call-candidate",
            Frame::CallEnd(_) => "call-end",
            Frame::CallBusy(_) => "call-busy",
            Frame::Error { .. } => "error",
        }
    }

    /// For call-signaling frames, the user the frame must be relayed to.
    pub fn relay_target(&self) -> Option<UserId> {
        match self {
            Frame::CallOffer(o) => Some(o.receiver_id),
            Frame::CallAnswer(a) => Some(a.caller_id),
            Frame::CallCandidate(c) => Some(c.receiver_id),
            Frame::CallEnd(e) => Some(e.receiver_id),
            Frame::CallBusy(b) => Some(b.receiver_id),
            _ => None,
        }
    }

    /// Overwrite the originator field of a call-signaling frame so peers
    /// cannot impersonate each other.
    pub fn stamp_sender(&mut self, sender: UserId) {
        match self {
            Frame::CallOffer(o) => o.caller_id = sender,
            Frame::CallAnswer(a) => a.receiver_id = sender,
            Frame::CallCandidate(c) => c.sender_id = sender,
            Frame::CallEnd(e) => e.sender_id = sender,
            Frame::CallBusy(b) => b.sender_id = sender,
            _ => {}
        }
    }
}
