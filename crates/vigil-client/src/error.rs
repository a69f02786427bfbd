use thiserror::Error;

use vigil_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Client task has shut down")]
    Closed,
}

/// Media and signaling faults. Every one of these leaves the call idle with
/// all media released.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    Busy,

    #[error("Cannot call yourself")]
    SelfCall,

    #[error("No call in a state that allows this action")]
    InvalidState,

    #[error("Media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),
}
