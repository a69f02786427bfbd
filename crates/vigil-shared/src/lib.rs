//! Types shared between the Vigil server and client: identifiers, chat
//! messages, and the JSON frames exchanged over the communications socket.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use protocol::Frame;
