//! Errors the client reports locally, without a round trip to the server.

use thiserror::Error;

use chanrelay_core::{ChannelId, ClientId, RelayError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    #[error("invalid name: {0}")]
    InvalidName(&'static str),
    #[error("set a name before joining a channel")]
    NameRequired,
    #[error("not in channel {0}")]
    UnknownChannel(ChannelId),
    #[error("no peer {peer} in channel {channel}")]
    UnknownPeer { channel: ChannelId, peer: ClientId },
    #[error("channel listing denied: {0}")]
    ListingDenied(String),
    /// The server sent something this client cannot make sense of.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    /// The driver task has stopped.
    #[error("client closed")]
    Closed,
}

impl From<RelayError> for ClientError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Io(io) => ClientError::Transport(io.to_string()),
            other => ClientError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Transport(e.to_string())
    }
}
