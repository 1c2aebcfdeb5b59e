use std::fmt;

/// Server-assigned client id (also the peer id seen by other clients).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u16);

/// Server-assigned channel id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u16);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a message travels: over the ordered stream or blasted as a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Delivery {
    #[default]
    Reliable,
    Blasted,
}

impl Delivery {
    pub fn is_blasted(self) -> bool {
        matches!(self, Delivery::Blasted)
    }

    pub fn from_blasted(blasted: bool) -> Self {
        if blasted {
            Delivery::Blasted
        } else {
            Delivery::Reliable
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Delivery::Reliable => "reliable",
            Delivery::Blasted => "blasted",
        }
    }
}

/// Protocol revision carried by the Connect request.
pub const PROTOCOL_REVISION: &str = "revision 3";

/// First byte a client writes on a new stream, before any frame. The server
/// discards it.
pub const OPENING_BYTE: u8 = 0;

/// Longest name (client or channel) in bytes; names travel behind a u8 length.
pub const MAX_NAME_LEN: usize = 255;

/// Message types sent by clients.
pub mod to_server {
    pub const REQUEST: u8 = 0;
    pub const BINARY_SERVER: u8 = 1;
    pub const BINARY_CHANNEL: u8 = 2;
    pub const BINARY_PEER: u8 = 3;
    pub const OBJECT_SERVER: u8 = 4;
    pub const OBJECT_CHANNEL: u8 = 5;
    pub const OBJECT_PEER: u8 = 6;
    pub const UDP_HELLO: u8 = 7;
    pub const CHANNEL_MASTER: u8 = 8;
    pub const PONG: u8 = 9;
}

/// Message types sent by the server.
pub mod to_client {
    pub const RESPONSE: u8 = 0;
    pub const BINARY_SERVER: u8 = 1;
    pub const BINARY_CHANNEL: u8 = 2;
    pub const BINARY_PEER: u8 = 3;
    pub const BINARY_SERVER_CHANNEL: u8 = 4;
    pub const OBJECT_SERVER: u8 = 5;
    pub const OBJECT_CHANNEL: u8 = 6;
    pub const OBJECT_PEER: u8 = 7;
    pub const OBJECT_SERVER_CHANNEL: u8 = 8;
    pub const PEER: u8 = 9;
    pub const UDP_WELCOME: u8 = 10;
    pub const PING: u8 = 11;
}

/// Request sub-codes (first payload byte of type 0 in both directions).
pub mod request {
    pub const CONNECT: u8 = 0;
    pub const SET_NAME: u8 = 1;
    pub const JOIN_CHANNEL: u8 = 2;
    pub const LEAVE_CHANNEL: u8 = 3;
    pub const LIST_CHANNELS: u8 = 4;
}
