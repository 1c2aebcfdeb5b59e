//! Output seam between the engine and whatever moves bytes.
//!
//! The engine never touches sockets. Everything it wants sent or closed goes
//! through an `Outbox`; the tokio driver implements it with per-connection
//! queues, tests use `MemoryOutbox`.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

use chanrelay_core::protocol::frame::{decode_datagram, decode_frame};
use chanrelay_core::protocol::message::ServerMessage;

/// Transport-assigned handle for one stream connection. Unlike `ClientId`
/// it is never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub trait Outbox {
    /// Queue encoded stream bytes (one whole frame) for a connection.
    fn send(&mut self, conn: ConnectionId, bytes: Bytes);

    /// Send one datagram.
    fn send_to(&mut self, addr: SocketAddr, bytes: Bytes);

    /// Close a connection once everything queued before it is written.
    fn close(&mut self, conn: ConnectionId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Stream { conn: ConnectionId, bytes: Bytes },
    Datagram { addr: SocketAddr, bytes: Bytes },
    Close(ConnectionId),
}

/// Records everything in order. Used by tests and by embedders that want to
/// pump the engine by hand.
#[derive(Debug, Default)]
pub struct MemoryOutbox {
    pub sent: Vec<Outgoing>,
}

impl MemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.sent)
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }

    /// Decoded stream messages queued for `conn`, oldest first.
    pub fn stream_to(&self, conn: ConnectionId) -> Vec<ServerMessage> {
        self.sent
            .iter()
            .filter_map(|o| match o {
                Outgoing::Stream { conn: c, bytes } if *c == conn => decode_frame(bytes)
                    .and_then(|(frame, _)| ServerMessage::decode(frame).ok()),
                _ => None,
            })
            .collect()
    }

    /// Decoded datagrams sent to `addr`, oldest first.
    pub fn datagrams_to(&self, addr: SocketAddr) -> Vec<ServerMessage> {
        self.sent
            .iter()
            .filter_map(|o| match o {
                Outgoing::Datagram { addr: a, bytes } if *a == addr => {
                    decode_datagram(bytes.clone(), false)
                        .ok()
                        .and_then(|(frame, _)| ServerMessage::decode(frame).ok())
                }
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self, conn: ConnectionId) -> bool {
        self.sent
            .iter()
            .any(|o| matches!(o, Outgoing::Close(c) if *c == conn))
    }
}

impl Outbox for MemoryOutbox {
    fn send(&mut self, conn: ConnectionId, bytes: Bytes) {
        self.sent.push(Outgoing::Stream { conn, bytes });
    }

    fn send_to(&mut self, addr: SocketAddr, bytes: Bytes) {
        self.sent.push(Outgoing::Datagram { addr, bytes });
    }

    fn close(&mut self, conn: ConnectionId) {
        self.sent.push(Outgoing::Close(conn));
    }
}
