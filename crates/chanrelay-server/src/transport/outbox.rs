use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::engine::{ConnectionId, Outbox};

/// `Outbox` backed by per-connection write queues and the shared datagram
/// socket.
///
/// Closing a connection drops its queue sender. The connection task flushes
/// what is already queued, shuts the socket down and reports the close back
/// to the engine.
pub struct ChannelOutbox {
    writers: HashMap<ConnectionId, mpsc::Sender<Bytes>>,
    udp: Arc<UdpSocket>,
}

impl ChannelOutbox {
    pub(crate) fn new(udp: Arc<UdpSocket>) -> Self {
        Self {
            writers: HashMap::new(),
            udp,
        }
    }

    pub(crate) fn register(&mut self, conn: ConnectionId, writer: mpsc::Sender<Bytes>) {
        self.writers.insert(conn, writer);
    }

    /// Connections with a live write queue.
    pub fn open_connections(&self) -> usize {
        self.writers.len()
    }
}

impl Outbox for ChannelOutbox {
    fn send(&mut self, conn: ConnectionId, bytes: Bytes) {
        let Some(writer) = self.writers.get(&conn) else {
            return;
        };
        match writer.try_send(bytes) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%conn, "write queue full, closing slow connection");
                self.writers.remove(&conn);
            }
            Err(TrySendError::Closed(_)) => {
                self.writers.remove(&conn);
            }
        }
    }

    fn send_to(&mut self, addr: SocketAddr, bytes: Bytes) {
        if let Err(e) = self.udp.try_send_to(&bytes, addr) {
            debug!(%addr, error = %e, "datagram not sent");
        }
    }

    fn close(&mut self, conn: ConnectionId) {
        self.writers.remove(&conn);
    }
}
