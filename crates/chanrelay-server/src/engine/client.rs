//! Server-side connection entities and their registry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;

use chanrelay_core::protocol::frame::FrameReader;
use chanrelay_core::{ChannelId, ClientId, IdPool, Result};

use super::outbox::ConnectionId;

/// One connected client as the server sees it.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    conn: ConnectionId,
    address: SocketAddr,
    pub(crate) name: Option<String>,
    pub(crate) channels: BTreeSet<ChannelId>,
    pub(crate) handshook: bool,
    pub(crate) udp_address: Option<SocketAddr>,
    pub(crate) awaiting_pong: bool,
    pub(crate) got_opening_byte: bool,
    pub(crate) reader: FrameReader,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    /// Remote address of the stream connection.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Last address a verified UDPHello came from.
    pub fn udp_address(&self) -> Option<SocketAddr> {
        self.udp_address
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_handshook(&self) -> bool {
        self.handshook
    }

    pub fn channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().copied()
    }

    pub fn is_member_of(&self, channel: ChannelId) -> bool {
        self.channels.contains(&channel)
    }
}

pub(crate) struct ClientRegistry {
    clients: BTreeMap<ClientId, Client>,
    by_conn: HashMap<ConnectionId, ClientId>,
    ids: IdPool,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: BTreeMap::new(),
            by_conn: HashMap::new(),
            ids: IdPool::new("client"),
        }
    }

    pub fn insert(
        &mut self,
        conn: ConnectionId,
        address: SocketAddr,
        max_payload: usize,
    ) -> Result<ClientId> {
        let id = ClientId(self.ids.borrow()?);
        self.clients.insert(
            id,
            Client {
                id,
                conn,
                address,
                name: None,
                channels: BTreeSet::new(),
                handshook: false,
                udp_address: None,
                awaiting_pong: false,
                got_opening_byte: false,
                reader: FrameReader::new(max_payload),
            },
        );
        self.by_conn.insert(conn, id);
        Ok(id)
    }

    /// Drop the entity and release its id. Channel membership must already
    /// be gone.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        self.by_conn.remove(&client.conn);
        self.ids.release(id.0);
        Some(client)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn by_connection(&self, conn: ConnectionId) -> Option<ClientId> {
        self.by_conn.get(&conn).copied()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }
}
