//! Local copy of the channels and peers this client can see.
//!
//! Populated from responses and peer events only; it is a cache of the
//! server's state and is cleared on disconnect.

use std::collections::BTreeMap;

use chanrelay_core::protocol::message::ChannelMember;
use chanrelay_core::{ChannelId, ClientId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub(crate) id: ClientId,
    pub(crate) name: String,
    pub(crate) master: bool,
}

impl Peer {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_master(&self) -> bool {
        self.master
    }
}

impl From<ChannelMember> for Peer {
    fn from(m: ChannelMember) -> Self {
        Self {
            id: m.id,
            name: m.name,
            master: m.master,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub(crate) id: ChannelId,
    pub(crate) name: String,
    pub(crate) master: bool,
    pub(crate) peers: BTreeMap<ClientId, Peer>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, name: String, master: bool, members: Vec<ChannelMember>) -> Self {
        Self {
            id,
            name,
            master,
            peers: members.into_iter().map(|m| (m.id, Peer::from(m))).collect(),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this client is the channel's master.
    pub fn is_master(&self) -> bool {
        self.master
    }

    pub fn peer(&self, id: ClientId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    /// Everyone else in the channel, by id.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
