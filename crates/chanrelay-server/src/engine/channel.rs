//! Channel entities and their registry.
//!
//! Channels are keyed by id; names are indexed case-insensitively. Member
//! lists keep join order, which is the order rosters are sent in.

use std::collections::{BTreeMap, HashMap};

use chanrelay_core::protocol::message::JoinFlags;
use chanrelay_core::{ChannelId, ClientId, IdPool, Result};

#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    name: String,
    pub(crate) members: Vec<ClientId>,
    pub(crate) master: Option<ClientId>,
    pub(crate) hidden: bool,
    pub(crate) auto_close: bool,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[ClientId] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, client: ClientId) -> bool {
        self.members.contains(&client)
    }

    pub fn master(&self) -> Option<ClientId> {
        self.master
    }

    pub fn is_master(&self, client: ClientId) -> bool {
        self.master == Some(client)
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    pub fn auto_close(&self) -> bool {
        self.auto_close
    }
}

/// Case-insensitive comparison key for channel and client names.
pub(crate) fn name_key(name: &str) -> String {
    name.to_lowercase()
}

pub(crate) struct ChannelRegistry {
    channels: BTreeMap<ChannelId, Channel>,
    by_name: HashMap<String, ChannelId>,
    ids: IdPool,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: BTreeMap::new(),
            by_name: HashMap::new(),
            ids: IdPool::new("channel"),
        }
    }

    /// Build a channel with `master` as its creator. It owns an id but is not
    /// registered until `register`; a denied one goes back through `discard`.
    pub fn prepare(&mut self, name: String, flags: JoinFlags, master: ClientId) -> Result<Channel> {
        let id = ChannelId(self.ids.borrow()?);
        Ok(Channel {
            id,
            name,
            members: Vec::new(),
            master: Some(master),
            hidden: flags.hidden,
            auto_close: flags.auto_close,
        })
    }

    pub fn discard(&mut self, channel: Channel) {
        self.ids.release(channel.id.0);
    }

    pub fn register(&mut self, channel: Channel) {
        self.by_name.insert(name_key(&channel.name), channel.id);
        self.channels.insert(channel.id, channel);
    }

    pub fn remove(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.channels.remove(&id)?;
        self.by_name.remove(&name_key(&channel.name));
        self.ids.release(id.0);
        Some(channel)
    }

    pub fn find_by_name(&self, name: &str) -> Option<ChannelId> {
        self.by_name.get(&name_key(name)).copied()
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }
}
