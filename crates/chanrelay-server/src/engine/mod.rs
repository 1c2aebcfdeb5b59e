//! Sans-IO relay server engine.
//!
//! `RelayServer` owns every client and channel. It reacts to accepted
//! connections, stream bytes, datagrams, closed connections, and the periodic
//! ping sweep; everything it emits goes through an `Outbox`. Nothing here
//! blocks or spawns, so one task (or a test) drives it synchronously and
//! registries are consistent whenever control returns to the caller.

pub mod channel;
pub mod client;
pub mod handlers;
pub mod outbox;

#[cfg(test)]
mod tests;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use chanrelay_core::protocol::frame::{decode_datagram, encode_datagram};
use chanrelay_core::protocol::message::{
    BinaryMessage, ChannelListing, ChannelMember, ClientMessage, JoinFlags, PeerEvent, PeerUpdate,
    Request, Response, ServerMessage,
};
use chanrelay_core::protocol::types::{MAX_NAME_LEN, PROTOCOL_REVISION};
use chanrelay_core::{ChannelId, ClientId, Delivery, RelayError, Result};

use crate::config::ServerSection;
use crate::obs::RelayMetrics;

pub use channel::Channel;
pub use client::Client;
pub use handlers::{RelayServerHandlers, Verdict};
pub use outbox::{ConnectionId, MemoryOutbox, Outbox, Outgoing};

use channel::{name_key, ChannelRegistry};
use client::ClientRegistry;

/// Fixed reason strings sent in failure responses.
pub mod reason {
    pub const VERSION_MISMATCH: &str = "Version mismatch";
    pub const CONNECT_REFUSED: &str = "Connection refused by server";
    pub const NAME_REFUSED: &str = "Name refused by server";
    pub const JOIN_REFUSED: &str = "Join refused by server";
    pub const LEAVE_REFUSED: &str = "Leave refused by server";
    pub const NAME_TAKEN: &str = "Name already taken";
    pub const INVALID_NAME: &str = "Invalid name";
    pub const NAME_TOO_LONG: &str = "Name too long";
    pub const NAME_REQUIRED: &str = "Set a name before joining a channel";
    pub const NOT_MEMBER: &str = "Not a member of that channel";
    pub const LISTING_DISABLED: &str = "Channel listing is not enabled on this server";
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub welcome_message: String,
    pub channel_listing: bool,
    pub max_message_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions::from(&ServerSection::default())
    }
}

impl From<&ServerSection> for ServerOptions {
    fn from(s: &ServerSection) -> Self {
        Self {
            welcome_message: s.welcome_message.clone(),
            channel_listing: s.channel_listing,
            max_message_bytes: s.max_message_bytes,
        }
    }
}

/// Why the server refuses `name`, if it does.
fn name_problem(name: &str) -> Option<&'static str> {
    if name.len() > MAX_NAME_LEN {
        Some(reason::NAME_TOO_LONG)
    } else if name.is_empty() || name.contains('\0') {
        Some(reason::INVALID_NAME)
    } else {
        None
    }
}

/// Cut `name` to what a u8 length prefix can carry, on a char boundary.
fn echoable(mut name: String) -> String {
    if name.len() > MAX_NAME_LEN {
        let mut end = MAX_NAME_LEN;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

pub struct RelayServer<H, O> {
    handlers: H,
    outbox: O,
    clients: ClientRegistry,
    channels: ChannelRegistry,
    options: ServerOptions,
    metrics: Arc<RelayMetrics>,
}

impl<H: RelayServerHandlers, O: Outbox> RelayServer<H, O> {
    pub fn new(options: ServerOptions, handlers: H, outbox: O) -> Self {
        Self {
            handlers,
            outbox,
            clients: ClientRegistry::new(),
            channels: ChannelRegistry::new(),
            options,
            metrics: Arc::new(RelayMetrics::default()),
        }
    }

    /// Report into a shared registry instead of a private one.
    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    pub fn outbox(&self) -> &O {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut O {
        &mut self.outbox
    }

    // --------------------
    // Transport inputs
    // --------------------

    /// A stream connection was accepted. Fails only when client ids are
    /// exhausted, which is fatal.
    pub fn accept(&mut self, conn: ConnectionId, address: SocketAddr) -> Result<ClientId> {
        let id = self
            .clients
            .insert(conn, address, self.options.max_message_bytes)?;
        self.metrics.connections_accepted.inc(&[]);
        self.metrics.clients_active.inc(&[]);
        debug!(client = %id, %conn, %address, "connection accepted");
        Ok(id)
    }

    /// Bytes arrived on a stream. Protocol violations close the connection
    /// and are not returned; only fatal errors are.
    pub fn receive(&mut self, conn: ConnectionId, data: &[u8]) -> Result<()> {
        let Some(id) = self.clients.by_connection(conn) else {
            debug!(%conn, "bytes for unknown connection dropped");
            return Ok(());
        };
        let started = Instant::now();

        if let Some(client) = self.clients.get_mut(id) {
            let mut data = data;
            if !client.got_opening_byte {
                let Some((_, rest)) = data.split_first() else {
                    return Ok(());
                };
                client.got_opening_byte = true;
                data = rest;
            }
            client.reader.push(data);
        }

        while let Some(client) = self.clients.get_mut(id) {
            let frame = match client.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.violation(id, e);
                    break;
                }
            };

            let outcome = ClientMessage::decode(frame).and_then(|msg| {
                self.metrics
                    .frames
                    .inc(&[("msg_type", msg.label()), ("transport", "stream")]);
                self.dispatch(id, msg, Delivery::Reliable)
            });

            if let Err(e) = outcome {
                if e.is_fatal() {
                    return Err(e);
                }
                self.violation(id, e);
                break;
            }
        }

        self.metrics
            .dispatch_duration
            .observe(&[("transport", "stream")], started.elapsed());
        Ok(())
    }

    /// A datagram arrived. Anything that cannot be tied to a handshook client
    /// at the sender's IP is dropped.
    pub fn receive_datagram(&mut self, from: SocketAddr, data: Bytes) -> Result<()> {
        let started = Instant::now();

        let (frame, sender) = match decode_datagram(data, true) {
            Ok((frame, Some(sender))) => (frame, sender),
            Ok((_, None)) => return Ok(()),
            Err(e) => {
                warn!(%from, error = %e, "malformed datagram dropped");
                return Ok(());
            }
        };

        let Some(client) = self.clients.get_mut(sender) else {
            warn!(%from, client = %sender, "datagram for unknown client dropped");
            return Ok(());
        };
        if client.address().ip() != from.ip() {
            warn!(%from, client = %sender, expected = %client.address().ip(), "datagram source does not match client");
            return Ok(());
        }
        if !client.handshook {
            debug!(%from, client = %sender, "datagram before handshake dropped");
            return Ok(());
        }
        client.udp_address = Some(from);

        let msg = match ClientMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(%from, client = %sender, error = %e, "undecodable datagram dropped");
                return Ok(());
            }
        };
        self.metrics
            .frames
            .inc(&[("msg_type", msg.label()), ("transport", "datagram")]);

        if let Err(e) = self.dispatch(sender, msg, Delivery::Blasted) {
            if e.is_fatal() {
                return Err(e);
            }
            self.violation(sender, e);
        }

        self.metrics
            .dispatch_duration
            .observe(&[("transport", "datagram")], started.elapsed());
        Ok(())
    }

    /// The transport closed a connection. Unknown connections are ignored,
    /// which covers connections the engine already dropped itself.
    pub fn disconnect(&mut self, conn: ConnectionId) {
        if let Some(id) = self.clients.by_connection(conn) {
            self.remove_client(id, "closed");
        }
    }

    /// Drop every client that did not answer the previous ping, then ping
    /// everyone left.
    pub fn ping_sweep(&mut self) {
        let ping = match self.encode(&ServerMessage::Ping, Delivery::Reliable) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode ping");
                return;
            }
        };

        for id in self.clients.ids() {
            let Some(client) = self.clients.get_mut(id) else {
                continue;
            };
            if client.awaiting_pong {
                warn!(client = %id, address = %client.address(), "no pong since last ping, disconnecting");
                self.drop_client(id, "ping_timeout");
                continue;
            }
            client.awaiting_pong = true;
            let conn = client.connection();
            self.outbox.send(conn, ping.clone());
        }
    }

    // --------------------
    // Application API
    // --------------------

    /// Type 1 message from the server itself.
    pub fn send_to_client(
        &mut self,
        client: ClientId,
        delivery: Delivery,
        message: BinaryMessage,
    ) -> Result<()> {
        if self.clients.get(client).is_none() {
            return Err(RelayError::NotFound(format!("client {client}")));
        }
        let bytes = self.encode(&ServerMessage::FromServer(message), delivery)?;
        self.deliver(client, delivery, &bytes);
        Ok(())
    }

    /// Type 4 message from the server to every member of a channel.
    pub fn send_to_channel(
        &mut self,
        channel: ChannelId,
        delivery: Delivery,
        message: BinaryMessage,
    ) -> Result<()> {
        let members = self
            .channels
            .get(channel)
            .map(|c| c.members.clone())
            .ok_or_else(|| RelayError::NotFound(format!("channel {channel}")))?;
        let bytes = self.encode(&ServerMessage::FromServerChannel { channel, message }, delivery)?;
        for m in members {
            self.deliver(m, delivery, &bytes);
        }
        Ok(())
    }

    /// Close a channel; every member is told it left.
    pub fn close_channel(&mut self, channel: ChannelId) -> bool {
        self.close_channel_inner(channel)
    }

    /// Drop a client and close its transport. Cleanup is complete when this
    /// returns.
    pub fn disconnect_client(&mut self, client: ClientId) -> bool {
        self.drop_client(client, "server_request")
    }

    /// Drop every client. Returns how many were connected.
    pub fn disconnect_all(&mut self) -> usize {
        self.clients
            .ids()
            .into_iter()
            .filter(|id| self.drop_client(*id, "shutdown"))
            .count()
    }

    pub fn set_welcome_message(&mut self, welcome: impl Into<String>) {
        self.options.welcome_message = welcome.into();
    }

    pub fn welcome_message(&self) -> &str {
        &self.options.welcome_message
    }

    pub fn set_channel_listing(&mut self, enabled: bool) {
        self.options.channel_listing = enabled;
    }

    pub fn channel_listing(&self) -> bool {
        self.options.channel_listing
    }

    pub fn set_channel_hidden(&mut self, channel: ChannelId, hidden: bool) -> Result<()> {
        let ch = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| RelayError::NotFound(format!("channel {channel}")))?;
        ch.hidden = hidden;
        Ok(())
    }

    pub fn set_channel_auto_close(&mut self, channel: ChannelId, auto_close: bool) -> Result<()> {
        let ch = self
            .channels
            .get_mut(channel)
            .ok_or_else(|| RelayError::NotFound(format!("channel {channel}")))?;
        ch.auto_close = auto_close;
        Ok(())
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn client_by_connection(&self, conn: ConnectionId) -> Option<&Client> {
        self.clients
            .by_connection(conn)
            .and_then(|id| self.clients.get(id))
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        self.channels
            .find_by_name(name)
            .and_then(|id| self.channels.get(id))
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.iter()
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    // --------------------
    // Dispatch
    // --------------------

    fn dispatch(&mut self, id: ClientId, msg: ClientMessage, delivery: Delivery) -> Result<()> {
        let Some(client) = self.clients.get_mut(id) else {
            return Ok(());
        };
        let allowed_early = matches!(
            msg,
            ClientMessage::Request(Request::Connect { .. }) | ClientMessage::Pong
        );
        if !client.handshook && !allowed_early {
            return Err(RelayError::protocol(format!(
                "{} before handshake",
                msg.label()
            )));
        }

        match msg {
            ClientMessage::Request(req) => {
                if delivery.is_blasted() {
                    debug!(client = %id, request = req.label(), "request over datagram ignored");
                    return Ok(());
                }
                self.handle_request(id, req)
            }
            ClientMessage::ToServer(message) => {
                if let Some(client) = self.clients.get(id) {
                    self.handlers.on_server_message(client, delivery, &message);
                }
                self.metrics
                    .messages_relayed
                    .inc(&[("kind", "server"), ("delivery", delivery.as_str())]);
                Ok(())
            }
            ClientMessage::ToChannel { channel, message } => {
                self.relay_to_channel(id, channel, delivery, message);
                Ok(())
            }
            ClientMessage::ToPeer {
                channel,
                peer,
                message,
            } => {
                self.relay_to_peer(id, channel, peer, delivery, message);
                Ok(())
            }
            ClientMessage::Object { msg_type } => {
                debug!(client = %id, msg_type, "object message ignored");
                Ok(())
            }
            ClientMessage::ChannelMaster => Ok(()),
            ClientMessage::UdpHello => {
                if !delivery.is_blasted() {
                    return Err(RelayError::protocol("UDPHello over stream"));
                }
                let welcome = self.encode(&ServerMessage::UdpWelcome, Delivery::Blasted)?;
                self.deliver(id, Delivery::Blasted, &welcome);
                Ok(())
            }
            ClientMessage::Pong => {
                if let Some(client) = self.clients.get_mut(id) {
                    client.awaiting_pong = false;
                }
                Ok(())
            }
        }
    }

    fn handle_request(&mut self, id: ClientId, req: Request) -> Result<()> {
        match req {
            Request::Connect { version } => self.handle_connect(id, version),
            Request::SetName { name } => self.handle_set_name(id, name),
            Request::JoinChannel { name, flags } => self.handle_join(id, name, flags),
            Request::LeaveChannel { channel } => {
                self.handle_leave(id, channel);
                Ok(())
            }
            Request::ListChannels => {
                self.handle_list(id);
                Ok(())
            }
        }
    }

    fn handle_connect(&mut self, id: ClientId, version: String) -> Result<()> {
        let Some(client) = self.clients.get(id) else {
            return Ok(());
        };
        if client.handshook {
            return Err(RelayError::protocol("duplicate Connect"));
        }

        if version != PROTOCOL_REVISION {
            info!(client = %id, %version, "protocol version mismatch");
            self.count("connect", false);
            self.reply(
                id,
                Response::ConnectDenied {
                    reason: reason::VERSION_MISMATCH.into(),
                },
            );
            self.drop_client(id, "version_mismatch");
            return Ok(());
        }

        let verdict = self.handlers.on_connect(client);
        if let Some(reason) = verdict.denial(reason::CONNECT_REFUSED) {
            debug!(client = %id, %reason, "connect denied");
            self.count("connect", false);
            self.reply(id, Response::ConnectDenied { reason });
            return Ok(());
        }

        if let Some(client) = self.clients.get_mut(id) {
            client.handshook = true;
        }
        self.count("connect", true);
        info!(client = %id, "client handshook");

        let welcome = self.options.welcome_message.clone();
        self.reply(id, Response::ConnectAccepted { id, welcome });
        Ok(())
    }

    fn handle_set_name(&mut self, id: ClientId, name: String) -> Result<()> {
        if let Some(problem) = name_problem(&name) {
            self.deny_name(id, name, problem);
            return Ok(());
        }
        if self.name_taken(id, &name) {
            self.deny_name(id, name, reason::NAME_TAKEN);
            return Ok(());
        }

        let Some(client) = self.clients.get(id) else {
            return Ok(());
        };
        let mut requested = name.clone();
        let verdict = self.handlers.on_name_set(client, &mut requested);
        if let Some(reason) = verdict.denial(reason::NAME_REFUSED) {
            self.count("set_name", false);
            self.reply(id, Response::NameDenied { name, reason });
            return Ok(());
        }

        if requested != name {
            match name_problem(&requested) {
                None if !self.name_taken(id, &requested) => {}
                None => {
                    self.deny_name(id, requested, reason::NAME_TAKEN);
                    return Ok(());
                }
                _ => {
                    self.deny_name(id, name, reason::NAME_REFUSED);
                    return Ok(());
                }
            }
        }

        let Some(client) = self.clients.get_mut(id) else {
            return Ok(());
        };
        let previous = client.name.replace(requested.clone());
        let channels: Vec<ChannelId> = client.channels().collect();

        self.count("set_name", true);
        debug!(client = %id, name = %requested, ?previous, "name set");
        self.reply(
            id,
            Response::NameSet {
                name: requested.clone(),
            },
        );

        for ch in channels {
            let Some(channel) = self.channels.get(ch) else {
                continue;
            };
            let others = others_in(channel, id);
            let event = ServerMessage::Peer(PeerEvent {
                channel: ch,
                peer: id,
                update: Some(PeerUpdate {
                    master: channel.is_master(id),
                    name: requested.clone(),
                }),
            });
            self.broadcast(&others, &event);
        }
        Ok(())
    }

    fn deny_name(&mut self, id: ClientId, name: String, reason: &str) {
        let name = echoable(name);
        debug!(client = %id, %name, reason, "name denied");
        self.count("set_name", false);
        self.reply(
            id,
            Response::NameDenied {
                name,
                reason: reason.into(),
            },
        );
    }

    /// Whether another member of any channel `id` is in already uses `name`.
    fn name_taken(&self, id: ClientId, name: &str) -> bool {
        let Some(client) = self.clients.get(id) else {
            return false;
        };
        let key = name_key(name);
        client
            .channels()
            .filter_map(|ch| self.channels.get(ch))
            .flat_map(|ch| ch.members.iter().copied())
            .filter(|m| *m != id)
            .any(|m| self.has_name_key(m, &key))
    }

    fn has_name_key(&self, id: ClientId, key: &str) -> bool {
        self.clients
            .get(id)
            .and_then(Client::name)
            .is_some_and(|n| name_key(n) == key)
    }

    fn handle_join(&mut self, id: ClientId, name: String, flags: JoinFlags) -> Result<()> {
        if let Some(problem) = name_problem(&name) {
            self.deny_join(id, name, problem.into());
            return Ok(());
        }
        let Some(client) = self.clients.get(id) else {
            return Ok(());
        };
        let Some(client_name) = client.name.clone() else {
            self.deny_join(id, name, reason::NAME_REQUIRED.into());
            return Ok(());
        };

        if let Some(channel_id) = self.channels.find_by_name(&name) {
            let Some(channel) = self.channels.get(channel_id) else {
                return Ok(());
            };

            // Only the target channel's members are checked here.
            let key = name_key(&client_name);
            if channel.members.iter().any(|m| self.has_name_key(*m, &key)) {
                self.deny_join(id, name, reason::NAME_TAKEN.into());
                return Ok(());
            }

            let channel_name = channel.name().to_string();
            let existing = channel.members.clone();
            let roster: Vec<ChannelMember> = existing
                .iter()
                .filter_map(|m| self.clients.get(*m))
                .map(|m| ChannelMember {
                    id: m.id(),
                    master: channel.is_master(m.id()),
                    name: m.name().unwrap_or_default().to_string(),
                })
                .collect();

            let verdict = self.handlers.on_join_channel(client, channel);
            if let Some(reason) = verdict.denial(reason::JOIN_REFUSED) {
                self.deny_join(id, channel_name, reason);
                return Ok(());
            }

            self.count("join_channel", true);
            debug!(client = %id, channel = %channel_id, name = %channel_name, "joined channel");
            self.reply(
                id,
                Response::Joined {
                    channel: channel_id,
                    name: channel_name,
                    master: false,
                    members: roster,
                },
            );
            self.broadcast(
                &existing,
                &ServerMessage::Peer(PeerEvent {
                    channel: channel_id,
                    peer: id,
                    update: Some(PeerUpdate {
                        master: false,
                        name: client_name,
                    }),
                }),
            );
            self.link(id, channel_id);
            return Ok(());
        }

        let channel = self.channels.prepare(name, flags, id)?;
        let Some(client) = self.clients.get(id) else {
            self.channels.discard(channel);
            return Ok(());
        };
        let verdict = self.handlers.on_join_channel(client, &channel);
        if let Some(reason) = verdict.denial(reason::JOIN_REFUSED) {
            let name = channel.name().to_string();
            self.channels.discard(channel);
            self.deny_join(id, name, reason);
            return Ok(());
        }

        let channel_id = channel.id();
        let channel_name = channel.name().to_string();
        self.channels.register(channel);
        self.metrics.channels_active.inc(&[]);
        self.link(id, channel_id);

        self.count("join_channel", true);
        info!(channel = %channel_id, name = %channel_name, master = %id, hidden = flags.hidden, auto_close = flags.auto_close, "channel created");
        self.reply(
            id,
            Response::Joined {
                channel: channel_id,
                name: channel_name,
                master: true,
                members: Vec::new(),
            },
        );
        Ok(())
    }

    fn deny_join(&mut self, id: ClientId, name: String, reason: String) {
        let name = echoable(name);
        debug!(client = %id, %name, %reason, "join denied");
        self.count("join_channel", false);
        self.reply(id, Response::JoinDenied { name, reason });
    }

    fn handle_leave(&mut self, id: ClientId, channel_id: ChannelId) {
        let target = self
            .clients
            .get(id)
            .filter(|c| c.is_member_of(channel_id))
            .zip(self.channels.get(channel_id));

        let Some((client, channel)) = target else {
            self.count("leave_channel", false);
            self.reply(
                id,
                Response::LeaveDenied {
                    channel: channel_id,
                    reason: reason::NOT_MEMBER.into(),
                },
            );
            return;
        };

        let verdict = self.handlers.on_leave_channel(client, channel);
        if let Some(reason) = verdict.denial(reason::LEAVE_REFUSED) {
            self.count("leave_channel", false);
            self.reply(
                id,
                Response::LeaveDenied {
                    channel: channel_id,
                    reason,
                },
            );
            return;
        }

        self.count("leave_channel", true);
        debug!(client = %id, channel = %channel_id, "left channel");
        self.reply(id, Response::Left { channel: channel_id });
        self.remove_member(id, channel_id);
    }

    fn handle_list(&mut self, id: ClientId) {
        if !self.options.channel_listing {
            self.count("list_channels", false);
            self.reply(
                id,
                Response::ChannelListDenied {
                    reason: reason::LISTING_DISABLED.into(),
                },
            );
            return;
        }

        let channels = self
            .channels
            .iter()
            .filter(|c| !c.is_hidden())
            .map(|c| ChannelListing {
                name: c.name().to_string(),
                member_count: u16::try_from(c.member_count()).unwrap_or(u16::MAX),
            })
            .collect();
        self.count("list_channels", true);
        self.reply(id, Response::ChannelList { channels });
    }

    fn relay_to_channel(
        &mut self,
        id: ClientId,
        channel_id: ChannelId,
        delivery: Delivery,
        message: BinaryMessage,
    ) {
        let target = self
            .clients
            .get(id)
            .zip(self.channels.get(channel_id))
            .filter(|(_, ch)| ch.contains(id));
        let Some((client, channel)) = target else {
            self.dropped("channel", "not_member", id);
            return;
        };

        if !self
            .handlers
            .on_channel_message(client, channel, delivery, &message)
            .is_allow()
        {
            self.dropped("channel", "vetoed", id);
            return;
        }

        let recipients = others_in(channel, id);
        let msg = ServerMessage::FromChannel {
            channel: channel_id,
            sender: id,
            message,
        };
        let bytes = match self.encode(&msg, delivery) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode channel message");
                return;
            }
        };
        for r in recipients {
            self.deliver(r, delivery, &bytes);
        }
        self.metrics
            .messages_relayed
            .inc(&[("kind", "channel"), ("delivery", delivery.as_str())]);
    }

    fn relay_to_peer(
        &mut self,
        id: ClientId,
        channel_id: ChannelId,
        peer_id: ClientId,
        delivery: Delivery,
        message: BinaryMessage,
    ) {
        let target = self
            .channels
            .get(channel_id)
            .filter(|ch| peer_id != id && ch.contains(id) && ch.contains(peer_id))
            .zip(self.clients.get(id))
            .zip(self.clients.get(peer_id));
        let Some(((channel, client), peer)) = target else {
            self.dropped("peer", "not_member", id);
            return;
        };

        if !self
            .handlers
            .on_peer_message(client, channel, peer, delivery, &message)
            .is_allow()
        {
            self.dropped("peer", "vetoed", id);
            return;
        }

        let msg = ServerMessage::FromPeer {
            channel: channel_id,
            sender: id,
            message,
        };
        let bytes = match self.encode(&msg, delivery) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode peer message");
                return;
            }
        };
        self.deliver(peer_id, delivery, &bytes);
        self.metrics
            .messages_relayed
            .inc(&[("kind", "peer"), ("delivery", delivery.as_str())]);
    }

    fn dropped(&self, kind: &'static str, why: &'static str, sender: ClientId) {
        debug!(client = %sender, kind, reason = why, "message dropped");
        self.metrics
            .messages_dropped
            .inc(&[("kind", kind), ("reason", why)]);
    }

    // --------------------
    // Membership
    // --------------------

    fn link(&mut self, id: ClientId, channel_id: ChannelId) {
        if let Some(channel) = self.channels.get_mut(channel_id) {
            channel.members.push(id);
        }
        if let Some(client) = self.clients.get_mut(id) {
            client.channels.insert(channel_id);
        }
    }

    /// Take `id` out of a channel. The channel closes when it empties or
    /// when its auto-close master leaves; otherwise the rest are told.
    fn remove_member(&mut self, id: ClientId, channel_id: ChannelId) {
        if let Some(client) = self.clients.get_mut(id) {
            client.channels.remove(&channel_id);
        }
        let Some(channel) = self.channels.get_mut(channel_id) else {
            return;
        };
        channel.members.retain(|m| *m != id);

        let was_master = channel.is_master(id);
        if channel.members.is_empty() || (was_master && channel.auto_close) {
            self.close_channel_inner(channel_id);
            return;
        }
        if was_master {
            channel.master = None;
        }

        let remaining = channel.members.clone();
        self.broadcast(
            &remaining,
            &ServerMessage::Peer(PeerEvent {
                channel: channel_id,
                peer: id,
                update: None,
            }),
        );
    }

    fn close_channel_inner(&mut self, channel_id: ChannelId) -> bool {
        let Some(channel) = self.channels.remove(channel_id) else {
            return false;
        };
        self.metrics.channels_active.dec(&[]);

        for m in &channel.members {
            if let Some(client) = self.clients.get_mut(*m) {
                client.channels.remove(&channel_id);
            }
        }
        self.broadcast(
            &channel.members,
            &ServerMessage::Response(Response::Left {
                channel: channel_id,
            }),
        );
        info!(channel = %channel_id, name = %channel.name(), "channel closed");
        true
    }

    /// Close the transport and clean up.
    fn drop_client(&mut self, id: ClientId, why: &'static str) -> bool {
        let Some(conn) = self.clients.get(id).map(Client::connection) else {
            return false;
        };
        self.outbox.close(conn);
        self.remove_client(id, why);
        true
    }

    fn remove_client(&mut self, id: ClientId, why: &'static str) {
        let channels: Vec<ChannelId> = match self.clients.get(id) {
            Some(client) => client.channels().collect(),
            None => return,
        };
        for ch in channels {
            self.remove_member(id, ch);
        }

        let Some(client) = self.clients.remove(id) else {
            return;
        };
        self.metrics.clients_active.dec(&[]);
        self.metrics.disconnects.inc(&[("reason", why)]);
        info!(client = %id, conn = %client.connection(), reason = why, "client disconnected");

        if client.handshook {
            self.handlers.on_disconnect(&client);
        }
    }

    fn violation(&mut self, id: ClientId, error: RelayError) {
        self.metrics
            .protocol_violations
            .inc(&[("class", error.class().as_str())]);
        if let Some(client) = self.clients.get(id) {
            warn!(client = %id, address = %client.address(), error = %error, "protocol violation, closing connection");
            self.handlers.on_error(client, &error);
        }
        self.drop_client(id, "protocol_violation");
    }

    // --------------------
    // Output
    // --------------------

    fn count(&self, request: &'static str, ok: bool) {
        let outcome = if ok { "ok" } else { "denied" };
        self.metrics
            .requests
            .inc(&[("request", request), ("outcome", outcome)]);
    }

    fn encode(&self, msg: &ServerMessage, delivery: Delivery) -> Result<Bytes> {
        let frame = msg.to_frame()?;
        match delivery {
            Delivery::Reliable => frame.to_stream_bytes(),
            Delivery::Blasted => Ok(encode_datagram(&frame, None)),
        }
    }

    /// Returns false when the client is gone or has no datagram address.
    fn deliver(&mut self, to: ClientId, delivery: Delivery, bytes: &Bytes) -> bool {
        let Some(client) = self.clients.get(to) else {
            return false;
        };
        match delivery {
            Delivery::Reliable => {
                self.outbox.send(client.connection(), bytes.clone());
                true
            }
            Delivery::Blasted => match client.udp_address() {
                Some(addr) => {
                    self.outbox.send_to(addr, bytes.clone());
                    true
                }
                None => {
                    debug!(client = %to, "no datagram address, blasted message skipped");
                    false
                }
            },
        }
    }

    fn broadcast(&mut self, to: &[ClientId], msg: &ServerMessage) {
        let bytes = match self.encode(msg, Delivery::Reliable) {
            Ok(b) => b,
            Err(e) => {
                error!(error = %e, "failed to encode outgoing message");
                return;
            }
        };
        for id in to {
            self.deliver(*id, Delivery::Reliable, &bytes);
        }
    }

    fn reply(&mut self, to: ClientId, response: Response) {
        self.broadcast(&[to], &ServerMessage::Response(response));
    }
}

fn others_in(channel: &Channel, id: ClientId) -> Vec<ClientId> {
    channel
        .members
        .iter()
        .copied()
        .filter(|m| *m != id)
        .collect()
}
