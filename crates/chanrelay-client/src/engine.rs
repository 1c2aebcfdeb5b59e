//! Sans-IO relay client.
//!
//! The driver feeds stream bytes, datagrams, a retry tick and the transport
//! lifecycle into `RelayClient`, then drains `poll_transmit` and writes what
//! comes out. Application commands are checked locally first; a failed
//! precondition goes to `on_error` and nothing is sent.

use std::collections::{BTreeMap, VecDeque};
use std::mem;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use chanrelay_core::protocol::frame::{decode_datagram, encode_datagram, FrameReader};
use chanrelay_core::protocol::message::{
    BinaryMessage, ChannelListing, ClientMessage, JoinFlags, PeerEvent, Request, Response,
    ServerMessage,
};
use chanrelay_core::protocol::types::{MAX_NAME_LEN, OPENING_BYTE, PROTOCOL_REVISION};
use chanrelay_core::{ChannelId, ClientId, Delivery};

use crate::error::ClientError;
use crate::handlers::RelayClientHandlers;
use crate::mirror::{Channel, Peer};

/// Largest frame accepted from the server.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Disconnected,
    /// Connect sent, waiting for the response.
    Handshaking,
    /// Handshake accepted; UDPHello is being retried until UDPWelcome.
    AwaitingUdp,
    Connected,
}

/// Output for the driver, in the order it was produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transmit {
    Stream(Bytes),
    Datagram(Bytes),
    /// Close the stream after everything queued before it was written.
    Close,
}

pub struct RelayClient<H> {
    handlers: H,
    state: ClientState,
    id: Option<ClientId>,
    name: Option<String>,
    welcome: String,
    channels: BTreeMap<ChannelId, Channel>,
    listing: Vec<ChannelListing>,
    reader: FrameReader,
    transmits: VecDeque<Transmit>,
}

impl<H: RelayClientHandlers> RelayClient<H> {
    pub fn new(handlers: H) -> Self {
        Self {
            handlers,
            state: ClientState::Disconnected,
            id: None,
            name: None,
            welcome: String::new(),
            channels: BTreeMap::new(),
            listing: Vec::new(),
            reader: FrameReader::new(DEFAULT_MAX_PAYLOAD),
            transmits: VecDeque::new(),
        }
    }

    pub fn handlers(&self) -> &H {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut H {
        &mut self.handlers
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Both the handshake and the datagram path are confirmed.
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn welcome_message(&self) -> &str {
        &self.welcome
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    /// Result of the last successful `list_channels`.
    pub fn channel_listing(&self) -> &[ChannelListing] {
        &self.listing
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    // --------------------
    // Transport inputs
    // --------------------

    /// The stream is up: send the opening byte and Connect.
    pub fn transport_connected(&mut self) {
        self.clear();
        self.state = ClientState::Handshaking;

        let connect = ClientMessage::Request(Request::Connect {
            version: PROTOCOL_REVISION.into(),
        });
        match connect.to_frame().to_stream_bytes() {
            Ok(frame) => {
                let mut out = BytesMut::with_capacity(frame.len() + 1);
                out.put_u8(OPENING_BYTE);
                out.put_slice(&frame);
                self.transmits.push_back(Transmit::Stream(out.freeze()));
            }
            Err(e) => self.fail(e.into()),
        }
    }

    pub fn receive(&mut self, data: &[u8]) {
        self.reader.push(data);
        loop {
            let frame = match self.reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail(e.into());
                    break;
                }
            };
            match ServerMessage::decode(frame) {
                Ok(msg) => self.handle(msg, Delivery::Reliable),
                Err(e) => {
                    warn!(error = %e, "undecodable message from server ignored");
                    self.report(e.into());
                }
            }
        }
    }

    pub fn receive_datagram(&mut self, data: Bytes) {
        let msg = decode_datagram(data, false).and_then(|(frame, _)| ServerMessage::decode(frame));
        match msg {
            Ok(msg) => self.handle(msg, Delivery::Blasted),
            Err(e) => debug!(error = %e, "malformed datagram dropped"),
        }
    }

    /// Retry timer. Queues a UDPHello while waiting for UDPWelcome.
    pub fn udp_tick(&mut self) {
        if self.state != ClientState::AwaitingUdp {
            return;
        }
        if let Some(id) = self.id {
            let hello = encode_datagram(&ClientMessage::UdpHello.to_frame(), Some(id));
            self.transmits.push_back(Transmit::Datagram(hello));
        }
    }

    /// The stream closed, from either side.
    pub fn transport_closed(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        info!(client = ?self.id, "disconnected from relay");
        self.handlers.on_disconnect();
        self.clear();
    }

    // --------------------
    // Commands
    // --------------------

    pub fn disconnect(&mut self) {
        if self.state != ClientState::Disconnected {
            self.transmits.push_back(Transmit::Close);
        }
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        self.check_name(name)?;
        self.send(
            ClientMessage::Request(Request::SetName { name: name.into() }),
            Delivery::Reliable,
        )
    }

    pub fn join(&mut self, name: &str, hidden: bool, auto_close: bool) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        if self.name.is_none() {
            return Err(self.reject(ClientError::NameRequired));
        }
        self.check_name(name)?;
        self.send(
            ClientMessage::Request(Request::JoinChannel {
                name: name.into(),
                flags: JoinFlags { hidden, auto_close },
            }),
            Delivery::Reliable,
        )
    }

    pub fn leave(&mut self, channel: ChannelId) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        self.ensure_channel(channel)?;
        self.send(
            ClientMessage::Request(Request::LeaveChannel { channel }),
            Delivery::Reliable,
        )
    }

    pub fn list_channels(&mut self) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        self.send(ClientMessage::Request(Request::ListChannels), Delivery::Reliable)
    }

    pub fn send_server(&mut self, delivery: Delivery, message: BinaryMessage) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        self.send(ClientMessage::ToServer(message), delivery)
    }

    pub fn send_channel(
        &mut self,
        channel: ChannelId,
        delivery: Delivery,
        message: BinaryMessage,
    ) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        self.ensure_channel(channel)?;
        self.send(ClientMessage::ToChannel { channel, message }, delivery)
    }

    pub fn send_peer(
        &mut self,
        channel: ChannelId,
        peer: ClientId,
        delivery: Delivery,
        message: BinaryMessage,
    ) -> Result<(), ClientError> {
        self.ensure_handshook()?;
        self.ensure_channel(channel)?;
        if !self.channels.get(&channel).is_some_and(|c| c.peers.contains_key(&peer)) {
            return Err(self.reject(ClientError::UnknownPeer { channel, peer }));
        }
        self.send(
            ClientMessage::ToPeer {
                channel,
                peer,
                message,
            },
            delivery,
        )
    }

    // --------------------
    // Incoming messages
    // --------------------

    fn handle(&mut self, msg: ServerMessage, delivery: Delivery) {
        match msg {
            ServerMessage::Response(response) => {
                if delivery.is_blasted() {
                    debug!("response over datagram ignored");
                    return;
                }
                self.handle_response(response);
            }
            ServerMessage::FromServer(message) => {
                self.handlers.on_server_message(delivery, &message);
            }
            ServerMessage::FromServerChannel { channel, message } => {
                let Some(ch) = self.channels.get(&channel) else {
                    debug!(%channel, "server channel message for unknown channel ignored");
                    return;
                };
                self.handlers
                    .on_server_channel_message(ch, delivery, &message);
            }
            ServerMessage::FromChannel {
                channel,
                sender,
                message,
            } => {
                let Some((ch, peer)) = lookup(&self.channels, channel, sender) else {
                    debug!(%channel, peer = %sender, "channel message from unknown peer ignored");
                    return;
                };
                self.handlers.on_channel_message(ch, peer, delivery, &message);
            }
            ServerMessage::FromPeer {
                channel,
                sender,
                message,
            } => {
                let Some((ch, peer)) = lookup(&self.channels, channel, sender) else {
                    debug!(%channel, peer = %sender, "peer message from unknown peer ignored");
                    return;
                };
                self.handlers.on_peer_message(ch, peer, delivery, &message);
            }
            ServerMessage::Object { msg_type } => {
                debug!(msg_type, "object message ignored");
            }
            ServerMessage::Peer(event) => self.handle_peer(event),
            ServerMessage::UdpWelcome => {
                if !delivery.is_blasted() || self.state != ClientState::AwaitingUdp {
                    return;
                }
                let Some(id) = self.id else {
                    return;
                };
                self.state = ClientState::Connected;
                info!(client = %id, "connected to relay");
                self.handlers.on_connect(id, &self.welcome);
            }
            ServerMessage::Ping => {
                if let Err(e) = self.send(ClientMessage::Pong, Delivery::Reliable) {
                    debug!(error = %e, "pong not sent");
                }
            }
        }
    }

    fn handle_response(&mut self, response: Response) {
        match response {
            Response::ConnectAccepted { id, welcome } => {
                if self.state != ClientState::Handshaking {
                    warn!(client = %id, "unexpected connect response ignored");
                    return;
                }
                self.id = Some(id);
                self.welcome = welcome;
                self.state = ClientState::AwaitingUdp;
                debug!(client = %id, "handshake accepted, waiting for datagram path");
                self.udp_tick();
            }
            Response::ConnectDenied { reason } => {
                info!(%reason, "connection denied");
                self.handlers.on_connection_denied(&reason);
                self.disconnect();
            }
            Response::NameSet { name } => match self.name.replace(name) {
                None => {
                    let name = self.name.as_deref().unwrap_or_default();
                    self.handlers.on_name_set(name);
                }
                Some(old) => {
                    let name = self.name.as_deref().unwrap_or_default();
                    self.handlers.on_name_changed(&old, name);
                }
            },
            Response::NameDenied { name, reason } => {
                self.handlers.on_name_denied(&name, &reason);
            }
            Response::Joined {
                channel,
                name,
                master,
                members,
            } => {
                let ch = self
                    .channels
                    .entry(channel)
                    .or_insert_with(|| Channel::new(channel, name, master, members));
                self.handlers.on_join(ch);
            }
            Response::JoinDenied { name, reason } => {
                self.handlers.on_join_denied(&name, &reason);
            }
            Response::Left { channel } => {
                if let Some(ch) = self.channels.remove(&channel) {
                    self.handlers.on_leave(&ch);
                }
            }
            Response::LeaveDenied { channel, reason } => {
                if let Some(ch) = self.channels.get(&channel) {
                    self.handlers.on_leave_denied(ch, &reason);
                }
            }
            Response::ChannelList { channels } => {
                self.listing = channels;
                self.handlers.on_channel_list(&self.listing);
            }
            Response::ChannelListDenied { reason } => {
                self.report(ClientError::ListingDenied(reason));
            }
        }
    }

    fn handle_peer(&mut self, event: PeerEvent) {
        let Some(ch) = self.channels.get_mut(&event.channel) else {
            debug!(channel = %event.channel, "peer event for unknown channel ignored");
            return;
        };

        let Some(update) = event.update else {
            if let Some(peer) = ch.peers.remove(&event.peer) {
                self.handlers.on_peer_disconnect(ch, &peer);
            }
            return;
        };

        match ch.peers.get_mut(&event.peer) {
            None => {
                let peer = Peer {
                    id: event.peer,
                    name: update.name,
                    master: update.master,
                };
                ch.peers.insert(event.peer, peer);
                if let Some(peer) = ch.peers.get(&event.peer) {
                    self.handlers.on_peer_connect(ch, peer);
                }
            }
            Some(peer) => {
                peer.master = update.master;
                if peer.name == update.name {
                    return;
                }
                let old = mem::replace(&mut peer.name, update.name);
                if let Some(peer) = ch.peers.get(&event.peer) {
                    self.handlers.on_peer_change_name(ch, peer, &old);
                }
            }
        }
    }

    // --------------------
    // Helpers
    // --------------------

    fn send(&mut self, msg: ClientMessage, delivery: Delivery) -> Result<(), ClientError> {
        let frame = msg.to_frame();
        let transmit = match delivery {
            Delivery::Reliable => Transmit::Stream(frame.to_stream_bytes()?),
            Delivery::Blasted => {
                let Some(id) = self.id else {
                    return Err(self.reject(ClientError::NotConnected));
                };
                Transmit::Datagram(encode_datagram(&frame, Some(id)))
            }
        };
        self.transmits.push_back(transmit);
        Ok(())
    }

    fn ensure_handshook(&mut self) -> Result<(), ClientError> {
        match self.state {
            ClientState::AwaitingUdp | ClientState::Connected => Ok(()),
            _ => Err(self.reject(ClientError::NotConnected)),
        }
    }

    fn ensure_channel(&mut self, channel: ChannelId) -> Result<(), ClientError> {
        if self.channels.contains_key(&channel) {
            Ok(())
        } else {
            Err(self.reject(ClientError::UnknownChannel(channel)))
        }
    }

    fn check_name(&mut self, name: &str) -> Result<(), ClientError> {
        let problem = if name.is_empty() {
            "name is blank"
        } else if name.len() > MAX_NAME_LEN {
            "name is longer than 255 bytes"
        } else if name.contains('\0') {
            "name contains NUL"
        } else {
            return Ok(());
        };
        Err(self.reject(ClientError::InvalidName(problem)))
    }

    fn report(&mut self, error: ClientError) {
        self.handlers.on_error(&error);
    }

    /// Report a refused command and hand the error back to the caller.
    fn reject(&mut self, error: ClientError) -> ClientError {
        debug!(error = %error, "command rejected locally");
        self.report(error.clone());
        error
    }

    /// Unrecoverable stream error: report it and close.
    fn fail(&mut self, error: ClientError) {
        warn!(error = %error, "closing connection to relay");
        self.report(error);
        self.disconnect();
    }

    fn clear(&mut self) {
        self.state = ClientState::Disconnected;
        self.id = None;
        self.name = None;
        self.welcome.clear();
        self.channels.clear();
        self.listing.clear();
        self.reader = FrameReader::new(DEFAULT_MAX_PAYLOAD);
    }
}

fn lookup(
    channels: &BTreeMap<ChannelId, Channel>,
    channel: ChannelId,
    peer: ClientId,
) -> Option<(&Channel, &Peer)> {
    let ch = channels.get(&channel)?;
    Some((ch, ch.peers.get(&peer)?))
}
