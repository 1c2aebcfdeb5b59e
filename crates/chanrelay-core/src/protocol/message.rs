//! Typed protocol messages.
//!
//! `ClientMessage` is what a client sends (server parses it), `ServerMessage`
//! is what the server sends (client parses it). Both convert to and from a
//! `Frame`; transport framing lives in `frame`.

use bytes::Bytes;

use crate::error::{RelayError, Result};
use crate::protocol::frame::Frame;
use crate::protocol::payload::{PayloadReader, PayloadWriter};
use crate::protocol::types::{request, to_client, to_server, ChannelId, ClientId};

/// Flags carried by a JoinChannel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JoinFlags {
    /// Leave the channel out of channel listings.
    pub hidden: bool,
    /// Close the channel when its master leaves.
    pub auto_close: bool,
}

impl JoinFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            hidden: b & 0x01 != 0,
            auto_close: b & 0x02 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        u8::from(self.hidden) | (u8::from(self.auto_close) << 1)
    }
}

/// Opaque application data with its routing tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMessage {
    /// 4-bit application tag carried in the header.
    pub variant: u8,
    /// 8-bit application channel carried in the body.
    pub subchannel: u8,
    pub data: Bytes,
}

impl BinaryMessage {
    pub fn new(subchannel: u8, variant: u8, data: impl Into<Bytes>) -> Self {
        Self {
            variant: variant & 0x0F,
            subchannel,
            data: data.into(),
        }
    }
}

/// Control requests (type 0, client → server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect { version: String },
    SetName { name: String },
    JoinChannel { name: String, flags: JoinFlags },
    LeaveChannel { channel: ChannelId },
    ListChannels,
}

impl Request {
    pub fn code(&self) -> u8 {
        match self {
            Request::Connect { .. } => request::CONNECT,
            Request::SetName { .. } => request::SET_NAME,
            Request::JoinChannel { .. } => request::JOIN_CHANNEL,
            Request::LeaveChannel { .. } => request::LEAVE_CHANNEL,
            Request::ListChannels => request::LIST_CHANNELS,
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        request_label(self.code())
    }

    fn decode(r: &mut PayloadReader) -> Result<Self> {
        let req = match r.u8()? {
            request::CONNECT => Request::Connect {
                version: r.rest_text_lossy(),
            },
            request::SET_NAME => Request::SetName {
                name: r.rest_string()?,
            },
            request::JOIN_CHANNEL => {
                let flags = JoinFlags::from_byte(r.u8()?);
                Request::JoinChannel {
                    name: r.rest_string()?,
                    flags,
                }
            }
            request::LEAVE_CHANNEL => Request::LeaveChannel {
                channel: ChannelId(r.u16()?),
            },
            request::LIST_CHANNELS => Request::ListChannels,
            other => {
                return Err(RelayError::protocol(format!("unknown request code {other}")));
            }
        };
        Ok(req)
    }

    fn encode(&self) -> Bytes {
        let w = PayloadWriter::new().u8(self.code());
        match self {
            Request::Connect { version } => w.str(version),
            Request::SetName { name } => w.str(name),
            Request::JoinChannel { name, flags } => w.u8(flags.to_byte()).str(name),
            Request::LeaveChannel { channel } => w.u16(channel.0),
            Request::ListChannels => w,
        }
        .finish()
    }
}

/// Label for a request sub-code.
pub fn request_label(code: u8) -> &'static str {
    match code {
        request::CONNECT => "connect",
        request::SET_NAME => "set_name",
        request::JOIN_CHANNEL => "join_channel",
        request::LEAVE_CHANNEL => "leave_channel",
        request::LIST_CHANNELS => "list_channels",
        _ => "unknown",
    }
}

/// Everything a client can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Request(Request),
    ToServer(BinaryMessage),
    ToChannel {
        channel: ChannelId,
        message: BinaryMessage,
    },
    ToPeer {
        channel: ChannelId,
        peer: ClientId,
        message: BinaryMessage,
    },
    /// Reserved JSON message family; accepted and ignored.
    Object { msg_type: u8 },
    UdpHello,
    /// Reserved; accepted and ignored.
    ChannelMaster,
    Pong,
}

impl ClientMessage {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ClientMessage::Request(_) => "request",
            ClientMessage::ToServer(_) => "binary_server",
            ClientMessage::ToChannel { .. } => "binary_channel",
            ClientMessage::ToPeer { .. } => "binary_peer",
            ClientMessage::Object { .. } => "object",
            ClientMessage::UdpHello => "udp_hello",
            ClientMessage::ChannelMaster => "channel_master",
            ClientMessage::Pong => "pong",
        }
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let variant = frame.variant;
        let msg_type = frame.msg_type;
        let mut r = PayloadReader::new(frame.payload);

        let msg = match msg_type {
            to_server::REQUEST => ClientMessage::Request(Request::decode(&mut r)?),
            to_server::BINARY_SERVER => {
                let subchannel = r.u8()?;
                ClientMessage::ToServer(BinaryMessage {
                    variant,
                    subchannel,
                    data: r.rest(),
                })
            }
            to_server::BINARY_CHANNEL => {
                let subchannel = r.u8()?;
                let channel = ChannelId(r.u16()?);
                ClientMessage::ToChannel {
                    channel,
                    message: BinaryMessage {
                        variant,
                        subchannel,
                        data: r.rest(),
                    },
                }
            }
            to_server::BINARY_PEER => {
                let subchannel = r.u8()?;
                let channel = ChannelId(r.u16()?);
                let peer = ClientId(r.u16()?);
                ClientMessage::ToPeer {
                    channel,
                    peer,
                    message: BinaryMessage {
                        variant,
                        subchannel,
                        data: r.rest(),
                    },
                }
            }
            to_server::OBJECT_SERVER | to_server::OBJECT_CHANNEL | to_server::OBJECT_PEER => {
                ClientMessage::Object { msg_type }
            }
            to_server::UDP_HELLO => ClientMessage::UdpHello,
            to_server::CHANNEL_MASTER => ClientMessage::ChannelMaster,
            to_server::PONG => ClientMessage::Pong,
            other => {
                return Err(RelayError::protocol(format!("unknown message type {other}")));
            }
        };
        Ok(msg)
    }

    pub fn to_frame(&self) -> Frame {
        match self {
            ClientMessage::Request(req) => Frame::new(to_server::REQUEST, 0, req.encode()),
            ClientMessage::ToServer(m) => Frame::new(
                to_server::BINARY_SERVER,
                m.variant,
                PayloadWriter::new().u8(m.subchannel).bytes(&m.data).finish(),
            ),
            ClientMessage::ToChannel { channel, message: m } => Frame::new(
                to_server::BINARY_CHANNEL,
                m.variant,
                PayloadWriter::new()
                    .u8(m.subchannel)
                    .u16(channel.0)
                    .bytes(&m.data)
                    .finish(),
            ),
            ClientMessage::ToPeer {
                channel,
                peer,
                message: m,
            } => Frame::new(
                to_server::BINARY_PEER,
                m.variant,
                PayloadWriter::new()
                    .u8(m.subchannel)
                    .u16(channel.0)
                    .u16(peer.0)
                    .bytes(&m.data)
                    .finish(),
            ),
            ClientMessage::Object { msg_type } => Frame::signal(*msg_type),
            ClientMessage::UdpHello => Frame::signal(to_server::UDP_HELLO),
            ClientMessage::ChannelMaster => Frame::signal(to_server::CHANNEL_MASTER),
            ClientMessage::Pong => Frame::signal(to_server::PONG),
        }
    }
}

/// One entry of the roster sent with a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMember {
    pub id: ClientId,
    pub master: bool,
    pub name: String,
}

/// One entry of a channel listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelListing {
    pub name: String,
    pub member_count: u16,
}

/// Responses to `Request`s (type 0, server → client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ConnectAccepted {
        id: ClientId,
        welcome: String,
    },
    ConnectDenied {
        reason: String,
    },
    NameSet {
        name: String,
    },
    NameDenied {
        name: String,
        reason: String,
    },
    Joined {
        channel: ChannelId,
        name: String,
        master: bool,
        members: Vec<ChannelMember>,
    },
    JoinDenied {
        name: String,
        reason: String,
    },
    Left {
        channel: ChannelId,
    },
    LeaveDenied {
        channel: ChannelId,
        reason: String,
    },
    ChannelList {
        channels: Vec<ChannelListing>,
    },
    ChannelListDenied {
        reason: String,
    },
}

impl Response {
    fn decode(r: &mut PayloadReader) -> Result<Self> {
        let code = r.u8()?;
        let succeeded = r.u8()? != 0;

        let resp = match (code, succeeded) {
            (request::CONNECT, true) => Response::ConnectAccepted {
                id: ClientId(r.u16()?),
                welcome: r.rest_text_lossy(),
            },
            (request::CONNECT, false) => Response::ConnectDenied {
                reason: r.rest_text_lossy(),
            },
            (request::SET_NAME, true) => Response::NameSet {
                name: r.short_string()?,
            },
            (request::SET_NAME, false) => Response::NameDenied {
                name: r.short_string()?,
                reason: r.rest_text_lossy(),
            },
            (request::JOIN_CHANNEL, true) => {
                let master = r.u8()? & 0x01 != 0;
                let name = r.short_string()?;
                let channel = ChannelId(r.u16()?);
                let mut members = Vec::new();
                while !r.is_empty() {
                    let id = ClientId(r.u16()?);
                    let flags = r.u8()?;
                    let name = r.short_string()?;
                    members.push(ChannelMember {
                        id,
                        master: flags & 0x01 != 0,
                        name,
                    });
                }
                Response::Joined {
                    channel,
                    name,
                    master,
                    members,
                }
            }
            (request::JOIN_CHANNEL, false) => Response::JoinDenied {
                name: r.short_string()?,
                reason: r.rest_text_lossy(),
            },
            (request::LEAVE_CHANNEL, true) => Response::Left {
                channel: ChannelId(r.u16()?),
            },
            (request::LEAVE_CHANNEL, false) => Response::LeaveDenied {
                channel: ChannelId(r.u16()?),
                reason: r.rest_text_lossy(),
            },
            (request::LIST_CHANNELS, true) => {
                let mut channels = Vec::new();
                while !r.is_empty() {
                    let member_count = r.u16()?;
                    let name = r.short_string()?;
                    channels.push(ChannelListing { name, member_count });
                }
                Response::ChannelList { channels }
            }
            (request::LIST_CHANNELS, false) => Response::ChannelListDenied {
                reason: r.rest_text_lossy(),
            },
            (other, _) => {
                return Err(RelayError::protocol(format!("unknown response code {other}")));
            }
        };
        Ok(resp)
    }

    fn encode(&self) -> Result<Bytes> {
        let w = PayloadWriter::new();
        let w = match self {
            Response::ConnectAccepted { id, welcome } => {
                w.u8(request::CONNECT).u8(1).u16(id.0).str(welcome)
            }
            Response::ConnectDenied { reason } => w.u8(request::CONNECT).u8(0).str(reason),
            Response::NameSet { name } => w.u8(request::SET_NAME).u8(1).short_str(name)?,
            Response::NameDenied { name, reason } => w
                .u8(request::SET_NAME)
                .u8(0)
                .short_str(name)?
                .str(reason),
            Response::Joined {
                channel,
                name,
                master,
                members,
            } => {
                let mut w = w
                    .u8(request::JOIN_CHANNEL)
                    .u8(1)
                    .u8(u8::from(*master))
                    .short_str(name)?
                    .u16(channel.0);
                for m in members {
                    w = w.u16(m.id.0).u8(u8::from(m.master)).short_str(&m.name)?;
                }
                w
            }
            Response::JoinDenied { name, reason } => w
                .u8(request::JOIN_CHANNEL)
                .u8(0)
                .short_str(name)?
                .str(reason),
            Response::Left { channel } => w.u8(request::LEAVE_CHANNEL).u8(1).u16(channel.0),
            Response::LeaveDenied { channel, reason } => w
                .u8(request::LEAVE_CHANNEL)
                .u8(0)
                .u16(channel.0)
                .str(reason),
            Response::ChannelList { channels } => {
                let mut w = w.u8(request::LIST_CHANNELS).u8(1);
                for c in channels {
                    w = w.u16(c.member_count).short_str(&c.name)?;
                }
                w
            }
            Response::ChannelListDenied { reason } => {
                w.u8(request::LIST_CHANNELS).u8(0).str(reason)
            }
        };
        Ok(w.finish())
    }
}

/// Roster change for one peer of one channel (type 9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub channel: ChannelId,
    pub peer: ClientId,
    /// `None` means the peer left the channel.
    pub update: Option<PeerUpdate>,
}

/// A peer that joined, renamed, or changed master status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub master: bool,
    pub name: String,
}

/// Everything the server can send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Response(Response),
    FromServer(BinaryMessage),
    FromChannel {
        channel: ChannelId,
        sender: ClientId,
        message: BinaryMessage,
    },
    FromPeer {
        channel: ChannelId,
        sender: ClientId,
        message: BinaryMessage,
    },
    /// Sent by the server application to a whole channel.
    FromServerChannel {
        channel: ChannelId,
        message: BinaryMessage,
    },
    /// Reserved JSON message family; ignored.
    Object { msg_type: u8 },
    Peer(PeerEvent),
    UdpWelcome,
    Ping,
}

impl ServerMessage {
    pub fn decode(frame: Frame) -> Result<Self> {
        let variant = frame.variant;
        let msg_type = frame.msg_type;
        let mut r = PayloadReader::new(frame.payload);

        let msg = match msg_type {
            to_client::RESPONSE => ServerMessage::Response(Response::decode(&mut r)?),
            to_client::BINARY_SERVER => {
                let subchannel = r.u8()?;
                ServerMessage::FromServer(BinaryMessage {
                    variant,
                    subchannel,
                    data: r.rest(),
                })
            }
            to_client::BINARY_CHANNEL | to_client::BINARY_PEER => {
                let subchannel = r.u8()?;
                let channel = ChannelId(r.u16()?);
                let sender = ClientId(r.u16()?);
                let message = BinaryMessage {
                    variant,
                    subchannel,
                    data: r.rest(),
                };
                if msg_type == to_client::BINARY_CHANNEL {
                    ServerMessage::FromChannel {
                        channel,
                        sender,
                        message,
                    }
                } else {
                    ServerMessage::FromPeer {
                        channel,
                        sender,
                        message,
                    }
                }
            }
            to_client::BINARY_SERVER_CHANNEL => {
                let subchannel = r.u8()?;
                let channel = ChannelId(r.u16()?);
                ServerMessage::FromServerChannel {
                    channel,
                    message: BinaryMessage {
                        variant,
                        subchannel,
                        data: r.rest(),
                    },
                }
            }
            to_client::OBJECT_SERVER
            | to_client::OBJECT_CHANNEL
            | to_client::OBJECT_PEER
            | to_client::OBJECT_SERVER_CHANNEL => ServerMessage::Object { msg_type },
            to_client::PEER => {
                let channel = ChannelId(r.u16()?);
                let peer = ClientId(r.u16()?);
                let update = if r.is_empty() {
                    None
                } else {
                    let flags = r.u8()?;
                    Some(PeerUpdate {
                        master: flags & 0x01 != 0,
                        name: r.rest_string()?,
                    })
                };
                ServerMessage::Peer(PeerEvent {
                    channel,
                    peer,
                    update,
                })
            }
            to_client::UDP_WELCOME => ServerMessage::UdpWelcome,
            to_client::PING => ServerMessage::Ping,
            other => {
                return Err(RelayError::protocol(format!("unknown message type {other}")));
            }
        };
        Ok(msg)
    }

    pub fn to_frame(&self) -> Result<Frame> {
        let frame = match self {
            ServerMessage::Response(resp) => Frame::new(to_client::RESPONSE, 0, resp.encode()?),
            ServerMessage::FromServer(m) => Frame::new(
                to_client::BINARY_SERVER,
                m.variant,
                PayloadWriter::new().u8(m.subchannel).bytes(&m.data).finish(),
            ),
            ServerMessage::FromChannel {
                channel,
                sender,
                message: m,
            } => Frame::new(
                to_client::BINARY_CHANNEL,
                m.variant,
                relayed_body(*channel, *sender, m),
            ),
            ServerMessage::FromPeer {
                channel,
                sender,
                message: m,
            } => Frame::new(
                to_client::BINARY_PEER,
                m.variant,
                relayed_body(*channel, *sender, m),
            ),
            ServerMessage::FromServerChannel { channel, message: m } => Frame::new(
                to_client::BINARY_SERVER_CHANNEL,
                m.variant,
                PayloadWriter::new()
                    .u8(m.subchannel)
                    .u16(channel.0)
                    .bytes(&m.data)
                    .finish(),
            ),
            ServerMessage::Object { msg_type } => Frame::signal(*msg_type),
            ServerMessage::Peer(ev) => {
                let w = PayloadWriter::new().u16(ev.channel.0).u16(ev.peer.0);
                let w = match &ev.update {
                    Some(u) => w.u8(u8::from(u.master)).str(&u.name),
                    None => w,
                };
                Frame::new(to_client::PEER, 0, w.finish())
            }
            ServerMessage::UdpWelcome => Frame::signal(to_client::UDP_WELCOME),
            ServerMessage::Ping => Frame::signal(to_client::PING),
        };
        Ok(frame)
    }
}

/// Body of a relayed channel/peer message: the sender's id is injected ahead
/// of the data.
fn relayed_body(channel: ChannelId, sender: ClientId, m: &BinaryMessage) -> Bytes {
    PayloadWriter::new()
        .u8(m.subchannel)
        .u16(channel.0)
        .u16(sender.0)
        .bytes(&m.data)
        .finish()
}
