#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use std::net::SocketAddr;

use bytes::Bytes;

use chanrelay_core::protocol::frame::encode_datagram;
use chanrelay_core::protocol::message::{
    BinaryMessage, ChannelListing, ChannelMember, ClientMessage, JoinFlags, PeerEvent, PeerUpdate,
    Request, Response, ServerMessage,
};
use chanrelay_core::protocol::types::{OPENING_BYTE, PROTOCOL_REVISION};
use chanrelay_core::{ChannelId, ClientId, Delivery, RelayError};

use super::*;

fn tcp(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn udp(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port + 1000))
}

fn server<H: RelayServerHandlers>(handlers: H) -> RelayServer<H, MemoryOutbox> {
    RelayServer::new(ServerOptions::default(), handlers, MemoryOutbox::new())
}

fn wire(msg: &ClientMessage) -> Bytes {
    msg.to_frame().to_stream_bytes().unwrap()
}

fn send<H: RelayServerHandlers>(s: &mut RelayServer<H, MemoryOutbox>, conn: u64, msg: ClientMessage) {
    s.receive(ConnectionId(conn), &wire(&msg)).unwrap();
}

fn request<H: RelayServerHandlers>(s: &mut RelayServer<H, MemoryOutbox>, conn: u64, req: Request) {
    send(s, conn, ClientMessage::Request(req));
}

/// Accept `conn` and complete the handshake.
fn connect<H: RelayServerHandlers>(s: &mut RelayServer<H, MemoryOutbox>, conn: u64) -> ClientId {
    let id = s.accept(ConnectionId(conn), tcp(conn as u16)).unwrap();
    s.receive(ConnectionId(conn), &[OPENING_BYTE]).unwrap();
    request(
        s,
        conn,
        Request::Connect {
            version: PROTOCOL_REVISION.into(),
        },
    );
    id
}

fn named<H: RelayServerHandlers>(s: &mut RelayServer<H, MemoryOutbox>, conn: u64, name: &str) -> ClientId {
    let id = connect(s, conn);
    request(s, conn, Request::SetName { name: name.into() });
    id
}

fn join<H: RelayServerHandlers>(s: &mut RelayServer<H, MemoryOutbox>, conn: u64, name: &str, flags: JoinFlags) {
    request(
        s,
        conn,
        Request::JoinChannel {
            name: name.into(),
            flags,
        },
    );
}

/// Bind a UDP address through a verified UDPHello.
fn hello<H: RelayServerHandlers>(s: &mut RelayServer<H, MemoryOutbox>, conn: u64, id: ClientId) {
    let frame = ClientMessage::UdpHello.to_frame();
    s.receive_datagram(udp(conn as u16), encode_datagram(&frame, Some(id)))
        .unwrap();
}

fn received<H: RelayServerHandlers>(s: &RelayServer<H, MemoryOutbox>, conn: u64) -> Vec<ServerMessage> {
    s.outbox().stream_to(ConnectionId(conn))
}

fn last<H: RelayServerHandlers>(s: &RelayServer<H, MemoryOutbox>, conn: u64) -> ServerMessage {
    received(s, conn).pop().expect("no message sent")
}

fn assert_membership_mirrors<H: RelayServerHandlers, O: Outbox>(s: &RelayServer<H, O>) {
    for client in s.clients() {
        for ch in client.channels() {
            let channel = s.channel(ch).expect("client lists a missing channel");
            assert!(channel.contains(client.id()));
        }
    }
    for channel in s.channels() {
        assert!(!channel.members().is_empty());
        for m in channel.members() {
            assert!(s.client(*m).unwrap().is_member_of(channel.id()));
        }
    }
}

#[test]
fn handshake_assigns_id_and_sends_welcome() {
    let mut s = server(());
    s.set_welcome_message("hi there");
    let id = connect(&mut s, 1);

    assert_eq!(id, ClientId(0));
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::ConnectAccepted {
            id,
            welcome: "hi there".into()
        })
    );
    assert!(s.client(id).unwrap().is_handshook());
}

#[test]
fn version_mismatch_replies_then_closes() {
    let mut s = server(());
    s.accept(ConnectionId(1), tcp(1)).unwrap();
    s.receive(ConnectionId(1), &[OPENING_BYTE]).unwrap();
    request(&mut s, 1, Request::Connect { version: "revision 2".into() });

    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::ConnectDenied {
            reason: reason::VERSION_MISMATCH.into()
        })
    );
    assert!(s.outbox().closed(ConnectionId(1)));
    assert_eq!(s.client_count(), 0);
}

#[test]
fn anything_but_connect_before_handshake_closes() {
    let mut s = server(());
    s.accept(ConnectionId(1), tcp(1)).unwrap();
    s.receive(ConnectionId(1), &[OPENING_BYTE]).unwrap();
    request(&mut s, 1, Request::SetName { name: "Eve".into() });

    assert!(received(&s, 1).is_empty());
    assert!(s.outbox().closed(ConnectionId(1)));
    assert_eq!(s.client_count(), 0);
}

#[test]
fn second_connect_is_a_violation() {
    let mut s = server(());
    connect(&mut s, 1);
    request(&mut s, 1, Request::Connect { version: PROTOCOL_REVISION.into() });
    assert!(s.outbox().closed(ConnectionId(1)));
}

#[test]
fn opening_byte_and_frames_may_arrive_in_one_read() {
    let mut s = server(());
    s.accept(ConnectionId(1), tcp(1)).unwrap();

    let mut bytes = vec![OPENING_BYTE];
    bytes.extend_from_slice(&wire(&ClientMessage::Request(Request::Connect {
        version: PROTOCOL_REVISION.into(),
    })));
    bytes.extend_from_slice(&wire(&ClientMessage::Request(Request::SetName {
        name: "Alice".into(),
    })));

    // Split mid-frame to exercise reassembly.
    let (a, b) = bytes.split_at(5);
    s.receive(ConnectionId(1), a).unwrap();
    s.receive(ConnectionId(1), b).unwrap();

    let got = received(&s, 1);
    assert_eq!(got.len(), 2);
    assert_eq!(
        got[1],
        ServerMessage::Response(Response::NameSet { name: "Alice".into() })
    );
}

#[test]
fn alice_and_bob_share_a_room() {
    let mut s = server(());
    let alice = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Room1", JoinFlags::default());

    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::Joined {
            channel: ChannelId(0),
            name: "Room1".into(),
            master: true,
            members: vec![],
        })
    );

    let bob = named(&mut s, 2, "Bob");
    join(&mut s, 2, "room1", JoinFlags::default());

    assert_eq!(
        last(&s, 2),
        ServerMessage::Response(Response::Joined {
            channel: ChannelId(0),
            name: "Room1".into(),
            master: false,
            members: vec![ChannelMember {
                id: alice,
                master: true,
                name: "Alice".into()
            }],
        })
    );
    assert_eq!(
        last(&s, 1),
        ServerMessage::Peer(PeerEvent {
            channel: ChannelId(0),
            peer: bob,
            update: Some(PeerUpdate {
                master: false,
                name: "Bob".into()
            }),
        })
    );

    s.outbox_mut().clear();
    send(
        &mut s,
        1,
        ClientMessage::ToChannel {
            channel: ChannelId(0),
            message: BinaryMessage::new(3, 1, &b"hello"[..]),
        },
    );

    assert_eq!(
        received(&s, 2),
        vec![ServerMessage::FromChannel {
            channel: ChannelId(0),
            sender: alice,
            message: BinaryMessage::new(3, 1, &b"hello"[..]),
        }]
    );
    assert!(received(&s, 1).is_empty(), "sender must not get an echo");
    assert_membership_mirrors(&s);
}

#[test]
fn duplicate_name_in_channel_is_refused() {
    let mut s = server(());
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    let imposter = named(&mut s, 2, "ALICE");
    join(&mut s, 2, "Lobby", JoinFlags::default());

    assert_eq!(
        last(&s, 2),
        ServerMessage::Response(Response::JoinDenied {
            name: "Lobby".into(),
            reason: reason::NAME_TAKEN.into()
        })
    );
    let lobby = s.channel_by_name("lobby").unwrap();
    assert_eq!(lobby.member_count(), 1);
    assert!(!s.client(imposter).unwrap().is_member_of(lobby.id()));
}

#[test]
fn rename_is_checked_against_every_joined_channel_and_announced() {
    let mut s = server(());
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    let bob = named(&mut s, 2, "Bob");
    join(&mut s, 2, "Lobby", JoinFlags::default());

    request(&mut s, 2, Request::SetName { name: "alice".into() });
    assert_eq!(
        last(&s, 2),
        ServerMessage::Response(Response::NameDenied {
            name: "alice".into(),
            reason: reason::NAME_TAKEN.into()
        })
    );
    assert_eq!(s.client(bob).unwrap().name(), Some("Bob"));

    request(&mut s, 2, Request::SetName { name: "Robert".into() });
    assert_eq!(
        last(&s, 1),
        ServerMessage::Peer(PeerEvent {
            channel: ChannelId(0),
            peer: bob,
            update: Some(PeerUpdate {
                master: false,
                name: "Robert".into()
            }),
        })
    );
}

#[test]
fn invalid_names_are_refused_with_a_reason() {
    let mut s = server(());
    let id = connect(&mut s, 1);
    request(&mut s, 1, Request::SetName { name: "a\0b".into() });
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::NameDenied {
            name: "a\0b".into(),
            reason: reason::INVALID_NAME.into()
        })
    );

    request(&mut s, 1, Request::SetName { name: "x".repeat(300) });
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::NameDenied {
            name: "x".repeat(255),
            reason: reason::NAME_TOO_LONG.into()
        })
    );
    assert!(!s.outbox().closed(ConnectionId(1)));

    // 400 bytes of two-byte chars: the echo stops at the last whole char.
    join(&mut s, 1, &"é".repeat(200), JoinFlags::default());
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::JoinDenied {
            name: "é".repeat(127),
            reason: reason::NAME_TOO_LONG.into()
        })
    );
    assert!(!s.outbox().closed(ConnectionId(1)));

    request(&mut s, 1, Request::SetName { name: "Alice".into() });
    assert_eq!(s.client(id).and_then(|c| c.name()), Some("Alice"));
}

#[test]
fn joining_requires_a_name() {
    let mut s = server(());
    connect(&mut s, 1);
    join(&mut s, 1, "Lobby", JoinFlags::default());
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::JoinDenied {
            name: "Lobby".into(),
            reason: reason::NAME_REQUIRED.into()
        })
    );
    assert_eq!(s.channel_count(), 0);
}

#[test]
fn auto_close_master_leaving_closes_the_channel() {
    let mut s = server(());
    named(&mut s, 1, "Alice");
    join(
        &mut s,
        1,
        "Game",
        JoinFlags {
            hidden: false,
            auto_close: true,
        },
    );
    named(&mut s, 2, "Bob");
    join(&mut s, 2, "Game", JoinFlags::default());
    s.outbox_mut().clear();

    request(&mut s, 1, Request::LeaveChannel { channel: ChannelId(0) });

    let left = ServerMessage::Response(Response::Left { channel: ChannelId(0) });
    assert_eq!(received(&s, 1), vec![left.clone()]);
    assert_eq!(received(&s, 2), vec![left]);
    assert_eq!(s.channel_count(), 0);
    assert_membership_mirrors(&s);
}

#[test]
fn master_leaving_without_auto_close_clears_master() {
    let mut s = server(());
    let alice = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Game", JoinFlags::default());
    named(&mut s, 2, "Bob");
    join(&mut s, 2, "Game", JoinFlags::default());
    s.outbox_mut().clear();

    request(&mut s, 1, Request::LeaveChannel { channel: ChannelId(0) });

    assert_eq!(
        received(&s, 2),
        vec![ServerMessage::Peer(PeerEvent {
            channel: ChannelId(0),
            peer: alice,
            update: None
        })]
    );
    let game = s.channel(ChannelId(0)).unwrap();
    assert_eq!(game.master(), None);
    assert_eq!(game.member_count(), 1);
}

#[test]
fn leaving_a_foreign_channel_is_refused() {
    let mut s = server(());
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    named(&mut s, 2, "Bob");

    request(&mut s, 2, Request::LeaveChannel { channel: ChannelId(0) });
    assert_eq!(
        last(&s, 2),
        ServerMessage::Response(Response::LeaveDenied {
            channel: ChannelId(0),
            reason: reason::NOT_MEMBER.into()
        })
    );
}

#[test]
fn listing_skips_hidden_channels_and_can_be_disabled() {
    let mut s = server(());
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Open", JoinFlags::default());
    join(
        &mut s,
        1,
        "Secret",
        JoinFlags {
            hidden: true,
            auto_close: false,
        },
    );

    request(&mut s, 1, Request::ListChannels);
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::ChannelList {
            channels: vec![ChannelListing {
                name: "Open".into(),
                member_count: 1
            }]
        })
    );

    s.set_channel_listing(false);
    request(&mut s, 1, Request::ListChannels);
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::ChannelListDenied {
            reason: reason::LISTING_DISABLED.into()
        })
    );
}

#[test]
fn disconnect_cascades_through_channels_and_frees_ids() {
    let mut s = server(());
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "A", JoinFlags::default());
    join(&mut s, 1, "B", JoinFlags::default());
    let bob = named(&mut s, 2, "Bob");
    join(&mut s, 2, "A", JoinFlags::default());
    join(&mut s, 2, "B", JoinFlags::default());
    join(&mut s, 2, "C", JoinFlags::default());
    s.outbox_mut().clear();

    s.disconnect(ConnectionId(2));

    assert!(s.client(bob).is_none());
    assert_eq!(s.channel_count(), 2, "C emptied and closed");
    assert_eq!(received(&s, 1).len(), 2, "one peer-left per shared channel");
    assert_membership_mirrors(&s);

    // The freed id is handed out again.
    assert_eq!(connect(&mut s, 3), bob);
    // A late close for a connection that is already gone is harmless.
    s.disconnect(ConnectionId(2));
}

#[test]
fn ping_sweep_drops_clients_that_never_pong() {
    let mut s = server(());
    connect(&mut s, 1);
    connect(&mut s, 2);

    s.ping_sweep();
    assert_eq!(last(&s, 1), ServerMessage::Ping);
    send(&mut s, 1, ClientMessage::Pong);

    s.ping_sweep();
    assert_eq!(s.client_count(), 1);
    assert!(s.outbox().closed(ConnectionId(2)));
    assert!(!s.outbox().closed(ConnectionId(1)));
}

#[test]
fn udp_hello_binds_address_and_is_welcomed() {
    let mut s = server(());
    let id = connect(&mut s, 1);
    hello(&mut s, 1, id);

    assert_eq!(s.client(id).unwrap().udp_address(), Some(udp(1)));
    assert_eq!(s.outbox().datagrams_to(udp(1)), vec![ServerMessage::UdpWelcome]);
}

#[test]
fn datagrams_from_another_host_or_before_handshake_are_dropped() {
    let mut s = server(());
    let id = connect(&mut s, 1);
    let frame = ClientMessage::UdpHello.to_frame();

    let stranger = SocketAddr::from(([10, 0, 0, 9], 4000));
    s.receive_datagram(stranger, encode_datagram(&frame, Some(id)))
        .unwrap();
    assert_eq!(s.client(id).unwrap().udp_address(), None);

    let early = s.accept(ConnectionId(2), tcp(2)).unwrap();
    s.receive_datagram(udp(2), encode_datagram(&frame, Some(early)))
        .unwrap();
    assert!(s.outbox().datagrams_to(udp(2)).is_empty());
    assert!(s.client(early).is_some());
}

#[test]
fn udp_hello_over_the_stream_is_a_violation() {
    let mut s = server(());
    connect(&mut s, 1);
    send(&mut s, 1, ClientMessage::UdpHello);
    assert!(s.outbox().closed(ConnectionId(1)));
}

#[test]
fn blasted_messages_go_only_to_bound_datagram_addresses() {
    let mut s = server(());
    let alice = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    let bob = named(&mut s, 2, "Bob");
    join(&mut s, 2, "Lobby", JoinFlags::default());
    named(&mut s, 3, "Carol");
    join(&mut s, 3, "Lobby", JoinFlags::default());
    hello(&mut s, 1, alice);
    hello(&mut s, 2, bob);
    s.outbox_mut().clear();

    let frame = ClientMessage::ToChannel {
        channel: ChannelId(0),
        message: BinaryMessage::new(0, 0, &b"pos"[..]),
    }
    .to_frame();
    s.receive_datagram(udp(1), encode_datagram(&frame, Some(alice)))
        .unwrap();

    let expected = ServerMessage::FromChannel {
        channel: ChannelId(0),
        sender: alice,
        message: BinaryMessage::new(0, 0, &b"pos"[..]),
    };
    assert_eq!(s.outbox().datagrams_to(udp(2)), vec![expected]);
    assert!(received(&s, 2).is_empty(), "no duplicate over the stream");
    assert!(received(&s, 3).is_empty(), "no address bound, skipped");
}

#[test]
fn requests_over_datagrams_are_ignored() {
    let mut s = server(());
    let id = connect(&mut s, 1);
    hello(&mut s, 1, id);
    s.outbox_mut().clear();

    let frame = ClientMessage::Request(Request::SetName { name: "Ghost".into() }).to_frame();
    s.receive_datagram(udp(1), encode_datagram(&frame, Some(id)))
        .unwrap();

    assert!(s.outbox().sent.is_empty());
    assert_eq!(s.client(id).unwrap().name(), None);
}

#[test]
fn peer_messages_reach_only_the_addressed_member() {
    let mut s = server(());
    let alice = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    let bob = named(&mut s, 2, "Bob");
    join(&mut s, 2, "Lobby", JoinFlags::default());
    named(&mut s, 3, "Carol");
    join(&mut s, 3, "Lobby", JoinFlags::default());
    s.outbox_mut().clear();

    let to = |peer| ClientMessage::ToPeer {
        channel: ChannelId(0),
        peer,
        message: BinaryMessage::new(1, 0, &b"psst"[..]),
    };
    send(&mut s, 1, to(bob));
    send(&mut s, 1, to(alice));
    send(&mut s, 1, to(ClientId(99)));

    assert_eq!(received(&s, 2).len(), 1);
    assert!(received(&s, 1).is_empty());
    assert!(received(&s, 3).is_empty());
    assert!(!s.outbox().closed(ConnectionId(1)));
}

#[test]
fn oversized_frames_close_the_connection() {
    let mut s = RelayServer::new(
        ServerOptions {
            max_message_bytes: 256,
            ..ServerOptions::default()
        },
        (),
        MemoryOutbox::new(),
    );
    connect(&mut s, 1);
    send(
        &mut s,
        1,
        ClientMessage::ToServer(BinaryMessage::new(0, 0, vec![0u8; 300])),
    );
    assert!(s.outbox().closed(ConnectionId(1)));
    assert_eq!(
        s.metrics()
            .protocol_violations
            .get(&[("class", "PAYLOAD_TOO_LARGE")]),
        1
    );
}

#[test]
fn application_can_message_clients_and_channels() {
    let mut s = server(());
    let alice = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    s.outbox_mut().clear();

    s.send_to_client(alice, Delivery::Reliable, BinaryMessage::new(2, 0, &b"a"[..]))
        .unwrap();
    s.send_to_channel(ChannelId(0), Delivery::Reliable, BinaryMessage::new(2, 0, &b"b"[..]))
        .unwrap();

    assert_eq!(
        received(&s, 1),
        vec![
            ServerMessage::FromServer(BinaryMessage::new(2, 0, &b"a"[..])),
            ServerMessage::FromServerChannel {
                channel: ChannelId(0),
                message: BinaryMessage::new(2, 0, &b"b"[..]),
            },
        ]
    );

    let err = s
        .send_to_client(ClientId(42), Delivery::Reliable, BinaryMessage::new(0, 0, Bytes::new()))
        .unwrap_err();
    assert!(matches!(err, RelayError::NotFound(_)));
}

#[test]
fn application_can_close_channels_and_disconnect_clients() {
    let mut s = server(());
    let alice = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());

    assert!(s.close_channel(ChannelId(0)));
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::Left { channel: ChannelId(0) })
    );
    assert_eq!(s.client(alice).unwrap().channels().count(), 0);

    assert!(s.disconnect_client(alice));
    assert!(s.outbox().closed(ConnectionId(1)));
    assert!(!s.disconnect_client(alice));
}

// --------------------
// Hooks
// --------------------

#[derive(Default)]
struct Policy {
    refuse_connect: bool,
    refuse_channel: Option<&'static str>,
    rewrite_names: bool,
    veto_channel_messages: bool,
    server_messages: Vec<(ClientId, Delivery, Bytes)>,
    disconnected: Vec<(ClientId, usize)>,
    errors: Vec<String>,
}

impl RelayServerHandlers for Policy {
    fn on_connect(&mut self, _client: &Client) -> Verdict {
        Verdict::from(!self.refuse_connect)
    }

    fn on_disconnect(&mut self, client: &Client) {
        self.disconnected
            .push((client.id(), client.channels().count()));
    }

    fn on_name_set(&mut self, _client: &Client, name: &mut String) -> Verdict {
        if self.rewrite_names {
            *name = format!("[{name}]");
        }
        Verdict::Allow
    }

    fn on_join_channel(&mut self, _client: &Client, channel: &Channel) -> Verdict {
        match self.refuse_channel {
            Some(n) if channel.name() == n => Verdict::deny_with("members only"),
            _ => Verdict::Allow,
        }
    }

    fn on_server_message(&mut self, client: &Client, delivery: Delivery, message: &BinaryMessage) {
        self.server_messages
            .push((client.id(), delivery, message.data.clone()));
    }

    fn on_channel_message(
        &mut self,
        _client: &Client,
        _channel: &Channel,
        _delivery: Delivery,
        _message: &BinaryMessage,
    ) -> Verdict {
        Verdict::from(!self.veto_channel_messages)
    }

    fn on_error(&mut self, _client: &Client, error: &RelayError) {
        self.errors.push(error.class().as_str().to_string());
    }
}

#[test]
fn refused_connect_keeps_the_connection_open() {
    let mut s = server(Policy {
        refuse_connect: true,
        ..Policy::default()
    });
    let id = connect(&mut s, 1);

    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::ConnectDenied {
            reason: reason::CONNECT_REFUSED.into()
        })
    );
    assert!(!s.outbox().closed(ConnectionId(1)));
    assert!(!s.client(id).unwrap().is_handshook());

    s.disconnect(ConnectionId(1));
    assert!(s.handlers().disconnected.is_empty(), "never handshook");
}

#[test]
fn refused_new_channel_is_never_registered() {
    let mut s = server(Policy {
        refuse_channel: Some("Vault"),
        ..Policy::default()
    });
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Vault", JoinFlags::default());

    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::JoinDenied {
            name: "Vault".into(),
            reason: "members only".into()
        })
    );
    assert_eq!(s.channel_count(), 0);

    join(&mut s, 1, "Lobby", JoinFlags::default());
    assert_eq!(s.channel_by_name("Lobby").unwrap().id(), ChannelId(0));
}

#[test]
fn rewritten_names_are_applied() {
    let mut s = server(Policy {
        rewrite_names: true,
        ..Policy::default()
    });
    let id = named(&mut s, 1, "Alice");
    assert_eq!(
        last(&s, 1),
        ServerMessage::Response(Response::NameSet { name: "[Alice]".into() })
    );
    assert_eq!(s.client(id).unwrap().name(), Some("[Alice]"));
}

#[test]
fn vetoed_channel_messages_are_dropped_silently() {
    let mut s = server(Policy {
        veto_channel_messages: true,
        ..Policy::default()
    });
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    named(&mut s, 2, "Bob");
    join(&mut s, 2, "Lobby", JoinFlags::default());
    s.outbox_mut().clear();

    send(
        &mut s,
        1,
        ClientMessage::ToChannel {
            channel: ChannelId(0),
            message: BinaryMessage::new(0, 0, &b"spam"[..]),
        },
    );
    assert!(s.outbox().sent.is_empty());
}

#[test]
fn server_messages_reach_the_hook_with_their_delivery() {
    let mut s = server(Policy::default());
    let id = connect(&mut s, 1);
    hello(&mut s, 1, id);

    send(&mut s, 1, ClientMessage::ToServer(BinaryMessage::new(0, 0, &b"tcp"[..])));
    let frame = ClientMessage::ToServer(BinaryMessage::new(0, 0, &b"udp"[..])).to_frame();
    s.receive_datagram(udp(1), encode_datagram(&frame, Some(id)))
        .unwrap();

    assert_eq!(
        s.handlers().server_messages,
        vec![
            (id, Delivery::Reliable, Bytes::from_static(b"tcp")),
            (id, Delivery::Blasted, Bytes::from_static(b"udp")),
        ]
    );
}

#[test]
fn disconnect_hook_sees_a_client_already_out_of_every_channel() {
    let mut s = server(Policy::default());
    let id = named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());

    s.disconnect(ConnectionId(1));
    assert_eq!(s.handlers().disconnected, vec![(id, 0)]);
    assert_eq!(s.channel_count(), 0);
}

#[test]
fn violations_reach_the_error_hook() {
    let mut s = server(Policy::default());
    connect(&mut s, 1);
    s.receive(ConnectionId(1), &[0xC0, 0x00]).unwrap();
    assert_eq!(s.handlers().errors, vec!["PROTOCOL_VIOLATION".to_string()]);
}

#[test]
fn disconnect_all_empties_both_registries() {
    let mut s = server(Policy::default());
    named(&mut s, 1, "Alice");
    join(&mut s, 1, "Lobby", JoinFlags::default());
    named(&mut s, 2, "Bob");
    join(&mut s, 2, "Lobby", JoinFlags::default());

    assert_eq!(s.disconnect_all(), 2);
    assert_eq!(s.client_count(), 0);
    assert_eq!(s.channel_count(), 0);
    assert_eq!(s.handlers().disconnected.len(), 2);
    assert_eq!(s.metrics().disconnects.get(&[("reason", "shutdown")]), 2);
}

#[test]
fn membership_mirrors_after_every_step_of_churn() {
    const ROOMS: [&str; 3] = ["Lobby", "lobby", "Arena"];
    const NAMES: [&str; 4] = ["Ann", "ann", "Ben", "Cy"];

    let mut s = server(());
    // One live connection per slot; a new connection number on reconnect.
    let mut slots: Vec<u64> = (1..=6).collect();
    let mut next_conn = 7;
    for &conn in &slots {
        named(&mut s, conn, NAMES[conn as usize % NAMES.len()]);
    }

    let mut state: u32 = 0x9E37_79B9;
    let mut roll = |n: u32| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state % n
    };

    for _ in 0..400 {
        let slot = roll(slots.len() as u32) as usize;
        let conn = slots[slot];
        match roll(4) {
            0 => {
                let flags = JoinFlags {
                    hidden: false,
                    auto_close: roll(2) == 0,
                };
                join(&mut s, conn, ROOMS[roll(3) as usize], flags);
            }
            1 => {
                let joined: Vec<ChannelId> = s
                    .client_by_connection(ConnectionId(conn))
                    .map(|c| c.channels().collect())
                    .unwrap_or_default();
                if let Some(&channel) = joined.get(roll(joined.len().max(1) as u32) as usize) {
                    request(&mut s, conn, Request::LeaveChannel { channel });
                }
            }
            2 => {
                let name = NAMES[roll(NAMES.len() as u32) as usize];
                request(&mut s, conn, Request::SetName { name: name.into() });
            }
            _ => {
                s.disconnect(ConnectionId(conn));
                named(&mut s, next_conn, NAMES[roll(NAMES.len() as u32) as usize]);
                slots[slot] = next_conn;
                next_conn += 1;
            }
        }

        assert_membership_mirrors(&s);
        assert_eq!(s.client_count(), slots.len());
        for channel in s.channels() {
            let mut keys: Vec<String> = channel
                .members()
                .iter()
                .filter_map(|m| s.client(*m).and_then(|c| c.name()))
                .map(str::to_lowercase)
                .collect();
            let total = keys.len();
            keys.sort();
            keys.dedup();
            assert_eq!(keys.len(), total, "duplicate member names in {}", channel.name());
        }
    }

    assert_eq!(s.disconnect_all(), slots.len());
    assert_eq!(s.channel_count(), 0);
}
