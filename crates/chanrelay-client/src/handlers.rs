use chanrelay_core::protocol::message::{BinaryMessage, ChannelListing};
use chanrelay_core::{ClientId, Delivery};

use crate::error::ClientError;
use crate::mirror::{Channel, Peer};

/// Application callbacks for a relay client. Every method defaults to a
/// no-op.
///
/// Callbacks run on the driver task while the engine is mid-update, so they
/// must not block.
#[allow(unused_variables)]
pub trait RelayClientHandlers {
    /// Handshake and datagram path are both confirmed.
    fn on_connect(&mut self, id: ClientId, welcome: &str) {}

    /// The server refused the handshake. The client closes the connection.
    fn on_connection_denied(&mut self, reason: &str) {}

    /// The connection is gone. The mirror has not been cleared yet.
    fn on_disconnect(&mut self) {}

    fn on_error(&mut self, error: &ClientError) {}

    fn on_channel_list(&mut self, channels: &[ChannelListing]) {}

    /// First name accepted by the server.
    fn on_name_set(&mut self, name: &str) {}

    fn on_name_changed(&mut self, old: &str, name: &str) {}

    fn on_name_denied(&mut self, name: &str, reason: &str) {}

    fn on_join(&mut self, channel: &Channel) {}

    fn on_join_denied(&mut self, name: &str, reason: &str) {}

    /// Called after the channel left the mirror, whether this client asked
    /// to leave or the channel was closed.
    fn on_leave(&mut self, channel: &Channel) {}

    fn on_leave_denied(&mut self, channel: &Channel, reason: &str) {}

    fn on_server_message(&mut self, delivery: Delivery, message: &BinaryMessage) {}

    fn on_server_channel_message(
        &mut self,
        channel: &Channel,
        delivery: Delivery,
        message: &BinaryMessage,
    ) {
    }

    fn on_channel_message(
        &mut self,
        channel: &Channel,
        peer: &Peer,
        delivery: Delivery,
        message: &BinaryMessage,
    ) {
    }

    fn on_peer_message(
        &mut self,
        channel: &Channel,
        peer: &Peer,
        delivery: Delivery,
        message: &BinaryMessage,
    ) {
    }

    fn on_peer_connect(&mut self, channel: &Channel, peer: &Peer) {}

    /// `peer` has already been removed from `channel`.
    fn on_peer_disconnect(&mut self, channel: &Channel, peer: &Peer) {}

    fn on_peer_change_name(&mut self, channel: &Channel, peer: &Peer, old: &str) {}
}

impl RelayClientHandlers for () {}
