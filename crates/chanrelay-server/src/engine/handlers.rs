//! Authorization and notification hooks implemented by the embedding
//! application.
//!
//! Hooks run synchronously on the engine's thread and must decide
//! immediately. Every method has a permissive default, so an application only
//! overrides what it cares about; `()` is the "allow everything" handler.

use chanrelay_core::protocol::message::BinaryMessage;
use chanrelay_core::{Delivery, RelayError};

use super::channel::Channel;
use super::client::Client;

/// Outcome of an authorization hook.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Verdict {
    #[default]
    Allow,
    /// Refuse; `None` sends the default reason for the request.
    Deny(Option<String>),
}

impl Verdict {
    pub fn deny() -> Self {
        Verdict::Deny(None)
    }

    pub fn deny_with(reason: impl Into<String>) -> Self {
        Verdict::Deny(Some(reason.into()))
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// Deny reason to put on the wire, if this is a denial.
    pub(crate) fn denial(self, default_reason: &str) -> Option<String> {
        match self {
            Verdict::Allow => None,
            Verdict::Deny(reason) => Some(reason.unwrap_or_else(|| default_reason.to_string())),
        }
    }
}

impl From<bool> for Verdict {
    fn from(allow: bool) -> Self {
        if allow {
            Verdict::Allow
        } else {
            Verdict::Deny(None)
        }
    }
}

#[allow(unused_variables)]
pub trait RelayServerHandlers {
    /// A client asked to connect with a matching protocol revision.
    fn on_connect(&mut self, client: &Client) -> Verdict {
        Verdict::Allow
    }

    /// A handshook client is gone. Registries are already consistent: it is
    /// out of every channel and its id has been released.
    fn on_disconnect(&mut self, client: &Client) {}

    /// The client asked for `name`. Rewriting `name` changes what is applied;
    /// a rewritten name is validated and collision-checked again.
    fn on_name_set(&mut self, client: &Client, name: &mut String) -> Verdict {
        Verdict::Allow
    }

    /// Called before the client is added. For a new channel, `channel` is not
    /// registered yet and is discarded on denial.
    fn on_join_channel(&mut self, client: &Client, channel: &Channel) -> Verdict {
        Verdict::Allow
    }

    fn on_leave_channel(&mut self, client: &Client, channel: &Channel) -> Verdict {
        Verdict::Allow
    }

    /// Observational; messages to the server are never relayed.
    fn on_server_message(&mut self, client: &Client, delivery: Delivery, message: &BinaryMessage) {}

    fn on_channel_message(
        &mut self,
        client: &Client,
        channel: &Channel,
        delivery: Delivery,
        message: &BinaryMessage,
    ) -> Verdict {
        Verdict::Allow
    }

    fn on_peer_message(
        &mut self,
        client: &Client,
        channel: &Channel,
        peer: &Client,
        delivery: Delivery,
        message: &BinaryMessage,
    ) -> Verdict {
        Verdict::Allow
    }

    /// A protocol violation is about to close `client`'s connection.
    fn on_error(&mut self, client: &Client, error: &RelayError) {}
}

impl RelayServerHandlers for () {}
