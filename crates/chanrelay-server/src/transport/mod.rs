//! Tokio driver for the relay engine.
//!
//! One engine task owns the `RelayServer` and is the only place engine state
//! is touched. Around it:
//! - an accept task feeding new TCP connections,
//! - one task per connection that reads into the engine queue and drains
//!   that connection's write queue,
//! - a datagram task feeding UDP packets.
//!
//! The engine never awaits socket writes. Stream output goes into bounded
//! per-connection queues; datagrams are sent with `try_send_to` and dropped
//! if the socket is not ready.

mod connection;
mod outbox;
mod server;

pub use outbox::ChannelOutbox;
pub use server::{start, RelayHandle};
