//! chanrelay client: a sans-IO engine that mirrors the channels and peers
//! this client can see, plus a tokio driver.
//!
//! `connect` returns as soon as the stream is up. Commands are accepted once
//! the handshake has been answered; `RelayClientHandlers::on_connect` fires
//! later, when the datagram path is confirmed too.

pub mod driver;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod mirror;

pub use driver::{connect, ClientHandle};
pub use engine::{ClientState, RelayClient, Transmit};
pub use error::ClientError;
pub use handlers::RelayClientHandlers;
pub use mirror::{Channel, Peer};
