//! chanrelay: a pub/sub relay where clients adopt a name, join named
//! channels, and exchange binary messages with the server, a channel, or one
//! peer, reliably over TCP or blasted over UDP.
//!
//! This crate re-exports the workspace:
//! - `chanrelay_core`: wire codec, message types, errors, id pool
//! - `chanrelay_server`: relay engine, tokio driver, config, ops endpoints
//! - `chanrelay_client`: client engine and tokio driver

pub use chanrelay_client;
pub use chanrelay_core;
pub use chanrelay_server;

pub use chanrelay_core::{ChannelId, ClientId, Delivery, RelayError, Result};
