//! chanrelay core: transport-agnostic protocol primitives, error types, and
//! the ID pool shared by the relay server and client engines.
//!
//! This crate defines the wire-level contracts and error surface shared by the
//! server, the client, and test tooling. It intentionally carries no transport
//! or runtime dependencies so both engines can be driven by any event loop.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! All fallible paths must surface as `RelayError`/`Result` so a relay process
//! does not crash on malformed input or hostile traffic.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod ids;
pub mod protocol;

/// Shared result type.
pub use error::{ErrorClass, RelayError, Result};
pub use ids::IdPool;
pub use protocol::types::{ChannelId, ClientId, Delivery};
