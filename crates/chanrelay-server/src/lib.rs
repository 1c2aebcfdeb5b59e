//! chanrelay server: the relay engine, its tokio driver, and the ops surface.
//!
//! The engine (`engine::RelayServer`) is sans-IO and can be pumped by hand,
//! which is how its unit tests run. `transport::start` puts it on real
//! sockets; the `relay-server` binary adds config loading, logging and the
//! ops HTTP endpoints.

pub mod app_state;
pub mod config;
pub mod engine;
pub mod obs;
pub mod ops;
pub mod transport;
