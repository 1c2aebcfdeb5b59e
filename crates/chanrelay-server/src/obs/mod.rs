//! In-process metrics rendered by the ops `/metrics` handler.
//!
//! Values are stored as atomics behind `DashMap` label keys, so the engine
//! task and the ops HTTP task can share one registry without locking.

pub mod metrics;

pub use metrics::RelayMetrics;
