//! Protocol modules (framing + typed messages).
//!
//! - `frame`: length-prefixed stream frames and fixed-header datagrams.
//! - `payload`: bounds-checked readers/writers for message bodies.
//! - `message`: typed client→server and server→client messages.
//! - `types`: ids, delivery mode, and the wire type/sub-code tables.
//!
//! All parsers are panic-free: malformed input is reported as `RelayError`
//! instead of panicking or indexing raw buffers.

pub mod frame;
pub mod message;
pub mod payload;
pub mod types;
