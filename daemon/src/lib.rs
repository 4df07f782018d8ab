//! Sari daemon — the loopback JSON-RPC server and session layer over
//! `sari-core`. Everything below the transport is `sari-core`; this crate
//! owns connection framing, session lifecycle, tool dispatch, and the
//! process's own startup/registration sequence.

pub mod mcp;
pub mod session;
pub mod transport;
