//! `sari-core` — the indexing, storage, and query engine.
//!
//! This crate owns everything below the daemon's RPC boundary: workspace
//! resolution, the scanner, the worker pipeline, the three-tier storage
//! pipeline, the search engine, the scheduling coordinator, the file
//! watcher, and the two process-wide registries. The `daemon` crate is a
//! thin transport + dispatch shell over this crate; the `cli` crate never
//! links it at all (it only speaks framed JSON-RPC to a running daemon).

pub mod config;
pub mod coordinator;
pub mod ctxtoken;
pub mod error;
pub mod models;
pub mod pack;
pub mod parser;
pub mod registry;
pub mod scan;
pub mod search;
pub mod server_registry;
pub mod storage;
pub mod watch;
pub mod worker;
pub mod workspace;

pub use error::{Result, SariError};
