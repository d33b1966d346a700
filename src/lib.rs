//! # vless-rs
//!
//! A Rust implementation of a VLESS-style WebSocket relay.
//!
//! The server accepts WebSocket upgrades whose negotiation header smuggles a
//! compact binary handshake (auth token + destination), dials the requested
//! destination while racing a configured fallback relay, and bridges bytes
//! both ways until either side terminates.
//!
//! ## Crates
//!
//! - [`vless_core`] - Default values and the scratch-buffer allocator
//! - [`vless_proto`] - Handshake parsing and serialization
//! - [`vless_config`] - Configuration loading and validation
//! - [`vless_server`] - Server implementation

pub use vless_config as config;
pub use vless_core as core;
pub use vless_proto as proto;
pub use vless_server as server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use vless_config::{Config, load_config, validate_config};
    pub use vless_server::{CancellationToken, ServerError, run, run_with_shutdown};
}
