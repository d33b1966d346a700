//! VLESS-style WebSocket relay server library.
//!
//! This module exposes the server implementation for use by integration
//! tests and potential embedding scenarios.

mod dial;
mod error;
mod handler;
mod handshake;
mod server;
mod session;
mod state;
mod util;
mod ws;

pub mod cli;

pub use cli::ServerArgs;
pub use error::ServerError;
pub use server::{DEFAULT_SHUTDOWN_TIMEOUT, run, run_with_shutdown};
pub use tokio_util::sync::CancellationToken;
