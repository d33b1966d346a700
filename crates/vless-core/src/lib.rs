//! Core types and constants shared across vless crates.
//!
//! This crate provides:
//! - Default configuration values
//! - The scratch-buffer allocator used on the handshake hot path

pub mod buffer;
pub mod defaults;

// Re-export commonly used items at crate root
pub use buffer::{Arena, ArenaStats, BufSource, ScratchBuffer};
pub use defaults::*;

/// Project name.
pub const PROJECT_NAME: &str = "vless-rs";
/// Project version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
