//! Unified vless-rs CLI.
//!
//! This binary provides a unified interface to the relay components:
//! - `vless-rs server` - Run the relay server
//!
//! The server can also be run as a standalone `vless-server` binary.

use std::process::ExitCode;

use clap::{Parser, Subcommand};

/// vless-rs unified CLI.
#[derive(Parser)]
#[command(
    name = "vless-rs",
    version,
    about = "A Rust implementation of a VLESS-style WebSocket relay",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server.
    #[command(name = "server", alias = "serve")]
    Server(Box<vless_server::ServerArgs>),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Server(args) => vless_server::cli::run(*args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
