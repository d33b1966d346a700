//! Server state shared across connections.

use std::time::Duration;

use uuid::Uuid;
use vless_config::{ClosePolicy, Config};
use vless_core::Arena;
use vless_core::defaults::TOKEN_LEN;

use crate::error::ServerError;
use crate::util::SessionRegistry;

/// Shared server state for all connections.
pub struct ServerState {
    pub token: [u8; TOKEN_LEN],
    pub fallback_host: String,
    pub fallback_port: u16,
    pub fallback_delay: Duration,
    pub ws_path: String,
    pub ws_host: Option<String>,
    pub max_header_bytes: usize,
    pub chunk_size: usize,
    pub uplink_batch: usize,
    pub close_policy: ClosePolicy,
    pub heartbeat: bool,
    /// Scratch allocator shared by every handshake on this process.
    pub arena: Arena,
    pub sessions: SessionRegistry,
}

impl ServerState {
    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        let token = Uuid::parse_str(&config.auth.token)
            .map_err(|_| ServerError::Config("auth.token is not a valid UUID".into()))?;
        let (fallback_host, fallback_port) = split_host_port(&config.server.fallback)?;

        Ok(Self {
            token: *token.as_bytes(),
            fallback_host,
            fallback_port,
            fallback_delay: Duration::from_millis(config.server.fallback_delay_ms),
            ws_path: config.websocket.path.clone(),
            ws_host: config.websocket.host.clone(),
            max_header_bytes: config.server.max_header_bytes,
            chunk_size: config.server.chunk_size,
            uplink_batch: config.server.uplink_batch,
            close_policy: config.server.close_policy,
            heartbeat: config.server.heartbeat,
            arena: Arena::new(
                config.server.arena_capacity,
                config.server.recycle_pool_slots,
            ),
            sessions: SessionRegistry::new(),
        })
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals.
fn split_host_port(addr: &str) -> Result<(String, u16), ServerError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| ServerError::Config(format!("invalid fallback address '{addr}'")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ServerError::Config(format!("invalid fallback port in '{addr}'")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(ServerError::Config(format!(
            "invalid fallback address '{addr}'"
        )));
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
pub(crate) fn test_state() -> ServerState {
    ServerState {
        token: [
            0x55, 0xd9, 0xec, 0x38, 0x1b, 0x8a, 0x45, 0x4b, 0x98, 0x1a, 0x6a, 0xcf, 0xe8, 0xf5,
            0x6d, 0x8c,
        ],
        fallback_host: "127.0.0.1".to_string(),
        fallback_port: 1,
        fallback_delay: Duration::from_millis(50),
        ws_path: "/".to_string(),
        ws_host: None,
        max_header_bytes: 8192,
        chunk_size: 32768,
        uplink_batch: 8,
        close_policy: ClosePolicy::Propagate,
        heartbeat: false,
        arena: Arena::new(256, 2),
        sessions: SessionRegistry::new(),
    }
}
