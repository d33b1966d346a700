//! Configuration loading and CLI definitions.

use std::collections::HashMap;
use std::{fs, path::Path};

use clap::Parser;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vless_core::defaults;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    /// Fallback relay endpoint (`host:port`) raced against direct dials.
    pub fallback: String,
    /// Delay before the fallback dial fires on its own (milliseconds).
    #[serde(default = "default_fallback_delay_ms")]
    pub fallback_delay_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    /// Maximum concurrent connections (None = unlimited)
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_connection_backlog")]
    pub connection_backlog: u32,
    /// Downlink read chunk size; also the uplink batch byte threshold.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Uplink batch message count before a forced flush.
    #[serde(default = "default_uplink_batch")]
    pub uplink_batch: usize,
    /// Shared handshake arena capacity in bytes.
    #[serde(default = "default_arena_capacity")]
    pub arena_capacity: usize,
    /// Recycle-pool slot count behind the arena.
    #[serde(default = "default_recycle_pool_slots")]
    pub recycle_pool_slots: usize,
    /// How the WebSocket close reason is chosen at teardown.
    #[serde(default)]
    pub close_policy: ClosePolicy,
    /// Send one WebSocket ping right after the upgrade is accepted.
    #[serde(default)]
    pub heartbeat: bool,
}

/// Close-reason policy applied when a session tears down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClosePolicy {
    /// Propagate the originating side's close reason to the peer.
    #[default]
    Propagate,
    /// Always close with a normal status.
    Normal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// Optional Host header restriction.
    #[serde(default)]
    pub host: Option<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
            host: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Shared secret in canonical UUID form.
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Base log level (trace/debug/info/warn/error).
    pub level: Option<String>,
    /// Output format (json, pretty, compact). Default: pretty
    pub format: Option<String>,
    /// Output target (stdout, stderr). Default: stderr
    pub output: Option<String>,
    /// Per-module log level overrides.
    #[serde(default)]
    pub filters: HashMap<String, String>,
}

#[derive(Debug, Clone, Parser, Default)]
pub struct CliOverrides {
    /// Override server listen address, e.g. 0.0.0.0:8080
    #[arg(long)]
    pub listen: Option<String>,
    /// Override fallback relay endpoint, e.g. relay.example.net:443
    #[arg(long)]
    pub fallback: Option<String>,
    /// Override fallback dial delay (milliseconds)
    #[arg(long)]
    pub fallback_delay_ms: Option<u64>,
    /// Override auth token (UUID)
    #[arg(long)]
    pub token: Option<String>,
    /// Override maximum buffered HTTP header bytes
    #[arg(long)]
    pub max_header_bytes: Option<usize>,
    /// Override maximum concurrent connections (0 = unlimited)
    #[arg(long)]
    pub max_connections: Option<usize>,
    /// Override TCP listener backlog size
    #[arg(long)]
    pub connection_backlog: Option<u32>,
    /// Override downlink chunk size (bytes)
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Override uplink batch message count
    #[arg(long)]
    pub uplink_batch: Option<usize>,
    /// Override close policy (propagate | normal)
    #[arg(long)]
    pub close_policy: Option<String>,
    /// Send a ping right after each accepted upgrade
    #[arg(long)]
    pub heartbeat: Option<bool>,
    /// Override WebSocket path
    #[arg(long)]
    pub ws_path: Option<String>,
    /// Override WebSocket host restriction
    #[arg(long)]
    pub ws_host: Option<String>,
    /// Override log level (trace/debug/info/warn/error)
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported config format")]
    UnsupportedFormat,
    #[error("validation: {0}")]
    Validation(String),
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let data = fs::read_to_string(path)?;
    match path.extension().and_then(|s| s.to_str()).unwrap_or("") {
        "json" => Ok(serde_json::from_str(&data)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(&data)?),
        "toml" => Ok(toml::from_str(&data)?),
        _ => Err(ConfigError::UnsupportedFormat),
    }
}

pub fn apply_overrides(config: &mut Config, overrides: &CliOverrides) {
    if let Some(v) = &overrides.listen {
        config.server.listen = v.clone();
    }
    if let Some(v) = &overrides.fallback {
        config.server.fallback = v.clone();
    }
    if let Some(v) = overrides.fallback_delay_ms {
        config.server.fallback_delay_ms = v;
    }
    if let Some(v) = &overrides.token {
        config.auth.token = v.clone();
    }
    if let Some(v) = overrides.max_header_bytes {
        config.server.max_header_bytes = v;
    }
    if let Some(v) = overrides.max_connections {
        config.server.max_connections = if v == 0 { None } else { Some(v) };
    }
    if let Some(v) = overrides.connection_backlog {
        config.server.connection_backlog = v;
    }
    if let Some(v) = overrides.chunk_size {
        config.server.chunk_size = v;
    }
    if let Some(v) = overrides.uplink_batch {
        config.server.uplink_batch = v;
    }
    if let Some(v) = &overrides.close_policy {
        config.server.close_policy = if v.eq_ignore_ascii_case("normal") {
            ClosePolicy::Normal
        } else {
            ClosePolicy::Propagate
        };
    }
    if let Some(v) = overrides.heartbeat {
        config.server.heartbeat = v;
    }
    if let Some(v) = &overrides.ws_path {
        config.websocket.path = v.clone();
    }
    if let Some(v) = &overrides.ws_host {
        config.websocket.host = Some(v.clone());
    }
    if let Some(v) = &overrides.log_level {
        config.logging.level = Some(v.clone());
    }
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.listen.trim().is_empty() {
        return Err(ConfigError::Validation("server.listen is empty".into()));
    }
    if config.server.fallback.trim().is_empty() {
        return Err(ConfigError::Validation("server.fallback is empty".into()));
    }
    if !config.server.fallback.contains(':') {
        return Err(ConfigError::Validation(
            "server.fallback must be host:port".into(),
        ));
    }
    if Uuid::parse_str(&config.auth.token).is_err() {
        return Err(ConfigError::Validation(
            "auth.token is not a valid UUID".into(),
        ));
    }
    if config.server.fallback_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "server.fallback_delay_ms must be > 0".into(),
        ));
    }
    if config.server.max_header_bytes < 512 {
        return Err(ConfigError::Validation(
            "server.max_header_bytes too small (min 512)".into(),
        ));
    }
    if config.server.chunk_size < 1024 || config.server.chunk_size > 1024 * 1024 {
        return Err(ConfigError::Validation(
            "server.chunk_size must be 1024..=1MB".into(),
        ));
    }
    if config.server.uplink_batch == 0 {
        return Err(ConfigError::Validation(
            "server.uplink_batch must be > 0".into(),
        ));
    }
    if config.server.arena_capacity < defaults::MIN_HANDSHAKE_BYTES {
        return Err(ConfigError::Validation(
            "server.arena_capacity cannot hold a handshake".into(),
        ));
    }
    if config.server.connection_backlog == 0 {
        return Err(ConfigError::Validation(
            "server.connection_backlog must be > 0".into(),
        ));
    }
    if !config.websocket.path.starts_with('/') {
        return Err(ConfigError::Validation(
            "websocket.path must start with '/'".into(),
        ));
    }
    Ok(())
}

// ============================================================================
// Default Value Functions (for serde)
// ============================================================================

/// Generate default value functions that forward to vless_core::defaults constants.
macro_rules! default_fns {
    ($($fn_name:ident => $const_name:ident : $ty:ty),* $(,)?) => {
        $(
            fn $fn_name() -> $ty {
                defaults::$const_name
            }
        )*
    };
}

default_fns! {
    default_fallback_delay_ms   => DEFAULT_FALLBACK_DELAY_MS: u64,
    default_max_header_bytes    => DEFAULT_MAX_HEADER_BYTES: usize,
    default_connection_backlog  => DEFAULT_CONNECTION_BACKLOG: u32,
    default_chunk_size          => DEFAULT_CHUNK_SIZE: usize,
    default_uplink_batch        => DEFAULT_UPLINK_BATCH: usize,
    default_arena_capacity      => DEFAULT_ARENA_CAPACITY: usize,
    default_recycle_pool_slots  => DEFAULT_RECYCLE_POOL_SLOTS: usize,
}

fn default_ws_path() -> String {
    defaults::DEFAULT_WS_PATH.to_string()
}
