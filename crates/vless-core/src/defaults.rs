//! Default configuration values.
//!
//! Centralized default constants for use across all crates.

// ============================================================================
// Relay Defaults
// ============================================================================

/// Default downlink read chunk size (32 KiB). Doubles as the uplink batch
/// byte threshold: a batch is flushed once the queued bytes reach one chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 32768;
/// Default uplink batch message count before a forced flush.
pub const DEFAULT_UPLINK_BATCH: usize = 8;
/// Default graceful shutdown drain timeout in seconds.
pub const DEFAULT_GRACEFUL_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Dial Defaults
// ============================================================================

/// Default delay before the fallback dial fires on its own (milliseconds).
pub const DEFAULT_FALLBACK_DELAY_MS: u64 = 50;
/// Concurrent direct dial attempts for literal IP destinations.
pub const DEFAULT_DIRECT_ATTEMPTS_IP: usize = 2;
/// Concurrent direct dial attempts for domain destinations.
pub const DEFAULT_DIRECT_ATTEMPTS_DOMAIN: usize = 4;

// ============================================================================
// Buffer Defaults
// ============================================================================

/// Default shared arena capacity for handshake scratch buffers.
pub const DEFAULT_ARENA_CAPACITY: usize = 32768;
/// Default recycle-pool slot count.
pub const DEFAULT_RECYCLE_POOL_SLOTS: usize = 12;

// ============================================================================
// Listener Defaults
// ============================================================================

/// Default maximum buffered HTTP header bytes before an upgrade is rejected.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8192;
/// Default TCP listener backlog.
pub const DEFAULT_CONNECTION_BACKLOG: u32 = 1024;
/// Default WebSocket upgrade path.
pub const DEFAULT_WS_PATH: &str = "/";

// ============================================================================
// Protocol Constants
// ============================================================================

/// Auth token length in bytes.
pub const TOKEN_LEN: usize = 16;
/// Minimum decoded handshake bytes (version + token + addon-length byte).
pub const MIN_HANDSHAKE_BYTES: usize = 1 + TOKEN_LEN + 1;
