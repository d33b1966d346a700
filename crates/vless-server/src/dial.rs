//! Outbound dialing with a direct-vs-fallback race.
//!
//! A handful of direct attempts start immediately; the fallback relay dial is
//! armed behind a trigger that fires on the first direct failure or after a
//! short delay, whichever comes first. The first established connection wins
//! and the rest are abandoned to fail on their own. Only when every raced
//! attempt has failed is one last fallback dial made.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use vless_core::defaults::{DEFAULT_DIRECT_ATTEMPTS_DOMAIN, DEFAULT_DIRECT_ATTEMPTS_IP};
use vless_proto::{AddrKind, Destination};

use crate::error::ServerError;
use crate::state::ServerState;

/// Open an outbound connection to `dest`, racing direct dials against the
/// configured fallback relay.
pub async fn dial(
    dest: &Destination,
    state: &ServerState,
    cancel: &CancellationToken,
) -> Result<TcpStream, ServerError> {
    // Domains get extra attempts to cover multiple resolution paths.
    let attempts = match dest.kind {
        AddrKind::Domain => DEFAULT_DIRECT_ATTEMPTS_DOMAIN,
        _ => DEFAULT_DIRECT_ATTEMPTS_IP,
    };

    let (tx, mut rx) = mpsc::channel::<std::io::Result<TcpStream>>(attempts + 1);
    let fallback_trigger = Arc::new(Notify::new());

    for i in 0..attempts {
        let tx = tx.clone();
        let trigger = fallback_trigger.clone();
        let host = dest.host.clone();
        let port = dest.port;
        tokio::spawn(async move {
            let result = TcpStream::connect((host.as_str(), port)).await;
            if result.is_err() {
                trace!(attempt = i, "direct dial failed, arming fallback");
                trigger.notify_one();
            }
            let _ = tx.send(result).await;
        });
    }

    {
        let tx = tx.clone();
        let host = state.fallback_host.clone();
        let port = state.fallback_port;
        let delay = state.fallback_delay;
        tokio::spawn(async move {
            // Armed by the first direct failure, or by the delay on its own
            // to bound tail latency when direct dials hang.
            tokio::select! {
                _ = fallback_trigger.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            let result = TcpStream::connect((host.as_str(), port)).await;
            let _ = tx.send(result).await;
        });
    }
    drop(tx);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // Losers keep running detached and fail silently once the
                // receiver is gone.
                return Err(ServerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "dial cancelled",
                )));
            }
            received = rx.recv() => match received {
                Some(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Some(Err(err)) => trace!(error = %err, "dial attempt failed"),
                None => break,
            }
        }
    }

    // Everything lost the race; one final fallback dial before giving up.
    debug!(dest = %dest, "all raced dials failed, final fallback attempt");
    match TcpStream::connect((state.fallback_host.as_str(), state.fallback_port)).await {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Err(_) => Err(ServerError::UpstreamUnreachable),
    }
}
