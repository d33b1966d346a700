//! Main server loop and connection handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::handler::handle_connection;
use crate::state::ServerState;
use crate::util::create_listener;
use vless_config::Config;
use vless_core::defaults::DEFAULT_GRACEFUL_TIMEOUT_SECS;

/// Default graceful shutdown timeout.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(DEFAULT_GRACEFUL_TIMEOUT_SECS);

/// Run the server with a cancellation token for graceful shutdown.
pub async fn run_with_shutdown(
    config: Config,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let state = Arc::new(ServerState::from_config(&config)?);

    let listen: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|_| ServerError::Config("invalid listen address".into()))?;

    let listener = create_listener(listen, config.server.connection_backlog)?;
    info!(
        address = %listener.local_addr()?,
        fallback = %format!("{}:{}", state.fallback_host, state.fallback_port),
        path = %state.ws_path,
        "listening"
    );

    // Connection limiter (None = unlimited)
    let conn_limit: Option<Arc<Semaphore>> = config.server.max_connections.map(|n| {
        info!("max_connections set to {}", n);
        Arc::new(Semaphore::new(n))
    });

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }

            result = listener.accept() => {
                let (tcp, peer) = result?;

                let permit: Option<OwnedSemaphorePermit> = match &conn_limit {
                    Some(sem) => match sem.clone().try_acquire_owned() {
                        Ok(p) => Some(p),
                        Err(_) => {
                            debug!(peer = %peer, reason = "max_connections", "connection rejected");
                            drop(tcp);
                            continue;
                        }
                    },
                    None => None,
                };

                debug!(peer = %peer, "new connection");

                let state = state.clone();
                let cancel = CancellationToken::new();
                let id = state.sessions.register(cancel.clone());

                tokio::spawn(async move {
                    let _permit = permit; // hold permit until the connection closes
                    if let Err(err) = handle_connection(tcp, state, id, cancel, peer).await {
                        debug!(peer = %peer, error = %err, "connection closed with error");
                    } else {
                        debug!(peer = %peer, "connection closed");
                    }
                });
            }
        }
    }

    // Graceful drain: let active sessions finish, then cancel stragglers.
    let active = state.sessions.count();
    if active > 0 {
        info!("waiting for {} active sessions to drain", active);
        if state.sessions.wait_idle(DEFAULT_SHUTDOWN_TIMEOUT).await {
            info!("all sessions drained");
        } else {
            warn!(
                "shutdown timeout, cancelling {} remaining sessions",
                state.sessions.count()
            );
            state.sessions.cancel_all();
            state.sessions.wait_idle(Duration::from_secs(5)).await;
        }
    }

    info!("server stopped");
    Ok(())
}

/// Run the server (blocking until error, no graceful shutdown).
pub async fn run(config: Config) -> Result<(), ServerError> {
    run_with_shutdown(config, CancellationToken::new()).await
}
