//! Per-connection handler: inspect, validate, dial, upgrade, relay.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dial::dial;
use crate::error::ServerError;
use crate::handshake::authenticate_handshake;
use crate::session::run_session;
use crate::state::ServerState;
use crate::util::RegistrationGuard;
use crate::ws::{INITIAL_BUFFER_SIZE, UpgradeInspect, accept_ws, inspect_upgrade, send_reject};

/// Handle one accepted TCP connection end to end.
///
/// Everything up to a successful dial happens on the raw stream; rejections
/// go out as plain HTTP and no session is ever allocated for them.
pub async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<ServerState>,
    id: u64,
    cancel: CancellationToken,
    peer: SocketAddr,
) -> Result<(), ServerError> {
    let _guard = RegistrationGuard::new(&state.sessions, id);

    let mut buf = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        match inspect_upgrade(&buf, &state.ws_path, state.ws_host.as_deref()) {
            UpgradeInspect::NeedMore => {
                if buf.len() > state.max_header_bytes {
                    warn!(peer = %peer, bytes = buf.len(), max = state.max_header_bytes, "header too large");
                    return send_reject(stream, 400).await;
                }
                continue;
            }
            UpgradeInspect::NotHttp => {
                debug!(peer = %peer, "non-http bytes on listener");
                return send_reject(stream, 400).await;
            }
            UpgradeInspect::NotUpgrade => {
                debug!(peer = %peer, "plain http request, upgrade required");
                return send_reject(stream, 426).await;
            }
            UpgradeInspect::Reject(reason) => {
                warn!(peer = %peer, reason, "upgrade rejected");
                return send_reject(stream, 400).await;
            }
            UpgradeInspect::Upgrade { negotiation } => {
                let parsed = match authenticate_handshake(negotiation.as_deref(), &state) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!(peer = %peer, error = %err, "handshake rejected");
                        return send_reject(stream, err.reject_status()).await;
                    }
                };
                debug!(peer = %peer, dest = %parsed.destination, "handshake accepted");

                let outbound = match dial(&parsed.destination, &state, &cancel).await {
                    Ok(outbound) => outbound,
                    Err(err) => {
                        debug!(peer = %peer, dest = %parsed.destination, error = %err, "dial failed");
                        return send_reject(stream, err.reject_status()).await;
                    }
                };

                let ws = accept_ws(stream, buf.freeze(), negotiation.as_deref()).await?;
                run_session(
                    ws,
                    outbound,
                    parsed.version,
                    parsed.initial_payload,
                    id,
                    cancel,
                    state.clone(),
                )
                .await;
                return Ok(());
            }
        }
    }
}
