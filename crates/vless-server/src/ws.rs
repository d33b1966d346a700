//! WebSocket upgrade handling.
//!
//! The handshake is validated before the upgrade is accepted, so the request
//! head is buffered and inspected by hand: the negotiation header is pulled
//! out of the raw bytes, and rejections go out as plain HTTP responses on
//! the unupgraded stream.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        handshake::server::{Request, Response},
        http::HeaderValue,
    },
};
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::util::PrefixedStream;

/// Initial buffer size for reading HTTP headers during WebSocket upgrade.
pub const INITIAL_BUFFER_SIZE: usize = 2048;

const HTTP_HEADER_END: &[u8] = b"\r\n\r\n";

/// Result of inspecting buffered bytes for a WebSocket upgrade.
pub enum UpgradeInspect {
    /// Need more data to see the full request head.
    NeedMore,
    /// Not HTTP traffic at all.
    NotHttp,
    /// HTTP, but not a WebSocket upgrade request.
    NotUpgrade,
    /// Valid upgrade request; the negotiation header value if present.
    Upgrade { negotiation: Option<String> },
    /// Reject with reason (path/host mismatch).
    Reject(&'static str),
}

/// Inspect buffered bytes for a WebSocket upgrade request.
pub fn inspect_upgrade(buf: &[u8], path: &str, host: Option<&str>) -> UpgradeInspect {
    let Some(header_end) = find_header_end(buf) else {
        return UpgradeInspect::NeedMore;
    };
    let header_str = match std::str::from_utf8(&buf[..header_end]) {
        Ok(v) => v,
        Err(_) => return UpgradeInspect::NotHttp,
    };
    let mut lines = header_str.split("\r\n");
    let request_line = match lines.next() {
        Some(v) => v,
        None => return UpgradeInspect::NotHttp,
    };
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let req_path = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        return UpgradeInspect::NotHttp;
    }
    if method != "GET" {
        return UpgradeInspect::NotUpgrade;
    }

    let mut upgrade = false;
    let mut connection_upgrade = false;
    let mut ws_key = false;
    let mut req_host: Option<&str> = None;
    let mut negotiation: Option<String> = None;

    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value_trim = value.trim();
            match name.as_str() {
                "upgrade" => {
                    if value_trim.to_ascii_lowercase().contains("websocket") {
                        upgrade = true;
                    }
                }
                "connection" => {
                    if value_trim.to_ascii_lowercase().contains("upgrade") {
                        connection_upgrade = true;
                    }
                }
                "sec-websocket-key" => {
                    if !value_trim.is_empty() {
                        ws_key = true;
                    }
                }
                "sec-websocket-protocol" => {
                    if !value_trim.is_empty() {
                        negotiation = Some(value_trim.to_string());
                    }
                }
                "host" => {
                    req_host = Some(value_trim);
                }
                _ => {}
            }
        }
    }

    if !upgrade || !connection_upgrade || !ws_key {
        return UpgradeInspect::NotUpgrade;
    }

    if !path_matches(path, req_path) || !host_matches(host, req_host) {
        return UpgradeInspect::Reject("websocket path/host mismatch");
    }

    UpgradeInspect::Upgrade { negotiation }
}

/// Accept a WebSocket upgrade on the given stream, echoing the negotiated
/// subprotocol back to the client.
pub async fn accept_ws<S>(
    stream: S,
    initial: Bytes,
    subprotocol: Option<&str>,
) -> Result<WebSocketStream<PrefixedStream<S>>, ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let echo = subprotocol.and_then(|p| HeaderValue::from_str(p).ok());
    let prefixed = PrefixedStream::new(initial, stream);
    let ws = accept_hdr_async(prefixed, move |req: &Request, mut resp: Response| {
        debug!(path = %req.uri().path(), "websocket upgrade");
        if let Some(value) = echo {
            resp.headers_mut().insert("sec-websocket-protocol", value);
        }
        Ok(resp)
    })
    .await
    .map_err(|e| {
        ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("websocket handshake failed: {e}"),
        ))
    })?;
    Ok(ws)
}

/// Send a plain HTTP rejection on the unupgraded stream.
pub async fn send_reject<S>(mut stream: S, status: u16) -> Result<(), ServerError>
where
    S: AsyncWrite + Unpin,
{
    warn!(status, "connection rejected");
    let response: &[u8] = match status {
        // Advisory headers tell plain-HTTP clients what this endpoint wants.
        426 => {
            b"HTTP/1.1 426 Upgrade Required\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nContent-Length: 0\r\n\r\n"
        }
        502 => b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n",
        400 => b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n",
        _ => b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
    };
    stream.write_all(response).await?;
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HTTP_HEADER_END.len())
        .position(|w| w == HTTP_HEADER_END)
        .map(|idx| idx + HTTP_HEADER_END.len())
}

fn path_matches(expected: &str, path: &str) -> bool {
    let path_only = path.split('?').next().unwrap_or("");
    path_only == expected
}

fn host_matches(expected: Option<&str>, host: Option<&str>) -> bool {
    let expected = match expected {
        Some(v) => v,
        None => return true,
    };
    let host = match host {
        Some(v) => v,
        None => return false,
    };
    let host_only = host.split(':').next().unwrap_or("");
    host_only.eq_ignore_ascii_case(expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upgrade_request(path: &str, extra: &str) -> Vec<u8> {
        format!(
            "GET {path} HTTP/1.1\r\nHost: relay.example.net\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n{extra}\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn partial_head_needs_more() {
        let req = upgrade_request("/", "");
        assert!(matches!(
            inspect_upgrade(&req[..20], "/", None),
            UpgradeInspect::NeedMore
        ));
    }

    #[test]
    fn extracts_negotiation_header() {
        let req = upgrade_request("/", "Sec-WebSocket-Protocol: AFvR7A\r\n");
        match inspect_upgrade(&req, "/", None) {
            UpgradeInspect::Upgrade { negotiation } => {
                assert_eq!(negotiation.as_deref(), Some("AFvR7A"));
            }
            _ => panic!("expected Upgrade"),
        }
    }

    #[test]
    fn upgrade_without_negotiation_header() {
        let req = upgrade_request("/", "");
        match inspect_upgrade(&req, "/", None) {
            UpgradeInspect::Upgrade { negotiation } => assert!(negotiation.is_none()),
            _ => panic!("expected Upgrade"),
        }
    }

    #[test]
    fn plain_get_is_not_upgrade() {
        let req = b"GET / HTTP/1.1\r\nHost: relay.example.net\r\n\r\n";
        assert!(matches!(
            inspect_upgrade(req, "/", None),
            UpgradeInspect::NotUpgrade
        ));
    }

    #[test]
    fn post_is_not_upgrade() {
        let req = b"POST /api HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(
            inspect_upgrade(req, "/", None),
            UpgradeInspect::NotUpgrade
        ));
    }

    #[test]
    fn garbage_is_not_http() {
        let mut req = vec![0x16, 0x03, 0x01, 0xff];
        req.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(
            inspect_upgrade(&req, "/", None),
            UpgradeInspect::NotHttp
        ));
    }

    #[test]
    fn path_mismatch_rejected() {
        let req = upgrade_request("/other", "");
        assert!(matches!(
            inspect_upgrade(&req, "/tunnel", None),
            UpgradeInspect::Reject(_)
        ));
    }

    #[test]
    fn query_string_ignored_for_path_match() {
        let req = upgrade_request("/tunnel?x=1", "");
        assert!(matches!(
            inspect_upgrade(&req, "/tunnel", None),
            UpgradeInspect::Upgrade { .. }
        ));
    }

    #[test]
    fn host_restriction_enforced() {
        let req = upgrade_request("/", "");
        assert!(matches!(
            inspect_upgrade(&req, "/", Some("relay.example.net")),
            UpgradeInspect::Upgrade { .. }
        ));
        assert!(matches!(
            inspect_upgrade(&req, "/", Some("elsewhere.example.net")),
            UpgradeInspect::Reject(_)
        ));
    }
}
