//! Integration tests for vless-server.
//!
//! These tests drive the complete server flow over real sockets:
//! - upgrade inspection and rejection statuses
//! - handshake validation
//! - dial racing against the fallback relay
//! - bidirectional relay with the downlink response prefix

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use vless_config::Config;
use vless_server::{CancellationToken, run_with_shutdown};

const TOKEN_UUID: &str = "55d9ec38-1b8a-454b-981a-6acfe8f56d8c";

fn token_bytes() -> [u8; 16] {
    *uuid::Uuid::parse_str(TOKEN_UUID).unwrap().as_bytes()
}

// ============================================================================
// Test Helpers
// ============================================================================

/// A TCP server that echoes back whatever it receives.
struct MockEchoServer {
    addr: SocketAddr,
}

impl MockEchoServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if sock.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        Self { addr }
    }
}

/// Pick a free port by binding and dropping an ephemeral listener.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestServer {
    /// Start a relay server with the given fallback endpoint.
    async fn start(fallback: SocketAddr) -> Self {
        let port = free_port().await;
        let config: Config = toml::from_str(&format!(
            r#"
[server]
listen = "127.0.0.1:{port}"
fallback = "{fallback}"

[auth]
token = "{TOKEN_UUID}"
"#
        ))
        .unwrap();

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = run_with_shutdown(config, server_shutdown).await;
        });

        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        // Wait for the listener to come up.
        for _ in 0..100 {
            if TcpStream::connect(addr).await.is_ok() {
                return Self { addr, shutdown };
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server did not start listening on {addr}");
    }

    /// Base64url handshake for an IPv4 destination.
    fn handshake(token: &[u8], dest: SocketAddr, payload: &[u8]) -> String {
        let SocketAddr::V4(v4) = dest else {
            panic!("ipv4 destination expected");
        };
        let mut buf = BytesMut::new();
        vless_proto::write_handshake(
            &mut buf,
            0,
            token,
            &[],
            &vless_proto::HostRef::Ipv4(v4.ip().octets()),
            dest.port(),
        )
        .unwrap();
        buf.extend_from_slice(payload);
        vless_proto::encode_negotiation(&buf)
    }

    /// Connect a WebSocket client carrying the given negotiation header.
    async fn connect(
        &self,
        negotiation: Option<&str>,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<TcpStream>,
        WsError,
    > {
        let mut request = format!("ws://{}/", self.addr).into_client_request()?;
        if let Some(value) = negotiation {
            request
                .headers_mut()
                .insert("sec-websocket-protocol", HeaderValue::from_str(value).unwrap());
        }
        let tcp = TcpStream::connect(self.addr).await?;
        let (ws, _response) = tokio_tungstenite::client_async(request, tcp).await?;
        Ok(ws)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn http_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected http rejection, got: {other:?}"),
    }
}

/// Collect echoed bytes from binary messages until `expected` bytes arrived,
/// returning the messages individually.
async fn collect_binary(
    ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>,
    expected: usize,
) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut total = 0;
    while total < expected {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for echo")
            .expect("stream ended early")
            .expect("websocket error");
        match msg {
            Message::Binary(data) => {
                total += data.len();
                messages.push(data);
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
    messages
}

// ============================================================================
// Relay Tests
// ============================================================================

#[tokio::test]
async fn echo_roundtrip_prefixes_only_first_message() {
    let echo = MockEchoServer::start().await;
    let server = TestServer::start("127.0.0.1:1".parse().unwrap()).await;

    let handshake = TestServer::handshake(&token_bytes(), echo.addr, &[]);
    let mut ws = server.connect(Some(&handshake)).await.unwrap();

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(500) {
        ws.send(Message::Binary(chunk.to_vec())).await.unwrap();
    }

    let messages = collect_binary(&mut ws, payload.len() + 2).await;

    // First message carries exactly one two-byte prefix; none of the later
    // messages repeat it.
    let mut received = Vec::new();
    for message in &messages {
        received.extend_from_slice(message);
    }
    assert_eq!(&received[..2], &[0, 0]);
    assert_eq!(&received[2..], &payload[..]);

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn initial_payload_is_forwarded_before_messages() {
    let echo = MockEchoServer::start().await;
    let server = TestServer::start("127.0.0.1:1".parse().unwrap()).await;

    let handshake = TestServer::handshake(&token_bytes(), echo.addr, b"early-");
    let mut ws = server.connect(Some(&handshake)).await.unwrap();
    ws.send(Message::Binary(b"late".to_vec())).await.unwrap();

    let messages = collect_binary(&mut ws, 2 + 6 + 4).await;
    let mut received = Vec::new();
    for message in &messages {
        received.extend_from_slice(message);
    }
    assert_eq!(&received[..2], &[0, 0]);
    assert_eq!(&received[2..], b"early-late");

    ws.close(None).await.unwrap();
}

// ============================================================================
// Rejection Tests
// ============================================================================

#[tokio::test]
async fn rejections_are_indistinguishable() {
    let echo = MockEchoServer::start().await;
    let server = TestServer::start("127.0.0.1:1".parse().unwrap()).await;

    // Missing negotiation header.
    let missing = http_status(server.connect(None).await.unwrap_err());

    // Token with the last byte flipped.
    let mut bad_token = token_bytes();
    bad_token[15] ^= 0x01;
    let bad = TestServer::handshake(&bad_token, echo.addr, &[]);
    let bad = http_status(server.connect(Some(&bad)).await.unwrap_err());

    // Shorter than the minimum header.
    let short = vless_proto::encode_negotiation(&[0u8; 17]);
    let short = http_status(server.connect(Some(&short)).await.unwrap_err());

    // Undecodable header.
    let garbage = http_status(server.connect(Some("$$$$")).await.unwrap_err());

    assert_eq!(missing, 400);
    assert_eq!(bad, missing);
    assert_eq!(short, missing);
    assert_eq!(garbage, missing);
}

#[tokio::test]
async fn plain_http_request_gets_upgrade_required() {
    let server = TestServer::start("127.0.0.1:1".parse().unwrap()).await;

    let mut tcp = TcpStream::connect(server.addr).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\nHost: relay.test\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tcp.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 426"), "got: {response}");
    assert!(response.contains("Upgrade: websocket"));
}

#[tokio::test]
async fn unreachable_dest_and_fallback_give_bad_gateway() {
    let dead_dest: SocketAddr = format!("127.0.0.1:{}", free_port().await).parse().unwrap();
    let dead_fallback: SocketAddr = format!("127.0.0.1:{}", free_port().await).parse().unwrap();
    let server = TestServer::start(dead_fallback).await;

    let handshake = TestServer::handshake(&token_bytes(), dead_dest, &[]);
    let status = http_status(server.connect(Some(&handshake)).await.unwrap_err());
    assert_eq!(status, 502);
}

// ============================================================================
// Dial Racing Tests
// ============================================================================

#[tokio::test]
async fn fallback_bounds_latency_when_direct_dial_stalls() {
    // TEST-NET-1 address: direct dials either hang (armed timer fires) or
    // fail fast (failure trigger fires). Both paths must land on the
    // fallback well before any direct-dial timeout.
    let fallback_echo = MockEchoServer::start().await;
    let server = TestServer::start(fallback_echo.addr).await;

    let blackhole: SocketAddr = "192.0.2.1:9".parse().unwrap();
    let handshake = TestServer::handshake(&token_bytes(), blackhole, &[]);

    let start = Instant::now();
    let mut ws = server.connect(Some(&handshake)).await.unwrap();
    ws.send(Message::Binary(b"probe".to_vec())).await.unwrap();
    let messages = collect_binary(&mut ws, 2 + 5).await;
    let elapsed = start.elapsed();

    let mut received = Vec::new();
    for message in &messages {
        received.extend_from_slice(message);
    }
    assert_eq!(&received[..2], &[0, 0]);
    assert_eq!(&received[2..], b"probe");
    assert!(
        elapsed < Duration::from_secs(5),
        "session took {elapsed:?}; fallback should bound tail latency"
    );

    ws.close(None).await.unwrap();
}
