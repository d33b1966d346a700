//! Relay session: uplink/downlink pumps and single-shot teardown.
//!
//! Each session owns the accepted WebSocket endpoint and the outbound TCP
//! connection, split across two pump tasks joined at a shared cancellation
//! token. Whichever event source fires first — inbound close or error,
//! outbound EOF, a failed write on either leg — flips the session state with
//! a compare-and-set and cancels the token; the parent task awaits both
//! pumps, so teardown is a synchronization point rather than a fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use vless_config::ClosePolicy;
use vless_proto::response_prefix;

use crate::state::ServerState;

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Why the session ended. The first trigger wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Clean end of stream on the outbound side.
    Finished,
    /// The inbound peer sent a close frame carrying this code.
    PeerClose(Option<u16>),
    /// A mid-session read or write fault on either leg.
    StreamFailure,
}

/// State shared between the two pumps and the parent task.
struct SessionShared {
    state: AtomicU8,
    reason: Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
}

impl SessionShared {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(STATE_OPEN),
            reason: Mutex::new(None),
            cancel,
        }
    }

    /// Flip `Open -> Closing`, record the reason and cancel both pumps.
    ///
    /// Multiple event sources can fire within the same scheduling pass; the
    /// compare-and-set guarantees only the first caller performs the
    /// transition. Returns whether this call won.
    fn trigger(&self, reason: CloseReason) -> bool {
        if self
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            *self.reason.lock() = Some(reason);
            self.cancel.cancel();
            true
        } else {
            false
        }
    }
}

/// Coalesces uplink messages gathered within one scheduling pass.
struct Batch {
    queue: Vec<Bytes>,
    bytes: usize,
    max_messages: usize,
    max_bytes: usize,
}

impl Batch {
    fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            queue: Vec::with_capacity(max_messages),
            bytes: 0,
            max_messages,
            max_bytes,
        }
    }

    fn push(&mut self, chunk: Bytes) {
        self.bytes += chunk.len();
        self.queue.push(chunk);
    }

    fn is_full(&self) -> bool {
        self.queue.len() >= self.max_messages || self.bytes >= self.max_bytes
    }

    /// Drain the batch into one write. A lone message passes through without
    /// a copy; multiple messages are concatenated in arrival order.
    fn take(&mut self) -> Option<Bytes> {
        self.bytes = 0;
        match self.queue.len() {
            0 => None,
            1 => self.queue.pop(),
            _ => {
                let total: usize = self.queue.iter().map(Bytes::len).sum();
                let mut merged = BytesMut::with_capacity(total);
                for chunk in self.queue.drain(..) {
                    merged.extend_from_slice(&chunk);
                }
                Some(merged.freeze())
            }
        }
    }
}

/// What an inbound WebSocket item means for the uplink pump.
enum Inbound {
    Data(Bytes),
    Ignore,
    Closed(CloseReason),
}

fn classify(item: Option<Result<Message, WsError>>) -> Inbound {
    match item {
        Some(Ok(Message::Binary(data))) => Inbound::Data(Bytes::from(data)),
        Some(Ok(Message::Text(text))) => Inbound::Data(Bytes::from(text.into_bytes())),
        Some(Ok(Message::Close(frame))) => {
            Inbound::Closed(CloseReason::PeerClose(frame.map(|f| u16::from(f.code))))
        }
        // Ping/pong bookkeeping happens in the protocol layer.
        Some(Ok(_)) => Inbound::Ignore,
        Some(Err(_)) => Inbound::Closed(CloseReason::StreamFailure),
        None => Inbound::Closed(CloseReason::PeerClose(None)),
    }
}

/// Uplink pump: inbound WebSocket messages to the outbound TCP write half.
async fn uplink_pump<S>(
    mut ws: SplitStream<WebSocketStream<S>>,
    mut tcp: OwnedWriteHalf,
    initial_payload: Bytes,
    shared: Arc<SessionShared>,
    max_messages: usize,
    max_bytes: usize,
) -> u64
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut forwarded = 0u64;
    let mut batch = Batch::new(max_messages, max_bytes);

    // Leading payload left over from the handshake goes out first.
    if !initial_payload.is_empty() {
        if tcp.write_all(&initial_payload).await.is_err() {
            shared.trigger(CloseReason::StreamFailure);
            return forwarded;
        }
        forwarded += initial_payload.len() as u64;
    }

    'outer: loop {
        let item = tokio::select! {
            _ = shared.cancel.cancelled() => break 'outer,
            item = ws.next() => item,
        };
        match classify(item) {
            Inbound::Data(chunk) => batch.push(chunk),
            Inbound::Ignore => continue,
            Inbound::Closed(reason) => {
                shared.trigger(reason);
                break 'outer;
            }
        }

        // Pull in whatever else is already ready in this scheduling pass,
        // up to the batch limits.
        let mut terminal = None;
        while !batch.is_full() && terminal.is_none() {
            match ws.next().now_or_never() {
                Some(item) => match classify(item) {
                    Inbound::Data(chunk) => batch.push(chunk),
                    Inbound::Ignore => {}
                    Inbound::Closed(reason) => terminal = Some(reason),
                },
                None => break,
            }
        }

        if let Some(chunk) = batch.take() {
            if tcp.write_all(&chunk).await.is_err() {
                shared.trigger(CloseReason::StreamFailure);
                break 'outer;
            }
            forwarded += chunk.len() as u64;
        }

        if let Some(reason) = terminal {
            shared.trigger(reason);
            break 'outer;
        }
    }

    // Half-close so the destination sees EOF.
    let _ = tcp.shutdown().await;
    forwarded
}

/// Downlink pump: outbound TCP reads to the inbound WebSocket sink.
///
/// The read buffer is reused across chunks; every send copies out of it
/// before the next read overwrites it, which is what makes the reuse safe
/// with a sink that holds messages until flushed. The first chunk carries
/// the two-byte response prefix.
async fn downlink_pump<S>(
    mut tcp: OwnedReadHalf,
    mut ws: SplitSink<WebSocketStream<S>, Message>,
    version: u8,
    shared: Arc<SessionShared>,
    chunk_size: usize,
    heartbeat: bool,
) -> (SplitSink<WebSocketStream<S>, Message>, u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut forwarded = 0u64;

    if heartbeat && ws.send(Message::Ping(Vec::new())).await.is_err() {
        shared.trigger(CloseReason::StreamFailure);
        return (ws, forwarded);
    }

    let mut buf = vec![0u8; chunk_size];
    let mut first = true;
    loop {
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            read = tcp.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => {
                shared.trigger(CloseReason::Finished);
                break;
            }
            Ok(n) => n,
            Err(_) => {
                shared.trigger(CloseReason::StreamFailure);
                break;
            }
        };

        let frame = if first {
            first = false;
            let prefix = response_prefix(version);
            let mut data = Vec::with_capacity(prefix.len() + n);
            data.extend_from_slice(&prefix);
            data.extend_from_slice(&buf[..n]);
            data
        } else {
            buf[..n].to_vec()
        };

        if ws.send(Message::Binary(frame)).await.is_err() {
            shared.trigger(CloseReason::StreamFailure);
            break;
        }
        forwarded += n as u64;
    }
    (ws, forwarded)
}

/// Pick the close frame sent to the inbound peer at teardown.
fn close_frame(reason: Option<CloseReason>, policy: ClosePolicy) -> CloseFrame<'static> {
    let code = match (policy, reason) {
        (ClosePolicy::Normal, _) => CloseCode::Normal,
        (_, Some(CloseReason::StreamFailure)) => CloseCode::Error,
        (_, Some(CloseReason::PeerClose(Some(code)))) => CloseCode::from(code),
        _ => CloseCode::Normal,
    };
    CloseFrame {
        code,
        reason: "".into(),
    }
}

/// Drive one relay session to completion.
///
/// `id` is the registry entry created at accept time; the session removes it
/// during teardown.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    outbound: TcpStream,
    version: u8,
    initial_payload: Bytes,
    id: u64,
    cancel: CancellationToken,
    state: Arc<ServerState>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let shared = Arc::new(SessionShared::new(cancel));
    let (ws_sink, ws_stream) = ws.split();
    let (tcp_rd, tcp_wr) = outbound.into_split();

    let uplink = tokio::spawn(uplink_pump(
        ws_stream,
        tcp_wr,
        initial_payload,
        shared.clone(),
        state.uplink_batch,
        state.chunk_size,
    ));
    let downlink = tokio::spawn(downlink_pump(
        tcp_rd,
        ws_sink,
        version,
        shared.clone(),
        state.chunk_size,
        state.heartbeat,
    ));

    // Both pumps have stopped before any endpoint is closed for good.
    let (up, down) = tokio::join!(uplink, downlink);
    let uplink_bytes = up.unwrap_or(0);
    let (ws_sink, downlink_bytes) = match down {
        Ok((sink, bytes)) => (Some(sink), bytes),
        Err(_) => (None, 0),
    };

    // External cancellation (shutdown) can get here without a trigger.
    shared.trigger(CloseReason::Finished);
    let reason = shared.reason.lock().take();

    if let Some(mut sink) = ws_sink {
        // Best-effort: the peer may already be gone.
        let frame = close_frame(reason, state.close_policy);
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }

    state.sessions.deregister(id);
    shared.state.store(STATE_CLOSED, Ordering::Release);
    debug!(
        id,
        up = uplink_bytes,
        down = downlink_bytes,
        reason = ?reason,
        "session closed"
    );
}
