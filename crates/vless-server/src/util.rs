//! Utility functions for server operations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ServerError;

/// Bookkeeping for live connections, keyed by session id.
///
/// Entries are registered at accept time and removed exactly once by session
/// teardown (a second `deregister` is a no-op). The registry backs graceful
/// drain on shutdown and can cancel every remaining session.
pub struct SessionRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, CancellationToken>>,
    idle_notify: Notify,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
            idle_notify: Notify::new(),
        }
    }

    pub fn register(&self, cancel: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.lock().insert(id, cancel);
        id
    }

    /// Remove an entry; returns whether this call was the one that removed it.
    pub fn deregister(&self, id: u64) -> bool {
        let mut active = self.active.lock();
        let removed = active.remove(&id).is_some();
        if removed && active.is_empty() {
            self.idle_notify.notify_waiters();
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.active.lock().len()
    }

    /// Cancel every registered session.
    pub fn cancel_all(&self) {
        for token in self.active.lock().values() {
            token.cancel();
        }
    }

    /// Wait until the registry drains, up to `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            let notified = self.idle_notify.notified();
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = &mut deadline => return self.count() == 0,
            }
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that deregisters a connection on drop.
///
/// Normal teardown removes the entry first; this is the safety net for
/// connections that never reach a session.
pub struct RegistrationGuard<'a> {
    registry: &'a SessionRegistry,
    id: u64,
}

impl<'a> RegistrationGuard<'a> {
    pub fn new(registry: &'a SessionRegistry, id: u64) -> Self {
        Self { registry, id }
    }
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Create a TCP listener with custom backlog.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ServerError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;
    let listener = TcpListener::from_std(std::net::TcpListener::from(socket))?;
    Ok(listener)
}

/// A stream wrapper that yields a prefetched prefix before reading from the inner stream.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.pos += to_copy;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
