//! The caller's lease on a pooled socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::connect_job::ConnectTiming;
use crate::net::connection::SocketId;
use crate::net::socket::{BoxedSocket, NextProto, StreamSocket};
use crate::net::tls::SslInfo;
use crate::pool::group_key::ConnectionGroupKey;

/// How the socket behind a handle came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReuseType {
    /// Freshly connected for this request.
    Unused,
    /// Connected earlier (e.g. preconnect) but never carried a request.
    UnusedIdle,
    /// Carried at least one earlier request.
    ReusedIdle,
}

/// Receives sockets back from handles.
pub(crate) trait SocketReleaser: Send + Sync + 'static {
    /// Return a socket. `reusable` sockets may go idle; others are closed.
    fn release_socket(
        &self,
        key: &ConnectionGroupKey,
        id: SocketId,
        socket: BoxedSocket,
        reusable: bool,
        generation: u64,
    );
}

/// Exclusive, non-shareable lease on a pooled socket.
///
/// Dropping the handle closes the socket and frees its pool slot; call
/// [`release`](Self::release) to offer it back for reuse instead. The handle
/// is itself a [`StreamSocket`], which is how layered pools stack.
pub struct ClientSocketHandle {
    socket: Option<BoxedSocket>,
    key: ConnectionGroupKey,
    id: SocketId,
    reuse_type: ReuseType,
    idle_time: Duration,
    generation: u64,
    timing: ConnectTiming,
    releaser: Arc<dyn SocketReleaser>,
}

impl ClientSocketHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket: BoxedSocket,
        key: ConnectionGroupKey,
        id: SocketId,
        reuse_type: ReuseType,
        idle_time: Duration,
        generation: u64,
        timing: ConnectTiming,
        releaser: Arc<dyn SocketReleaser>,
    ) -> Self {
        Self {
            socket: Some(socket),
            key,
            id,
            reuse_type,
            idle_time,
            generation,
            timing,
            releaser,
        }
    }

    pub fn key(&self) -> &ConnectionGroupKey {
        &self.key
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn reuse_type(&self) -> ReuseType {
        self.reuse_type
    }

    /// The socket carried an earlier request.
    pub fn is_reused(&self) -> bool {
        self.reuse_type == ReuseType::ReusedIdle
    }

    /// The socket was taken from the idle list rather than freshly connected.
    pub fn is_connection_reused(&self) -> bool {
        self.reuse_type != ReuseType::Unused
    }

    /// Mark the connection as having carried a request, e.g. before sending a
    /// second request on it after an auth restart.
    pub fn set_reused(&mut self) {
        self.reuse_type = ReuseType::ReusedIdle;
    }

    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    pub fn connect_timing(&self) -> &ConnectTiming {
        &self.timing
    }

    pub fn socket_mut(&mut self) -> Option<&mut BoxedSocket> {
        self.socket.as_mut()
    }

    /// Offer the socket back to its pool for reuse.
    pub fn release(mut self) {
        self.give_back(true);
    }

    fn give_back(&mut self, reusable: bool) {
        if let Some(socket) = self.socket.take() {
            self.releaser
                .release_socket(&self.key, self.id, socket, reusable, self.generation);
        }
    }

    fn socket_pin(&mut self) -> io::Result<Pin<&mut BoxedSocket>> {
        match self.socket.as_mut() {
            Some(socket) => Ok(Pin::new(socket)),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl Drop for ClientSocketHandle {
    fn drop(&mut self) {
        self.give_back(false);
    }
}

impl fmt::Debug for ClientSocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSocketHandle")
            .field("key", &self.key.to_string())
            .field("id", &self.id)
            .field("reuse_type", &self.reuse_type)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for ClientSocketHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().socket_pin() {
            Ok(socket) => socket.poll_read(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl AsyncWrite for ClientSocketHandle {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut().socket_pin() {
            Ok(socket) => socket.poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().socket_pin() {
            Ok(socket) => socket.poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().socket_pin() {
            Ok(socket) => socket.poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

impl StreamSocket for ClientSocketHandle {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr())
    }

    fn negotiated_protocol(&self) -> NextProto {
        self.socket
            .as_ref()
            .map(|s| s.negotiated_protocol())
            .unwrap_or_default()
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        self.socket.as_ref().and_then(|s| s.ssl_info())
    }
}
