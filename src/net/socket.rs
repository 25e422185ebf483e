//! Byte-stream sockets and the transport connect collaborator.
//!
//! # Responsibilities
//! - Define [`StreamSocket`], the object every pool hands out
//! - Provide the raw TCP connector used by transport connect jobs
//! - Probe whether an idle socket is still safe to reuse

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

use crate::error::NetError;
use crate::net::tls::SslInfo;

/// Application protocol negotiated on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum NextProto {
    #[default]
    Http11,
    Http2,
}

impl NextProto {
    /// ALPN identifier.
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            NextProto::Http11 => b"http/1.1",
            NextProto::Http2 => b"h2",
        }
    }

    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.1" => Some(NextProto::Http11),
            b"h2" => Some(NextProto::Http2),
            _ => None,
        }
    }
}

/// A connected, bidirectional byte stream.
///
/// Layers stack by wrapping: a TLS stream wraps a pool handle which wraps a
/// TCP stream. The metadata accessors let upper layers see through that
/// stack without downcasting.
pub trait StreamSocket: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn negotiated_protocol(&self) -> NextProto {
        NextProto::Http11
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        None
    }
}

/// Owned, type-erased socket.
pub type BoxedSocket = Box<dyn StreamSocket>;

impl StreamSocket for BoxedSocket {
    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }

    fn negotiated_protocol(&self) -> NextProto {
        (**self).negotiated_protocol()
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        (**self).ssl_info()
    }
}

impl StreamSocket for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

impl StreamSocket for DuplexStream {}

/// Non-blocking check that an idle socket has neither been closed by the
/// peer nor received unsolicited bytes.
///
/// Any data found is consumed, so a socket that fails the probe must be
/// discarded.
pub fn is_connected_and_idle(socket: &mut dyn StreamSocket) -> bool {
    let mut probe = [0u8; 1];
    match socket.read(&mut probe).now_or_never() {
        None => true,
        Some(Ok(_)) | Some(Err(_)) => false,
    }
}

/// Opens raw transport connections.
#[async_trait]
pub trait ClientSocketFactory: Send + Sync + 'static {
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedSocket, NetError>;
}

/// TCP connector with Nagle disabled.
#[derive(Debug, Default, Clone)]
pub struct TcpSocketFactory;

#[async_trait]
impl ClientSocketFactory for TcpSocketFactory {
    async fn connect(&self, addr: SocketAddr) -> Result<BoxedSocket, NetError> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(address = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn idle_probe_detects_peer_close_and_stray_bytes() {
        let (client, server) = tokio::io::duplex(64);
        let mut client: BoxedSocket = Box::new(client);
        assert!(is_connected_and_idle(client.as_mut()));

        drop(server);
        assert!(!is_connected_and_idle(client.as_mut()));

        let (client, mut server) = tokio::io::duplex(64);
        let mut client: BoxedSocket = Box::new(client);
        server.write_all(b"x").await.unwrap();
        assert!(!is_connected_and_idle(client.as_mut()));
    }

    #[tokio::test]
    async fn tcp_factory_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let socket = TcpSocketFactory.connect(addr).await.unwrap();
        assert_eq!(socket.peer_addr(), Some(addr));
        accept.await.unwrap();
    }

    #[test]
    fn alpn_round_trip_ids() {
        assert_eq!(NextProto::from_alpn(NextProto::Http2.alpn_id()), Some(NextProto::Http2));
        assert_eq!(NextProto::from_alpn(b"spdy/3"), None);
    }
}
