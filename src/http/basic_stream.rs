//! HTTP/1.1 over one pooled connection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::HeaderMap;
use http::Method;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};

use crate::error::NetError;
use crate::http::parser::{body_framing, read_response_head, BodyDecoder};
use crate::http::request::{serialize_request_head, HttpRequestInfo};
use crate::http::response::HttpResponseInfo;
use crate::http::stream::HttpStream;
use crate::net::socket::{NextProto, StreamSocket};
use crate::net::tls::SslInfo;
use crate::pool::ClientSocketHandle;

/// Counts bytes as they are read.
struct Counting<'a, R: ?Sized> {
    inner: &'a mut R,
    count: &'a mut u64,
}

impl<R: AsyncRead + Unpin + ?Sized> AsyncRead for Counting<'_, R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut *this.inner).poll_read(cx, buf))?;
        *this.count += (buf.filled().len() - before) as u64;
        Poll::Ready(Ok(()))
    }
}

/// A non-multiplexed HTTP/1.1 stream owning its connection lease.
pub struct HttpBasicStream {
    connection: ClientSocketHandle,
    buf: BytesMut,
    /// Talking to a plain HTTP proxy, so the request line is absolute-form.
    via_proxy: bool,
    max_header_bytes: usize,
    decoder: Option<BodyDecoder>,
    keep_alive: bool,
    received_bytes: u64,
}

impl HttpBasicStream {
    pub fn new(connection: ClientSocketHandle, via_proxy: bool, max_header_bytes: usize) -> Self {
        Self {
            connection,
            buf: BytesMut::new(),
            via_proxy,
            max_header_bytes,
            decoder: None,
            keep_alive: false,
            received_bytes: 0,
        }
    }

    pub fn connection(&self) -> &ClientSocketHandle {
        &self.connection
    }

    pub fn into_connection(self) -> ClientSocketHandle {
        self.connection
    }
}

#[async_trait]
impl HttpStream for HttpBasicStream {
    async fn send_request(&mut self, request: &HttpRequestInfo, headers: &HeaderMap) -> Result<(), NetError> {
        let target = request.request_target(self.via_proxy);
        let head = serialize_request_head(&request.method, &target, headers);
        self.connection.write_all(&head).await?;
        if let Some(body) = &request.body {
            self.connection.write_all(body).await?;
        }
        self.connection.flush().await?;
        tracing::trace!(
            socket = %self.connection.id(),
            method = %request.method,
            target = %target,
            "Request sent"
        );
        Ok(())
    }

    async fn read_response_headers(&mut self, method: &Method) -> Result<HttpResponseInfo, NetError> {
        let mut reader = Counting {
            inner: &mut self.connection,
            count: &mut self.received_bytes,
        };
        let mut info = read_response_head(&mut reader, &mut self.buf, self.max_header_bytes).await?;
        self.keep_alive = info.is_keep_alive();
        self.decoder = Some(BodyDecoder::new(body_framing(&info, method)?));
        info.connection_reused = self.connection.is_reused();
        info.negotiated_protocol = NextProto::Http11;
        info.ssl_info = self.connection.ssl_info();
        info.remote_endpoint = self.connection.peer_addr();
        Ok(info)
    }

    async fn read_body(&mut self) -> Result<Option<Bytes>, NetError> {
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(None);
        };
        let mut reader = Counting {
            inner: &mut self.connection,
            count: &mut self.received_bytes,
        };
        decoder.next_chunk(&mut reader, &mut self.buf).await
    }

    fn is_response_body_complete(&self) -> bool {
        self.decoder.as_ref().is_some_and(BodyDecoder::is_done)
    }

    fn can_reuse_connection(&self) -> bool {
        self.keep_alive
            && self
                .decoder
                .as_ref()
                .is_some_and(|decoder| decoder.ended_cleanly(&self.buf))
    }

    fn is_connection_reused(&self) -> bool {
        self.connection.is_reused()
    }

    fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    fn negotiated_protocol(&self) -> NextProto {
        self.connection.negotiated_protocol()
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        self.connection.ssl_info()
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.connection.peer_addr()
    }

    fn close(self: Box<Self>) {
        if self.can_reuse_connection() {
            tracing::trace!(socket = %self.connection.id(), "Releasing connection for reuse");
            self.connection.release();
        } else {
            tracing::trace!(socket = %self.connection.id(), "Closing connection");
        }
    }

    fn renew_for_auth(self: Box<Self>) -> Option<Box<dyn HttpStream>> {
        if !self.can_reuse_connection() {
            return None;
        }
        let Self {
            mut connection,
            via_proxy,
            max_header_bytes,
            ..
        } = *self;
        connection.set_reused();
        Some(Box::new(HttpBasicStream::new(connection, via_proxy, max_header_bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use http::header::{HeaderValue, HOST};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::PoolConfig;
    use crate::connect_job::{ConnectJobFailure, ConnectedSocket, ConnectTiming};
    use crate::net::address::HostPortPair;
    use crate::pool::{
        ConnectJobFactory, ConnectionGroupKey, LoadStateCell, RequestPriority, SocketPool, SocketType,
    };
    use crate::proxy::ProxyServer;

    /// Hands out the client end of a pre-made duplex pair.
    struct OneSocket(std::sync::Mutex<Option<tokio::io::DuplexStream>>);

    #[async_trait]
    impl ConnectJobFactory for OneSocket {
        type Params = ();

        fn connection_timeout(&self) -> std::time::Duration {
            std::time::Duration::from_secs(5)
        }

        async fn connect(
            &self,
            _: &ConnectionGroupKey,
            _: &(),
            _: RequestPriority,
            _: &LoadStateCell,
        ) -> Result<ConnectedSocket, ConnectJobFailure> {
            let socket = self.0.lock().unwrap().take().ok_or(NetError::ConnectionRefused)?;
            Ok(ConnectedSocket::new(Box::new(socket), ConnectTiming::default()))
        }
    }

    async fn stream() -> (HttpBasicStream, tokio::io::DuplexStream, Arc<SocketPool<OneSocket>>) {
        let (client, server) = tokio::io::duplex(4096);
        let pool = SocketPool::new(
            "test",
            PoolConfig::default(),
            0,
            OneSocket(std::sync::Mutex::new(Some(client))),
        );
        let key = ConnectionGroupKey::new(HostPortPair::new("a.test", 80), SocketType::Plain, ProxyServer::direct());
        let handle = pool.request_socket(&key, (), RequestPriority::Medium).await.unwrap();
        (HttpBasicStream::new(handle, false, 8192), server, pool)
    }

    #[tokio::test]
    async fn exchange_then_release_for_reuse() {
        let (mut stream, mut server, pool) = stream().await;
        let request = HttpRequestInfo::get("http://a.test/x").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("a.test"));
        stream.send_request(&request, &headers).await.unwrap();

        let expected = b"GET /x HTTP/1.1\r\nhost: a.test\r\n\r\n";
        let mut head = vec![0u8; expected.len()];
        server.read_exact(&mut head).await.unwrap();
        assert_eq!(head, expected);
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();

        let info = stream.read_response_headers(&Method::GET).await.unwrap();
        assert_eq!(info.status, 200);
        assert!(!info.connection_reused);
        assert_eq!(stream.read_body().await.unwrap().as_deref(), Some(&b"ok"[..]));
        assert_eq!(stream.read_body().await.unwrap(), None);
        assert!(stream.can_reuse_connection());
        assert_eq!(stream.received_bytes(), 40);

        Box::new(stream).close();
        assert_eq!(pool.total_socket_count(), 1);
        assert_eq!(pool.idle_socket_count(), 1);
    }

    #[tokio::test]
    async fn connection_close_is_not_reused() {
        let (mut stream, mut server, pool) = stream().await;
        server
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        let info = stream.read_response_headers(&Method::GET).await.unwrap();
        assert_eq!(info.status, 401);
        assert!(stream.is_response_body_complete());
        let stream: Box<dyn HttpStream> = Box::new(stream);
        assert!(stream.renew_for_auth().is_none());
        assert_eq!(pool.total_socket_count(), 0);
    }

    #[tokio::test]
    async fn renewal_keeps_the_connection_and_marks_it_reused() {
        let (mut stream, mut server, _pool) = stream().await;
        server
            .write_all(b"HTTP/1.1 401 Unauthorized\r\nContent-Length: 3\r\n\r\nnop")
            .await
            .unwrap();
        stream.read_response_headers(&Method::GET).await.unwrap();
        assert!(stream.drain_body(1024).await.unwrap());
        let stream: Box<dyn HttpStream> = Box::new(stream);
        let renewed = stream.renew_for_auth().unwrap();
        assert!(renewed.is_connection_reused());
    }
}
