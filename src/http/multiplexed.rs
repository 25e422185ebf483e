//! Interface to a multiplexed (HTTP/2-like) session layer.
//!
//! Framing is not implemented here. The engine only needs to find an
//! existing session, turn a freshly negotiated connection into one, and open
//! streams or tunnels inside it; a session pool implementation is injected
//! into the session.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::HeaderMap;

use crate::error::NetError;
use crate::http::request::HttpRequestInfo;
use crate::http::response::HttpResponseInfo;
use crate::http::stream::HttpStream;
use crate::net::address::HostPortPair;
use crate::net::socket::BoxedSocket;
use crate::pool::ClientSocketHandle;
use crate::proxy::server::ProxyServer;

/// Identity of a session: where it goes and how it gets there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub destination: HostPortPair,
    pub proxy: ProxyServer,
    pub privacy_mode: bool,
}

impl SessionKey {
    pub fn new(destination: HostPortPair, proxy: ProxyServer, privacy_mode: bool) -> Self {
        Self {
            destination,
            proxy,
            privacy_mode,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if !self.proxy.is_direct() {
            write!(f, " via {}", self.proxy)?;
        }
        if self.privacy_mode {
            f.write_str(" (pm)")?;
        }
        Ok(())
    }
}

/// A CONNECT answered inside a session.
pub enum TunnelOutcome {
    Established(BoxedSocket),
    /// The proxy answered with something other than 2xx.
    Rejected(HttpResponseInfo),
}

/// One live multiplexed session.
#[async_trait]
pub trait MultiplexedSession: Send + Sync {
    fn key(&self) -> &SessionKey;

    /// The session can take new streams.
    fn is_available(&self) -> bool;

    async fn create_stream(&self, request: &HttpRequestInfo) -> Result<Box<dyn HttpStream>, NetError>;

    /// Open a stream carrying `CONNECT destination`.
    async fn create_tunnel(&self, destination: &HostPortPair, headers: &HeaderMap) -> Result<TunnelOutcome, NetError>;
}

/// Process-wide registry of sessions.
#[async_trait]
pub trait MultiplexedSessionPool: Send + Sync {
    fn find_available_session(&self, key: &SessionKey) -> Option<Arc<dyn MultiplexedSession>>;

    /// Start a session on a connection that negotiated a multiplexed protocol.
    async fn create_session(
        &self,
        key: SessionKey,
        connection: ClientSocketHandle,
    ) -> Result<Arc<dyn MultiplexedSession>, NetError>;

    /// Close every session, e.g. after a network change.
    fn close_all(&self, error: NetError);
}
