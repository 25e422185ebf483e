//! Connect jobs: one state machine per connection layer.
//!
//! # Data Flow
//! ```text
//! SocketPool (spawns one task per job, enforces the job timeout)
//!     → transport.rs   resolve → connect (IPv6 first, IPv4 fallback race)
//!     → socks.rs       transport handle → SOCKS4/5 handshake
//!     → http_proxy.rs  transport/TLS handle → [CONNECT tunnel via tunnel.rs]
//!     → ssl.rs         transport/SOCKS/tunnel handle → TLS handshake
//! ```
//!
//! # Design Decisions
//! - Lower layers are obtained from their own pools, so limits apply per layer
//! - Jobs never retry; the stream request job and transaction own retry policy
//! - Failures that keep a usable socket (certificate error, proxy auth)
//!   return it in [`ConnectJobFailure::socket`] with structured extra state
//! - Each job publishes its [`LoadState`](crate::pool::LoadState) so the pool
//!   can hold the backup timer while the primary is still resolving

pub mod http_proxy;
pub mod socks;
pub mod ssl;
pub mod transport;
pub mod tunnel;

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::auth::AuthController;
use crate::error::NetError;
use crate::http::response::HttpResponseInfo;
use crate::net::socket::BoxedSocket;
use crate::net::tls::{CertRequestInfo, SslInfo};
use crate::pool::ClientSocketHandle;

pub use http_proxy::{HttpProxyConnectJobFactory, HttpProxyParams, ProxyConnection};
pub use socks::{SocksConnectJobFactory, SocksParams, SocksVersion};
pub use ssl::{SslConnectJobFactory, SslLowerParams, SslParams};
pub use transport::{TransportConnectJobFactory, TransportParams};
pub use tunnel::{establish_tunnel, TunnelRequest};

/// Timestamps of the phases of establishing a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectTiming {
    pub dns_start: Option<Instant>,
    pub dns_end: Option<Instant>,
    pub connect_start: Option<Instant>,
    pub connect_end: Option<Instant>,
    pub ssl_start: Option<Instant>,
    pub ssl_end: Option<Instant>,
}

impl ConnectTiming {
    /// Adopt the lower layer's phases, keeping any already recorded here.
    pub fn merge_lower(&mut self, lower: &ConnectTiming) {
        self.dns_start = self.dns_start.or(lower.dns_start);
        self.dns_end = self.dns_end.or(lower.dns_end);
        self.connect_start = self.connect_start.or(lower.connect_start);
        self.connect_end = self.connect_end.or(lower.connect_end);
        self.ssl_start = self.ssl_start.or(lower.ssl_start);
        self.ssl_end = self.ssl_end.or(lower.ssl_end);
    }
}

/// A connected socket as produced by a successful job.
pub struct ConnectedSocket {
    pub socket: BoxedSocket,
    pub timing: ConnectTiming,
}

impl ConnectedSocket {
    pub fn new(socket: BoxedSocket, timing: ConnectTiming) -> Self {
        Self { socket, timing }
    }
}

impl fmt::Debug for ConnectedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedSocket")
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

/// A tunnel that stopped at a 407 and can be resumed with credentials.
pub struct ProxyAuthChallenge {
    /// The proxy's 407 response.
    pub response: HttpResponseInfo,
    /// Proxy auth state, already holding the parsed challenge.
    pub controller: Arc<AuthController>,
    /// Whether the proxy kept the connection open for a retry.
    pub keep_alive: bool,
    /// The proxy-pool socket carrying the half-built tunnel. Set by the layer
    /// above the proxy pool; `None` when the failure came straight from it.
    pub tunnel: Option<ClientSocketHandle>,
}

/// Structured state attached to a failure, beyond the error code.
pub enum FailureExtra {
    /// Certificate verification failed; the handshake completed.
    CertError { ssl_info: SslInfo },
    /// The server asked for a client certificate.
    ClientAuth(CertRequestInfo),
    ProxyAuthRequired(ProxyAuthChallenge),
    /// A proxy answered CONNECT with something other than 200 or 407.
    TunnelResponse(HttpResponseInfo),
}

impl fmt::Debug for FailureExtra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureExtra::CertError { .. } => f.write_str("CertError"),
            FailureExtra::ClientAuth(info) => f.debug_tuple("ClientAuth").field(info).finish(),
            FailureExtra::ProxyAuthRequired(c) => f
                .debug_struct("ProxyAuthRequired")
                .field("keep_alive", &c.keep_alive)
                .field("has_tunnel", &c.tunnel.is_some())
                .finish(),
            FailureExtra::TunnelResponse(r) => f.debug_tuple("TunnelResponse").field(&r.status).finish(),
        }
    }
}

/// Why a connect job failed, plus anything the caller can resume from.
pub struct ConnectJobFailure {
    pub error: NetError,
    pub extra: Option<FailureExtra>,
    /// A still-connected socket handed to the caller despite the error.
    pub socket: Option<BoxedSocket>,
}

impl ConnectJobFailure {
    pub fn with_extra(error: NetError, extra: FailureExtra) -> Self {
        Self {
            error,
            extra: Some(extra),
            socket: None,
        }
    }

    pub fn with_socket(mut self, socket: BoxedSocket) -> Self {
        self.socket = Some(socket);
        self
    }
}

impl From<NetError> for ConnectJobFailure {
    fn from(error: NetError) -> Self {
        Self {
            error,
            extra: None,
            socket: None,
        }
    }
}

impl fmt::Debug for ConnectJobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectJobFailure")
            .field("error", &self.error)
            .field("extra", &self.extra)
            .field("has_socket", &self.socket.is_some())
            .finish()
    }
}
