//! SSL connect job: a lower-layer socket (direct, SOCKS or HTTP proxy
//! tunnel), then the TLS handshake.
//!
//! # Design Decisions
//! - A certificate error keeps the handshaken socket in the failure unless
//!   the caller already allowed that certificate, in which case it succeeds
//! - A client certificate request never keeps the socket
//! - A proxy auth challenge from the tunnel layer carries the proxy-pool
//!   handle up in [`ProxyAuthChallenge::tunnel`](crate::connect_job::ProxyAuthChallenge)
//!   because a non-TLS socket cannot stand in for this layer's socket

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::connect_job::http_proxy::{HttpProxyConnectJobFactory, HttpProxyParams};
use crate::connect_job::socks::{SocksConnectJobFactory, SocksParams};
use crate::connect_job::transport::{TransportConnectJobFactory, TransportParams};
use crate::connect_job::{ConnectJobFailure, ConnectTiming, ConnectedSocket, FailureExtra};
use crate::error::NetError;
use crate::net::address::HostPortPair;
use crate::net::socket::BoxedSocket;
use crate::net::tls::{SslConfig, TlsConnector, TlsHandshakeError};
use crate::pool::{
    ClientSocketHandle, ConnectJobFactory, ConnectionGroupKey, LoadState, LoadStateCell, RequestPriority,
    RequestSocketError, SocketPool,
};

/// The layer the handshake runs on.
#[derive(Debug, Clone)]
pub enum SslLowerParams {
    Direct(TransportParams),
    Socks(SocksParams),
    HttpProxy(HttpProxyParams),
}

#[derive(Debug, Clone)]
pub struct SslParams {
    pub lower: SslLowerParams,
    /// Name the certificate must match.
    pub host: HostPortPair,
    /// Snapshot taken when the request was issued.
    pub ssl_config: SslConfig,
    /// The handshake is with a proxy rather than the origin.
    pub is_proxy: bool,
}

pub struct SslConnectJobFactory {
    transport_pool: Arc<SocketPool<TransportConnectJobFactory>>,
    socks_pool: Option<Arc<SocketPool<SocksConnectJobFactory>>>,
    http_proxy_pool: Option<Arc<SocketPool<HttpProxyConnectJobFactory>>>,
    tls: Arc<dyn TlsConnector>,
    handshake_timeout: Duration,
}

impl SslConnectJobFactory {
    pub fn new(
        transport_pool: Arc<SocketPool<TransportConnectJobFactory>>,
        socks_pool: Option<Arc<SocketPool<SocksConnectJobFactory>>>,
        http_proxy_pool: Option<Arc<SocketPool<HttpProxyConnectJobFactory>>>,
        tls: Arc<dyn TlsConnector>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            transport_pool,
            socks_pool,
            http_proxy_pool,
            tls,
            handshake_timeout,
        }
    }

    async fn connect_lower(
        &self,
        key: &ConnectionGroupKey,
        params: &SslParams,
        priority: RequestPriority,
    ) -> Result<ClientSocketHandle, ConnectJobFailure> {
        match &params.lower {
            SslLowerParams::Direct(transport) => self
                .transport_pool
                .request_socket(key, transport.clone(), priority)
                .await
                .map_err(lower_failure),
            SslLowerParams::Socks(socks) => {
                let pool = self
                    .socks_pool
                    .as_ref()
                    .ok_or_else(|| NetError::UnsupportedScheme("socks".into()))?;
                pool.request_socket(key, socks.clone(), priority)
                    .await
                    .map_err(lower_failure)
            }
            SslLowerParams::HttpProxy(proxy) => {
                let pool = self
                    .http_proxy_pool
                    .as_ref()
                    .ok_or_else(|| NetError::UnsupportedScheme("http proxy".into()))?;
                pool.request_socket(key, proxy.clone(), priority)
                    .await
                    .map_err(lower_failure)
            }
        }
    }
}

/// Pass a lower pool's failure up, re-homing any socket it kept.
fn lower_failure(e: RequestSocketError) -> ConnectJobFailure {
    match e.extra {
        Some(FailureExtra::ProxyAuthRequired(mut challenge)) => {
            challenge.tunnel = e.handle;
            ConnectJobFailure::with_extra(e.error, FailureExtra::ProxyAuthRequired(challenge))
        }
        extra => ConnectJobFailure {
            error: e.error,
            extra,
            socket: e.handle.map(|h| Box::new(h) as BoxedSocket),
        },
    }
}

#[async_trait]
impl ConnectJobFactory for SslConnectJobFactory {
    type Params = SslParams;

    fn connection_timeout(&self) -> Duration {
        let mut lower = self.transport_pool.factory().connection_timeout();
        if let Some(socks) = &self.socks_pool {
            lower = lower.max(socks.factory().connection_timeout());
        }
        if let Some(proxy) = &self.http_proxy_pool {
            lower = lower.max(proxy.factory().connection_timeout());
        }
        lower + self.handshake_timeout
    }

    async fn connect(
        &self,
        key: &ConnectionGroupKey,
        params: &SslParams,
        priority: RequestPriority,
        load_state: &LoadStateCell,
    ) -> Result<ConnectedSocket, ConnectJobFailure> {
        load_state.set(LoadState::Connecting);
        let handle = self.connect_lower(key, params, priority).await?;
        let mut timing = ConnectTiming::default();
        timing.merge_lower(handle.connect_timing());

        load_state.set(LoadState::SslHandshake);
        timing.ssl_start = Some(Instant::now());
        let result = self
            .tls
            .connect(&params.host, &params.ssl_config, Box::new(handle))
            .await;
        timing.ssl_end = Some(Instant::now());

        match result {
            Ok(socket) => {
                tracing::debug!(
                    group = %key,
                    host = %params.host,
                    version_max = %params.ssl_config.version_max,
                    "TLS handshake complete"
                );
                Ok(ConnectedSocket::new(socket, timing))
            }
            Err(TlsHandshakeError::Failed(error)) => {
                tracing::debug!(group = %key, host = %params.host, error = %error, "TLS handshake failed");
                Err(error.into())
            }
            Err(TlsHandshakeError::CertificateError { error, ssl_info, socket }) => {
                let allowed = ssl_info
                    .end_entity()
                    .is_some_and(|der| params.ssl_config.is_allowed_bad_cert(der));
                if allowed {
                    tracing::debug!(group = %key, error = %error, "Accepting previously allowed certificate");
                    return Ok(ConnectedSocket::new(socket, timing));
                }
                tracing::debug!(group = %key, host = %params.host, error = %error, "Certificate error");
                Err(ConnectJobFailure::with_extra(error, FailureExtra::CertError { ssl_info }).with_socket(socket))
            }
            Err(TlsHandshakeError::ClientAuthRequested(mut info)) => {
                info.is_proxy = params.is_proxy;
                tracing::debug!(group = %key, host = %params.host, "Client certificate requested");
                Err(ConnectJobFailure::with_extra(
                    NetError::SslClientAuthCertNeeded,
                    FailureExtra::ClientAuth(info),
                ))
            }
        }
    }
}
