//! HTTP proxy connect job.
//!
//! # Data Flow
//! ```text
//! existing multiplexed session to the proxy? ──yes──▶ CONNECT stream in it
//!        │ no
//!        ▼
//! transport pool (http proxy) | proxy TLS pool (https proxy)
//!        │
//!        ├─ negotiated h2 and a session pool is present ─▶ new session ─▶ CONNECT stream
//!        ├─ no tunnel wanted ─▶ proxy socket as is (absolute-form requests)
//!        └─ CONNECT over HTTP/1.1 (tunnel.rs)
//! ```
//!
//! # Design Decisions
//! - A failure to reach the proxy is reported as `ProxyConnectionFailed` so
//!   the stream request job can fall back to the next proxy
//! - A 407 with a kept-alive connection returns the proxy socket with the
//!   failure, so the tunnel can be finished on it after credentials arrive

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, USER_AGENT};

use crate::auth::AuthController;
use crate::config::HttpConfig;
use crate::connect_job::ssl::{SslConnectJobFactory, SslParams};
use crate::connect_job::transport::{TransportConnectJobFactory, TransportParams};
use crate::connect_job::tunnel::{establish_tunnel, TunnelRequest};
use crate::connect_job::{ConnectJobFailure, ConnectTiming, ConnectedSocket, FailureExtra, ProxyAuthChallenge};
use crate::error::NetError;
use crate::http::multiplexed::{MultiplexedSession, MultiplexedSessionPool, SessionKey, TunnelOutcome};
use crate::net::address::HostPortPair;
use crate::net::socket::{BoxedSocket, NextProto, StreamSocket};
use crate::pool::{
    ClientSocketHandle, ConnectJobFactory, ConnectionGroupKey, LoadState, LoadStateCell, RequestPriority,
    RequestSocketError, SocketPool,
};
use crate::proxy::server::ProxyServer;

/// How the proxy itself is reached.
#[derive(Debug, Clone)]
pub enum ProxyConnection {
    Plain(TransportParams),
    Tls(Box<SslParams>),
}

#[derive(Debug, Clone)]
pub struct HttpProxyParams {
    pub proxy: ProxyServer,
    pub connection: ProxyConnection,
    pub destination: HostPortPair,
    /// CONNECT to `destination`; otherwise the proxy socket is handed up for
    /// absolute-form requests.
    pub tunnel: bool,
    pub privacy_mode: bool,
    pub auth: Arc<AuthController>,
}

pub struct HttpProxyConnectJobFactory {
    transport_pool: Arc<SocketPool<TransportConnectJobFactory>>,
    ssl_pool: Arc<SocketPool<SslConnectJobFactory>>,
    sessions: Option<Arc<dyn MultiplexedSessionPool>>,
    http: HttpConfig,
    timeout: Duration,
}

impl HttpProxyConnectJobFactory {
    pub fn new(
        transport_pool: Arc<SocketPool<TransportConnectJobFactory>>,
        ssl_pool: Arc<SocketPool<SslConnectJobFactory>>,
        sessions: Option<Arc<dyn MultiplexedSessionPool>>,
        http: HttpConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            transport_pool,
            ssl_pool,
            sessions,
            http,
            timeout,
        }
    }

    fn session_key(params: &HttpProxyParams) -> Option<SessionKey> {
        let proxy = params.proxy.host_port()?.clone();
        Some(SessionKey::new(proxy, ProxyServer::direct(), params.privacy_mode))
    }

    async fn connect_to_proxy(
        &self,
        key: &ConnectionGroupKey,
        params: &HttpProxyParams,
        priority: RequestPriority,
    ) -> Result<ClientSocketHandle, ConnectJobFailure> {
        match &params.connection {
            ProxyConnection::Plain(transport) => self
                .transport_pool
                .request_socket(key, transport.clone(), priority)
                .await
                .map_err(|e| {
                    tracing::debug!(proxy = %params.proxy, error = %e.error, "Connect to proxy failed");
                    NetError::ProxyConnectionFailed.into()
                }),
            ProxyConnection::Tls(ssl) => self
                .ssl_pool
                .request_socket(key, (**ssl).clone(), priority)
                .await
                .map_err(|e| proxy_tls_failure(&params.proxy, e)),
        }
    }

    async fn tunnel_via_session(
        &self,
        session: Arc<dyn MultiplexedSession>,
        params: &HttpProxyParams,
        timing: ConnectTiming,
    ) -> Result<ConnectedSocket, ConnectJobFailure> {
        let mut headers = HeaderMap::new();
        if let Ok(ua) = HeaderValue::from_str(&self.http.user_agent) {
            headers.insert(USER_AGENT, ua);
        }
        if let Some((name, value)) = params.auth.auth_header()? {
            headers.insert(name, value);
        }
        match session.create_tunnel(&params.destination, &headers).await? {
            TunnelOutcome::Established(socket) => {
                tracing::debug!(session = %session.key(), destination = %params.destination, "Tunnel opened in session");
                Ok(ConnectedSocket::new(socket, timing))
            }
            TunnelOutcome::Rejected(response) if response.status == 407 => {
                params.auth.handle_auth_challenge(&response.headers);
                // The stream is gone; a retry opens a new one in the session.
                Err(ConnectJobFailure::with_extra(
                    NetError::ProxyAuthRequested,
                    FailureExtra::ProxyAuthRequired(ProxyAuthChallenge {
                        response,
                        controller: Arc::clone(&params.auth),
                        keep_alive: false,
                        tunnel: None,
                    }),
                ))
            }
            TunnelOutcome::Rejected(response) => {
                tracing::debug!(status = response.status, "Proxy session refused tunnel");
                Err(NetError::TunnelConnectionFailed.into())
            }
        }
    }
}

/// Certificate and client-auth failures of the proxy's TLS pass through
/// with their state; anything else means the proxy is unreachable.
fn proxy_tls_failure(proxy: &ProxyServer, e: RequestSocketError) -> ConnectJobFailure {
    if e.error.is_certificate_error() || e.error.is_client_auth_error() {
        return ConnectJobFailure {
            error: e.error,
            extra: e.extra,
            socket: e.handle.map(|h| Box::new(h) as BoxedSocket),
        };
    }
    tracing::debug!(proxy = %proxy, error = %e.error, "TLS to proxy failed");
    NetError::ProxyConnectionFailed.into()
}

#[async_trait]
impl ConnectJobFactory for HttpProxyConnectJobFactory {
    type Params = HttpProxyParams;

    fn connection_timeout(&self) -> Duration {
        let lower = self
            .transport_pool
            .factory()
            .connection_timeout()
            .max(self.ssl_pool.factory().connection_timeout());
        lower + self.timeout
    }

    async fn connect(
        &self,
        key: &ConnectionGroupKey,
        params: &HttpProxyParams,
        priority: RequestPriority,
        load_state: &LoadStateCell,
    ) -> Result<ConnectedSocket, ConnectJobFailure> {
        let session_key = Self::session_key(params);
        if params.tunnel {
            if let (Some(sessions), Some(skey)) = (&self.sessions, &session_key) {
                if let Some(session) = sessions.find_available_session(skey) {
                    load_state.set(LoadState::EstablishingProxyTunnel);
                    return self.tunnel_via_session(session, params, ConnectTiming::default()).await;
                }
            }
        }

        load_state.set(LoadState::Connecting);
        let mut handle = self.connect_to_proxy(key, params, priority).await?;
        let mut timing = ConnectTiming::default();
        timing.merge_lower(handle.connect_timing());

        if !params.tunnel {
            tracing::debug!(group = %key, proxy = %params.proxy, "Proxy connection ready for forwarding");
            return Ok(ConnectedSocket::new(Box::new(handle), timing));
        }

        load_state.set(LoadState::EstablishingProxyTunnel);
        if handle.negotiated_protocol() == NextProto::Http2 {
            if let (Some(sessions), Some(skey)) = (&self.sessions, session_key) {
                let session = sessions.create_session(skey, handle).await?;
                return self.tunnel_via_session(session, params, timing).await;
            }
        }

        let request = TunnelRequest {
            destination: &params.destination,
            auth: &params.auth,
            is_https_proxy: params.proxy.is_https(),
            http: &self.http,
        };
        match establish_tunnel(&mut handle, &request).await {
            Ok(()) => {
                tracing::debug!(group = %key, proxy = %params.proxy, "Tunnel established");
                Ok(ConnectedSocket::new(Box::new(handle), timing))
            }
            Err(failure) => {
                let keep = matches!(
                    &failure.extra,
                    Some(FailureExtra::ProxyAuthRequired(challenge)) if challenge.keep_alive
                );
                if keep {
                    Err(failure.with_socket(Box::new(handle)))
                } else {
                    Err(failure)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use crate::auth::{AuthCache, AuthCredentials, CredentialStore};
    use crate::config::PoolConfig;
    use crate::connect_job::ssl::SslLowerParams;
    use crate::net::pacing::ConnectPacer;
    use crate::net::resolver::{HostResolver, RuleBasedResolver};
    use crate::net::socket::ClientSocketFactory;
    use crate::net::tls::{SslConfig, TlsConnector, TlsHandshakeError};
    use crate::pool::SocketType;
    use crate::proxy::ProxyScheme;

    /// Hands out the client end of a duplex per connect and keeps the
    /// server ends for the test to script.
    #[derive(Default)]
    struct ScriptedSockets {
        servers: Mutex<Vec<DuplexStream>>,
        refuse: bool,
    }

    #[async_trait]
    impl ClientSocketFactory for ScriptedSockets {
        async fn connect(&self, _addr: SocketAddr) -> Result<BoxedSocket, NetError> {
            if self.refuse {
                return Err(NetError::ConnectionRefused);
            }
            let (client, server) = tokio::io::duplex(4096);
            self.servers.lock().unwrap().push(server);
            Ok(Box::new(client))
        }
    }

    struct NoTls;

    #[async_trait]
    impl TlsConnector for NoTls {
        async fn connect(
            &self,
            _host: &HostPortPair,
            _config: &SslConfig,
            _socket: BoxedSocket,
        ) -> Result<BoxedSocket, TlsHandshakeError> {
            Err(TlsHandshakeError::Failed(NetError::SslProtocolError))
        }
    }

    fn proxy() -> ProxyServer {
        ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy.test", 3128))
    }

    fn factory(sockets: Arc<ScriptedSockets>) -> HttpProxyConnectJobFactory {
        let mut resolver = RuleBasedResolver::new(None);
        resolver.add_rule("proxy.test", vec![IpAddr::from([10, 0, 0, 1])]);
        let resolver: Arc<dyn HostResolver> = Arc::new(resolver);
        let transport = SocketPool::new(
            "transport",
            PoolConfig::default(),
            0,
            TransportConnectJobFactory::new(
                resolver,
                sockets,
                Arc::new(ConnectPacer::default()),
                Duration::from_secs(5),
                Duration::from_millis(300),
            ),
        );
        let ssl = SocketPool::new(
            "ssl_for_proxy",
            PoolConfig::default(),
            1,
            SslConnectJobFactory::new(
                Arc::clone(&transport),
                None,
                None,
                Arc::new(NoTls),
                Duration::from_secs(10),
            ),
        );
        HttpProxyConnectJobFactory::new(transport, ssl, None, HttpConfig::default(), Duration::from_secs(5))
    }

    fn params(tunnel: bool, cache: Arc<AuthCache>) -> HttpProxyParams {
        HttpProxyParams {
            proxy: proxy(),
            connection: ProxyConnection::Plain(TransportParams::new(HostPortPair::new("proxy.test", 3128))),
            destination: HostPortPair::new("secure.test", 443),
            tunnel,
            privacy_mode: false,
            auth: Arc::new(AuthController::for_proxy(&proxy(), cache)),
        }
    }

    fn key() -> ConnectionGroupKey {
        ConnectionGroupKey::new(HostPortPair::new("secure.test", 443), SocketType::Ssl, proxy())
    }

    async fn next_server(sockets: &ScriptedSockets) -> DuplexStream {
        loop {
            if let Some(server) = sockets.servers.lock().unwrap().pop() {
                return server;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn read_head(server: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            if server.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn unreachable_proxy_reports_proxy_failure() {
        let sockets = Arc::new(ScriptedSockets {
            refuse: true,
            ..Default::default()
        });
        let factory = factory(sockets);
        let err = factory
            .connect(&key(), &params(true, Arc::new(AuthCache::new())), RequestPriority::Medium, &LoadStateCell::default())
            .await
            .unwrap_err();
        assert_eq!(err.error, NetError::ProxyConnectionFailed);
    }

    #[tokio::test]
    async fn forwarding_skips_connect() {
        let sockets = Arc::new(ScriptedSockets::default());
        let factory = factory(sockets.clone());
        let connected = factory
            .connect(&key(), &params(false, Arc::new(AuthCache::new())), RequestPriority::Medium, &LoadStateCell::default())
            .await
            .unwrap();
        assert!(connected.timing.connect_end.is_some());
        assert_eq!(sockets.servers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn auth_challenge_keeps_proxy_socket() {
        let sockets = Arc::new(ScriptedSockets::default());
        let factory = factory(sockets.clone());
        let cache = Arc::new(AuthCache::new());
        cache.add("http://proxy.test:3128", "corp", "basic", None, AuthCredentials::new("u", "p"));
        let params = params(true, cache);

        let script = {
            let sockets = sockets.clone();
            tokio::spawn(async move {
                let mut server = next_server(&sockets).await;
                read_head(&mut server).await;
                server
                    .write_all(
                        b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                          Proxy-Authenticate: Basic realm=\"corp\"\r\nContent-Length: 0\r\n\r\n",
                    )
                    .await
                    .unwrap();
                server
            })
        };

        let failure = factory
            .connect(&key(), &params, RequestPriority::Medium, &LoadStateCell::default())
            .await
            .unwrap_err();
        let _server = script.await.unwrap();
        assert_eq!(failure.error, NetError::ProxyAuthRequested);
        assert!(failure.socket.is_some());
        assert!(params.auth.have_auth());
    }

    #[tokio::test]
    async fn proxy_tls_failures_become_proxy_connection_failures() {
        let sockets = Arc::new(ScriptedSockets::default());
        let factory = factory(sockets);
        let https_proxy = ProxyServer::new(ProxyScheme::Https, HostPortPair::new("proxy.test", 443));
        let mut params = params(true, Arc::new(AuthCache::new()));
        params.proxy = https_proxy.clone();
        params.connection = ProxyConnection::Tls(Box::new(SslParams {
            lower: SslLowerParams::Direct(TransportParams::new(HostPortPair::new("proxy.test", 443))),
            host: HostPortPair::new("proxy.test", 443),
            ssl_config: SslConfig::default(),
            is_proxy: true,
        }));
        let key = ConnectionGroupKey::new(HostPortPair::new("secure.test", 443), SocketType::Ssl, https_proxy);
        let err = factory
            .connect(&key, &params, RequestPriority::Medium, &LoadStateCell::default())
            .await
            .unwrap_err();
        assert_eq!(err.error, NetError::ProxyConnectionFailed);
    }
}
