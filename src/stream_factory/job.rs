//! Stream request job: one strategy for turning a request into a stream.
//!
//! # Responsibilities
//! - Resolve the proxy list and walk it on proxy connection errors
//! - Pick the pool for the route and request a socket from it
//! - Pause on anything the caller must decide (certificate, client
//!   certificate, proxy credentials) and resume from the kept state
//! - Hand back an `HttpStream`, over a pooled socket or inside a session
//!
//! # Data Flow
//! ```text
//! Start → ResolveProxy → [WaitForJob] → InitConnection ──────────▶ CreateStream → Done
//!              │                             │    ▲  proxy fallback
//!              │                             │    └──────────┘
//!              │                             ▼
//!              │                      WaitingUserAction ── restart_tunnel_with_proxy_auth ─▶ RestartTunnelAuth
//!              │                             │         ── restart_with_certificate ──▶ InitConnection
//!              │                             │         ── resume_ignoring_cert_error ─▶ CreateStream
//!              ▼
//!   alternate job: releases the main job's WaitForJob with a head start
//! ```
//!
//! # Design Decisions
//! - The state lives in the job, not in the future, so a paused job can be
//!   resumed by a later call and a losing job can be finished in the
//!   background
//! - Blocking between racing jobs is a `watch` channel: the alternate job
//!   publishes a delay, and dropping the sender releases the main job

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::auth::{AuthController, CredentialStore};
use crate::connect_job::{establish_tunnel, ConnectTiming, FailureExtra, ProxyAuthChallenge, TunnelRequest};
use crate::error::NetError;
use crate::http::basic_stream::HttpBasicStream;
use crate::http::multiplexed::SessionKey;
use crate::http::request::HttpRequestInfo;
use crate::http::response::HttpResponseInfo;
use crate::http::stream::HttpStream;
use crate::net::address::HostPortPair;
use crate::net::socket::{NextProto, StreamSocket};
use crate::net::tls::{CertRequestInfo, ClientCertificate, SslConfig, SslInfo};
use crate::pool::{ClientSocketHandle, ConnectionGroupKey, LoadState, LoadStateCell, RequestPriority, RequestSocketError};
use crate::proxy::server::{ProxyInfo, ProxyServer};
use crate::session::{HttpNetworkSession, SocketParams};
use crate::stream_factory::alternate::AlternativeService;
use crate::stream_factory::params::{socket_request, Route};

/// Which strategy a job follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    Main,
    /// Connect to an advertised alternative endpoint instead of the origin.
    Alternate(AlternativeService),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    ResolveProxy,
    WaitForJob,
    InitConnection,
    WaitingUserAction,
    RestartTunnelAuth,
    CreateStream,
    Done,
}

/// A request-ready stream and how it was obtained.
pub struct StreamReady {
    pub stream: Box<dyn HttpStream>,
    pub proxy_info: ProxyInfo,
    /// TLS parameters the connection was made with.
    pub server_ssl_config: SslConfig,
    pub connect_timing: ConnectTiming,
    /// Set when an alternative service produced the stream.
    pub alternate: Option<AlternativeService>,
    pub proxy_resolve_start: Option<Instant>,
    pub proxy_resolve_end: Option<Instant>,
}

impl std::fmt::Debug for StreamReady {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReady")
            .field("proxy", self.proxy_info.proxy_server())
            .field("protocol", &self.stream.negotiated_protocol())
            .field("alternate", &self.alternate)
            .finish_non_exhaustive()
    }
}

/// Why no stream was produced. Everything but `Failed` is a pause the
/// job can be resumed from.
pub enum StreamRequestError {
    Failed(NetError),
    /// The server certificate did not verify; the connection is kept.
    CertificateError { error: NetError, ssl_info: SslInfo },
    /// The server (or proxy) asked for a client certificate.
    ClientAuthRequested(CertRequestInfo),
    /// The proxy wants credentials before it builds the tunnel.
    ProxyAuthRequested {
        response: HttpResponseInfo,
        controller: Arc<AuthController>,
    },
    /// An HTTPS proxy answered CONNECT with a response for the caller.
    HttpsProxyTunnelResponse(HttpResponseInfo),
}

impl StreamRequestError {
    pub fn net_error(&self) -> NetError {
        match self {
            StreamRequestError::Failed(e) => e.clone(),
            StreamRequestError::CertificateError { error, .. } => error.clone(),
            StreamRequestError::ClientAuthRequested(_) => NetError::SslClientAuthCertNeeded,
            StreamRequestError::ProxyAuthRequested { .. } => NetError::ProxyAuthRequested,
            StreamRequestError::HttpsProxyTunnelResponse(_) => NetError::HttpsProxyTunnelResponse,
        }
    }

    pub fn is_pause(&self) -> bool {
        !matches!(self, StreamRequestError::Failed(_))
    }
}

impl std::fmt::Debug for StreamRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamRequestError::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            StreamRequestError::CertificateError { error, .. } => {
                f.debug_struct("CertificateError").field("error", error).finish()
            }
            StreamRequestError::ClientAuthRequested(info) => f.debug_tuple("ClientAuthRequested").field(info).finish(),
            StreamRequestError::ProxyAuthRequested { response, .. } => f
                .debug_struct("ProxyAuthRequested")
                .field("status", &response.status)
                .finish(),
            StreamRequestError::HttpsProxyTunnelResponse(response) => f
                .debug_tuple("HttpsProxyTunnelResponse")
                .field(&response.status)
                .finish(),
        }
    }
}

impl From<NetError> for StreamRequestError {
    fn from(error: NetError) -> Self {
        StreamRequestError::Failed(error)
    }
}

/// Where a job is, readable while the job itself is borrowed by its run.
#[derive(Debug, Clone, Default)]
pub struct JobProgress {
    state: LoadStateCell,
    connecting: Arc<Mutex<Option<(ConnectionGroupKey, SocketParams)>>>,
}

impl JobProgress {
    fn set(&self, state: LoadState) {
        self.state.set(state);
    }

    fn begin_connect(&self, key: ConnectionGroupKey, params: SocketParams) {
        *self.connecting.lock().unwrap_or_else(PoisonError::into_inner) = Some((key, params));
    }

    fn end_connect(&self) {
        *self.connecting.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// While a socket is being requested, the pools' view; otherwise the
    /// job's own.
    pub fn load_state(&self, session: &HttpNetworkSession) -> LoadState {
        let connecting = self
            .connecting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match connecting {
            Some((key, params)) => session.load_state(&key, &params).max(LoadState::WaitingForAvailableSocket),
            None => self.state.get(),
        }
    }
}

/// A tunnel paused on a 407.
struct PendingTunnel {
    /// Proxy-pool socket the CONNECT can be retried on, when kept alive.
    handle: Option<ClientSocketHandle>,
    controller: Arc<AuthController>,
}

pub struct StreamRequestJob {
    session: Arc<HttpNetworkSession>,
    request: HttpRequestInfo,
    kind: JobKind,
    origin: HostPortPair,
    priority: RequestPriority,
    server_ssl: SslConfig,
    proxy_ssl: SslConfig,
    proxy_info: ProxyInfo,
    /// One controller per proxy, kept across restarts so a challenge
    /// answered once is not asked again.
    proxy_auth: HashMap<ProxyServer, Arc<AuthController>>,
    state: State,
    connection: Option<ClientSocketHandle>,
    session_stream: Option<Box<dyn HttpStream>>,
    pending_tunnel: Option<PendingTunnel>,
    client_auth_for_proxy: bool,
    /// Main job: released by the alternate job.
    blocked_on: Option<watch::Receiver<Option<Duration>>>,
    /// Alternate job: releases the main job.
    blocking: Option<(watch::Sender<Option<Duration>>, Duration)>,
    progress: JobProgress,
    proxy_resolve_start: Option<Instant>,
    proxy_resolve_end: Option<Instant>,
    /// Skip idle sockets and existing sessions.
    new_connection_only: bool,
}

impl StreamRequestJob {
    pub fn new(
        session: Arc<HttpNetworkSession>,
        request: HttpRequestInfo,
        kind: JobKind,
        mut server_ssl: SslConfig,
        proxy_ssl: SslConfig,
        priority: RequestPriority,
    ) -> Result<Self, NetError> {
        let origin = HostPortPair::from_url(&request.url)?;
        if let JobKind::Alternate(service) = &kind {
            server_ssl.alpn_protocols.retain(|p| *p != service.protocol);
            server_ssl.alpn_protocols.insert(0, service.protocol);
        }
        Ok(Self {
            session,
            request,
            kind,
            origin,
            priority,
            server_ssl,
            proxy_ssl,
            proxy_info: ProxyInfo::direct(),
            proxy_auth: HashMap::new(),
            state: State::Start,
            connection: None,
            session_stream: None,
            pending_tunnel: None,
            client_auth_for_proxy: false,
            blocked_on: None,
            blocking: None,
            progress: JobProgress::default(),
            proxy_resolve_start: None,
            proxy_resolve_end: None,
            new_connection_only: false,
        })
    }

    /// Connect anew rather than reuse an idle socket or a live session.
    pub fn require_new_connection(&mut self) {
        self.new_connection_only = true;
    }

    /// Hold the connection step until `rx` carries a delay (then wait it
    /// out) or its sender goes away.
    pub(crate) fn wait_for(&mut self, rx: watch::Receiver<Option<Duration>>) {
        self.blocked_on = Some(rx);
    }

    /// Release the blocked sibling `head_start` after this job's proxy is
    /// resolved, or at once if this job fails first.
    pub(crate) fn resume_sibling_with(&mut self, tx: watch::Sender<Option<Duration>>, head_start: Duration) {
        self.blocking = Some((tx, head_start));
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn progress(&self) -> JobProgress {
        self.progress.clone()
    }

    pub fn proxy_info(&self) -> &ProxyInfo {
        &self.proxy_info
    }

    /// Run until a stream is ready, the job fails, or it needs the caller.
    pub async fn run(&mut self) -> Result<StreamReady, StreamRequestError> {
        self.do_loop().await
    }

    /// [`run`](Self::run) by value, so a racing broker can move the job
    /// and its progress into a background task.
    pub(crate) async fn run_owned(mut self) -> (Self, Result<StreamReady, StreamRequestError>) {
        let result = self.do_loop().await;
        (self, result)
    }

    /// Finish the CONNECT paused on a 407, now that the proxy auth
    /// controller has credentials.
    pub async fn restart_tunnel_with_proxy_auth(&mut self) -> Result<StreamReady, StreamRequestError> {
        debug_assert_eq!(self.state, State::WaitingUserAction);
        self.state = State::RestartTunnelAuth;
        self.do_loop().await
    }

    /// Use the connection whose certificate failed verification anyway.
    pub async fn resume_ignoring_cert_error(&mut self) -> Result<StreamReady, StreamRequestError> {
        debug_assert_eq!(self.state, State::WaitingUserAction);
        if self.connection.is_none() {
            return Err(NetError::SocketNotConnected.into());
        }
        self.state = State::CreateStream;
        self.do_loop().await
    }

    /// Reconnect presenting `certificate` (or explicitly none) to whoever
    /// asked for one.
    pub async fn restart_with_certificate(
        &mut self,
        certificate: Option<ClientCertificate>,
    ) -> Result<StreamReady, StreamRequestError> {
        debug_assert_eq!(self.state, State::WaitingUserAction);
        let config = if self.client_auth_for_proxy {
            &mut self.proxy_ssl
        } else {
            &mut self.server_ssl
        };
        config.send_client_cert = true;
        config.client_cert = certificate;
        self.state = State::InitConnection;
        self.do_loop().await
    }

    async fn do_loop(&mut self) -> Result<StreamReady, StreamRequestError> {
        loop {
            let step = match self.state {
                State::Start => {
                    self.state = State::ResolveProxy;
                    Ok(())
                }
                State::ResolveProxy => self.do_resolve_proxy().await,
                State::WaitForJob => {
                    self.do_wait_for_job().await;
                    Ok(())
                }
                State::InitConnection => self.do_init_connection().await,
                State::RestartTunnelAuth => self.do_restart_tunnel_auth().await,
                State::CreateStream => match self.do_create_stream().await {
                    Ok(ready) => {
                        self.state = State::Done;
                        self.progress.set(LoadState::Idle);
                        return Ok(ready);
                    }
                    Err(e) => Err(e),
                },
                State::WaitingUserAction | State::Done => {
                    tracing::debug!(state = ?self.state, "Stream request job driven without a pending step");
                    Err(NetError::Aborted.into())
                }
            };
            if let Err(e) = step {
                if e.is_pause() {
                    self.state = State::WaitingUserAction;
                } else {
                    self.state = State::Done;
                    self.release_sibling(Duration::ZERO);
                }
                tracing::debug!(url = %self.request.url, kind = ?self.kind, error = ?e, "Stream request job stopped");
                return Err(e);
            }
        }
    }

    fn release_sibling(&mut self, delay: Duration) {
        if let Some((tx, _)) = self.blocking.take() {
            tx.send_replace(Some(delay));
        }
    }

    async fn do_resolve_proxy(&mut self) -> Result<(), StreamRequestError> {
        self.progress.set(LoadState::ResolvingProxyForUrl);
        self.proxy_resolve_start = Some(Instant::now());
        let resolved = self.session.proxy_service().resolve_proxy(&self.request.url).await;
        self.proxy_resolve_end = Some(Instant::now());
        let info = resolved?;

        if matches!(self.kind, JobKind::Alternate(_)) && !info.is_direct() {
            tracing::debug!(proxy = %info.proxy_server(), "Alternative service not used through a proxy");
            return Err(NetError::NotImplemented("alternative service through a proxy").into());
        }
        self.proxy_info = info;
        if let Some(head_start) = self.blocking.as_ref().map(|(_, d)| *d) {
            self.release_sibling(head_start);
        }
        self.state = if self.blocked_on.is_some() {
            State::WaitForJob
        } else {
            State::InitConnection
        };
        Ok(())
    }

    async fn do_wait_for_job(&mut self) {
        if let Some(mut rx) = self.blocked_on.take() {
            let delay = loop {
                if let Some(delay) = *rx.borrow_and_update() {
                    break delay;
                }
                if rx.changed().await.is_err() {
                    break Duration::ZERO;
                }
            };
            if !delay.is_zero() {
                tracing::trace!(delay_ms = delay.as_millis() as u64, "Main job yielding to alternate job");
                tokio::time::sleep(delay).await;
            }
        }
        self.state = State::InitConnection;
    }

    fn endpoint(&self) -> HostPortPair {
        match &self.kind {
            JobKind::Main => self.origin.clone(),
            JobKind::Alternate(service) => service.endpoint.clone(),
        }
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::new(
            self.endpoint(),
            self.proxy_info.proxy_server().clone(),
            self.request.privacy_mode,
        )
    }

    fn proxy_auth_for(&mut self, proxy: &ProxyServer) -> Arc<AuthController> {
        let cache: Arc<dyn CredentialStore> = Arc::clone(self.session.auth_cache()) as Arc<dyn CredentialStore>;
        Arc::clone(
            self.proxy_auth
                .entry(proxy.clone())
                .or_insert_with(|| Arc::new(AuthController::for_proxy(proxy, cache))),
        )
    }

    async fn do_init_connection(&mut self) -> Result<(), StreamRequestError> {
        let sessions = self
            .session
            .multiplexed_sessions()
            .filter(|_| !self.new_connection_only)
            .cloned();
        if let Some(sessions) = sessions {
            let key = self.session_key();
            if let Some(existing) = sessions.find_available_session(&key) {
                match existing.create_stream(&self.request).await {
                    Ok(stream) => {
                        tracing::debug!(session = %key, "Using existing multiplexed session");
                        self.session_stream = Some(stream);
                        self.state = State::CreateStream;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::debug!(session = %key, error = %e, "Existing session refused stream, connecting");
                    }
                }
            }
        }

        let proxy = self.proxy_info.proxy_server().clone();
        let proxy_auth = proxy.is_http_like().then(|| self.proxy_auth_for(&proxy));
        let endpoint = self.endpoint();
        let (key, params) = socket_request(Route {
            origin: &self.origin,
            endpoint: &endpoint,
            is_https: self.request.is_https(),
            proxy: &proxy,
            server_ssl: &self.server_ssl,
            proxy_ssl: &self.proxy_ssl,
            privacy_mode: self.request.privacy_mode,
            proxy_auth,
        })?;

        tracing::debug!(group = %key, url = %self.request.url, kind = ?self.kind, "Requesting socket");
        self.progress.begin_connect(key.clone(), params.clone());
        let result = if self.new_connection_only {
            self.session.request_fresh_socket(&key, params, self.priority).await
        } else {
            self.session.request_socket(&key, params, self.priority).await
        };
        self.progress.end_connect();

        match result {
            Ok(handle) => {
                if let JobKind::Alternate(service) = &self.kind {
                    let negotiated = handle.negotiated_protocol();
                    if negotiated != service.protocol {
                        tracing::debug!(
                            expected = ?service.protocol,
                            negotiated = ?negotiated,
                            "Alternative endpoint negotiated another protocol"
                        );
                        return Err(NetError::AlpnNegotiationFailed.into());
                    }
                }
                self.connection = Some(handle);
                self.state = State::CreateStream;
                Ok(())
            }
            Err(e) => self.on_connection_failure(e),
        }
    }

    fn on_connection_failure(&mut self, e: RequestSocketError) -> Result<(), StreamRequestError> {
        let RequestSocketError { error, extra, handle } = e;
        match extra {
            Some(FailureExtra::ProxyAuthRequired(challenge)) => {
                let ProxyAuthChallenge {
                    response,
                    controller,
                    keep_alive,
                    tunnel,
                } = challenge;
                let handle = tunnel.or(handle).filter(|_| keep_alive);
                self.pending_tunnel = Some(PendingTunnel {
                    handle,
                    controller: Arc::clone(&controller),
                });
                Err(StreamRequestError::ProxyAuthRequested { response, controller })
            }
            Some(FailureExtra::TunnelResponse(response)) => Err(StreamRequestError::HttpsProxyTunnelResponse(response)),
            Some(FailureExtra::ClientAuth(info)) => {
                self.client_auth_for_proxy = info.is_proxy;
                Err(StreamRequestError::ClientAuthRequested(info))
            }
            // Behind an HTTPS proxy the failing certificate may be the
            // proxy's, which is a reason to try the next proxy instead.
            Some(FailureExtra::CertError { ssl_info }) if !self.proxy_info.is_https() => {
                self.connection = handle;
                Err(StreamRequestError::CertificateError { error, ssl_info })
            }
            _ => {
                drop(handle);
                self.reconsider_proxy(error)
            }
        }
    }

    fn reconsider_proxy(&mut self, error: NetError) -> Result<(), StreamRequestError> {
        if self.proxy_info.is_direct() {
            return Err(error.into());
        }
        match self
            .session
            .proxy_service()
            .reconsider_proxy_after_error(&mut self.proxy_info, &error)
        {
            None => {
                self.pending_tunnel = None;
                self.state = State::InitConnection;
                Ok(())
            }
            Some(error) => Err(error.into()),
        }
    }

    async fn do_restart_tunnel_auth(&mut self) -> Result<(), StreamRequestError> {
        let Some(PendingTunnel { handle, controller }) = self.pending_tunnel.take() else {
            self.state = State::InitConnection;
            return Ok(());
        };
        let Some(mut handle) = handle else {
            // The proxy closed the connection; the next CONNECT carries the
            // credentials from the start.
            self.state = State::InitConnection;
            return Ok(());
        };

        self.progress.set(LoadState::EstablishingProxyTunnel);
        let http = self.session.config().http.clone();
        let request = TunnelRequest {
            destination: &self.origin,
            auth: &controller,
            is_https_proxy: self.proxy_info.is_https(),
            http: &http,
        };
        match establish_tunnel(&mut handle, &request).await {
            Ok(()) => {
                tracing::debug!(proxy = %self.proxy_info.proxy_server(), "Tunnel established after proxy auth");
                // The tunnel idles in the proxy pool, where the next socket
                // request for this group picks it up.
                handle.release();
                self.new_connection_only = false;
                self.state = State::InitConnection;
                Ok(())
            }
            Err(failure) => match failure.extra {
                Some(FailureExtra::ProxyAuthRequired(challenge)) => {
                    self.pending_tunnel = Some(PendingTunnel {
                        handle: challenge.keep_alive.then_some(handle),
                        controller: Arc::clone(&challenge.controller),
                    });
                    Err(StreamRequestError::ProxyAuthRequested {
                        response: challenge.response,
                        controller: challenge.controller,
                    })
                }
                Some(FailureExtra::TunnelResponse(response)) => {
                    Err(StreamRequestError::HttpsProxyTunnelResponse(response))
                }
                _ => {
                    drop(handle);
                    self.reconsider_proxy(failure.error)
                }
            },
        }
    }

    async fn do_create_stream(&mut self) -> Result<StreamReady, StreamRequestError> {
        if let Some(stream) = self.session_stream.take() {
            return Ok(self.ready(stream, ConnectTiming::default()));
        }
        let Some(handle) = self.connection.take() else {
            unreachable!("stream creation without a connection");
        };
        let timing = *handle.connect_timing();

        if handle.negotiated_protocol() == NextProto::Http2 {
            if let Some(sessions) = self.session.multiplexed_sessions().cloned() {
                let key = self.session_key();
                tracing::debug!(session = %key, "Starting multiplexed session");
                let session = sessions.create_session(key, handle).await?;
                let stream = session.create_stream(&self.request).await?;
                return Ok(self.ready(stream, timing));
            }
        }

        let via_proxy = self.proxy_info.is_http_like() && !self.request.is_https();
        let stream = HttpBasicStream::new(handle, via_proxy, self.session.config().http.max_response_header_bytes);
        Ok(self.ready(Box::new(stream), timing))
    }

    fn ready(&self, stream: Box<dyn HttpStream>, connect_timing: ConnectTiming) -> StreamReady {
        StreamReady {
            stream,
            proxy_info: self.proxy_info.clone(),
            server_ssl_config: self.server_ssl.clone(),
            connect_timing,
            alternate: match &self.kind {
                JobKind::Main => None,
                JobKind::Alternate(service) => Some(service.clone()),
            },
            proxy_resolve_start: self.proxy_resolve_start,
            proxy_resolve_end: self.proxy_resolve_end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, SocketAddr};

    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use crate::config::EngineConfig;
    use crate::net::socket::{BoxedSocket, ClientSocketFactory};
    use crate::net::tls::{TlsConnector, TlsHandshakeError};
    use crate::net::RuleBasedResolver;
    use crate::session::SessionDeps;

    const ORIGIN_IP: &str = "10.0.0.1";
    const DEAD_PROXY_IP: &str = "10.0.0.66";

    #[derive(Default)]
    struct Sockets(Mutex<Vec<DuplexStream>>);

    #[async_trait]
    impl ClientSocketFactory for Sockets {
        async fn connect(&self, addr: SocketAddr) -> Result<BoxedSocket, NetError> {
            if addr.ip() == DEAD_PROXY_IP.parse::<IpAddr>().unwrap() {
                return Err(NetError::ConnectionRefused);
            }
            let (client, server) = tokio::io::duplex(4096);
            self.0.lock().unwrap().push(server);
            Ok(Box::new(client))
        }
    }

    /// Fails verification but completes the handshake.
    struct UntrustedTls;

    #[async_trait]
    impl TlsConnector for UntrustedTls {
        async fn connect(
            &self,
            _host: &HostPortPair,
            _config: &SslConfig,
            socket: BoxedSocket,
        ) -> Result<BoxedSocket, TlsHandshakeError> {
            Err(TlsHandshakeError::CertificateError {
                error: NetError::CertAuthorityInvalid,
                ssl_info: SslInfo {
                    cert_chain: vec![vec![1, 2, 3]],
                    cert_error: Some(NetError::CertAuthorityInvalid),
                    ..Default::default()
                },
                socket,
            })
        }
    }

    fn session(proxy_rules: &str) -> Arc<HttpNetworkSession> {
        let mut resolver = RuleBasedResolver::new(None);
        resolver
            .add_rule("origin.test", vec![ORIGIN_IP.parse().unwrap()])
            .add_rule("dead.test", vec![DEAD_PROXY_IP.parse().unwrap()])
            .add_rule("live.test", vec!["10.0.0.2".parse().unwrap()]);
        let mut config = EngineConfig::default();
        config.proxy.rules = proxy_rules.to_string();
        let deps = SessionDeps {
            resolver: Arc::new(resolver),
            sockets: Arc::new(Sockets::default()),
            tls: Arc::new(UntrustedTls),
            multiplexed: None,
        };
        HttpNetworkSession::new(config, deps).unwrap()
    }

    fn job(session: &Arc<HttpNetworkSession>, url: &str) -> StreamRequestJob {
        StreamRequestJob::new(
            Arc::clone(session),
            HttpRequestInfo::get(url).unwrap(),
            JobKind::Main,
            SslConfig::default(),
            SslConfig::default(),
            RequestPriority::Medium,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn direct_request_gets_a_basic_stream() {
        let session = session("");
        let mut job = job(&session, "http://origin.test/");
        let ready = job.run().await.unwrap();
        assert!(ready.proxy_info.is_direct());
        assert!(ready.alternate.is_none());
        assert!(ready.proxy_resolve_end >= ready.proxy_resolve_start);
        assert_eq!(ready.stream.negotiated_protocol(), NextProto::Http11);
        assert!(!ready.stream.is_connection_reused());
    }

    #[tokio::test]
    async fn unreachable_proxy_falls_back_to_next() {
        let session = session("http://dead.test:3128 http://live.test:3128");
        let mut job = job(&session, "http://origin.test/");
        let ready = job.run().await.unwrap();
        let dead = ProxyServer::new(
            crate::proxy::ProxyScheme::Http,
            HostPortPair::new("dead.test", 3128),
        );
        assert_eq!(ready.proxy_info.proxy_server().host_port(), Some(&HostPortPair::new("live.test", 3128)));
        assert!(session.proxy_service().is_bad(&dead));
    }

    #[tokio::test]
    async fn exhausted_proxy_list_reports_the_error() {
        let session = session("http://dead.test:3128");
        let mut job = job(&session, "http://origin.test/");
        let err = job.run().await.unwrap_err();
        assert_eq!(err.net_error(), NetError::ProxyConnectionFailed);
        assert!(!err.is_pause());
    }

    #[tokio::test]
    async fn certificate_error_pauses_and_resumes_on_the_same_connection() {
        let session = session("");
        let mut job = job(&session, "https://origin.test/");
        match job.run().await {
            Err(StreamRequestError::CertificateError { error, ssl_info }) => {
                assert_eq!(error, NetError::CertAuthorityInvalid);
                assert_eq!(ssl_info.cert_chain.len(), 1);
            }
            other => panic!("expected a certificate pause, got {:?}", other.map(|_| ())),
        }
        let connections_before = session.transport_pool().total_socket_count();
        let ready = job.resume_ignoring_cert_error().await.unwrap();
        assert_eq!(session.transport_pool().total_socket_count(), connections_before);
        ready.stream.close();
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_job_waits_out_the_head_start() {
        let session = session("");
        let mut main = job(&session, "http://origin.test/");
        let (tx, rx) = watch::channel(None);
        main.wait_for(rx);

        let started = Instant::now();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send_replace(Some(Duration::from_millis(300)));
        });
        main.run().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(350));
        releaser.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_blocker_releases_at_once() {
        let session = session("");
        let mut main = job(&session, "http://origin.test/");
        let (tx, rx) = watch::channel(None);
        main.wait_for(rx);
        drop(tx);
        let started = Instant::now();
        main.run().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(1));
    }
}
