//! HTTP network transaction: one logical request driven to its final response.
//!
//! # Responsibilities
//! - Obtain a stream from the stream factory and run the exchange over it
//! - Answer auth challenges from cached credentials, or surface them
//! - Retry transparently where that is safe: TLS version fallback, one
//!   resend after a stale reused connection, auth restarts
//! - Account timing and received bytes across every attempt
//!
//! # Data Flow
//! ```text
//! NotifyBeforeStart → CreateStream → InitStream → GenerateProxyAuthToken
//!     → GenerateServerAuthToken → InitRequestBody → BuildRequest
//!     → SendRequest → ReadHeaders ─┬─ 1xx ───────────────▶ ReadHeaders
//!                                  ├─ 401/407, credentials ─▶ DrainBodyForAuthRestart
//!                                  │                            ├─▶ InitStream (same connection)
//!                                  │                            └─▶ CreateStream
//!                                  ├─ stale reused connection ─▶ CreateStream (once)
//!                                  └─ final ─▶ ReadBody ─▶ Done
//!
//! CreateStream ── TLS version intolerance ──▶ CreateStream (lower ceiling)
//!              ── certificate / client cert / tunnel 407 ──▶ caller, then
//!                 restart_ignoring_error / restart_with_certificate /
//!                 restart_with_auth resume the stream request
//! ```
//!
//! # Design Decisions
//! - The state cursor lives in the transaction, so the public restart
//!   calls re-enter the same loop after the caller has decided
//! - Only this layer retries silently; every retry is bounded

pub mod policy;
pub mod timing;

use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, USER_AGENT};
use http::Method;
use tokio::time::Instant;

use crate::auth::{AuthController, AuthCredentials, CredentialStore};
use crate::error::NetError;
use crate::http::request::HttpRequestInfo;
use crate::http::response::HttpResponseInfo;
use crate::http::stream::HttpStream;
use crate::net::address::HostPortPair;
use crate::net::tls::{AllowedBadCert, ClientCertificate, SslConfig};
use crate::observability::metrics;
use crate::pool::{LoadState, LoadStateCell};
use crate::proxy::server::{ProxyInfo, ProxyServer};
use crate::session::HttpNetworkSession;
use crate::stream_factory::{HttpStreamFactory, JobProgress, StreamReady, StreamRequest, StreamRequestError};

pub use policy::{FallbackAction, ResendPolicy, TlsFallbackPolicy};
pub use timing::LoadTimingInfo;

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");
const ALT_SVC: &str = "alt-svc";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    NotifyBeforeStart,
    CreateStream,
    InitStream,
    GenerateProxyAuthToken,
    GenerateServerAuthToken,
    InitRequestBody,
    BuildRequest,
    SendRequest,
    ReadHeaders,
    ReadBody,
    DrainBodyForAuthRestart,
    Done,
}

/// What the next `CreateStream` asks of the stream request.
enum StreamStep {
    Start,
    RestartTunnel,
    IgnoreCertError,
    Certificate(Option<ClientCertificate>),
}

/// A decision the caller owes before the transaction can go on.
#[derive(Debug, Clone)]
enum Awaiting {
    ServerAuth,
    /// Proxy credentials for a request forwarded through an HTTP proxy.
    ProxyAuth,
    /// Proxy credentials for a CONNECT tunnel.
    TunnelAuth(Arc<AuthController>),
    CertificateError,
    ClientCertificate,
}

/// Called once before any network activity; returning `false` aborts.
pub type BeforeNetworkStart = Box<dyn FnMut(&HttpRequestInfo) -> bool + Send>;

/// Load state readable from outside while the transaction is being driven.
#[derive(Debug, Clone)]
pub struct TransactionProgress {
    session: Arc<HttpNetworkSession>,
    state: LoadStateCell,
    stream_request: Arc<Mutex<Option<JobProgress>>>,
}

impl TransactionProgress {
    fn new(session: Arc<HttpNetworkSession>) -> Self {
        Self {
            session,
            state: LoadStateCell::default(),
            stream_request: Arc::new(Mutex::new(None)),
        }
    }

    fn set_stream_request(&self, progress: Option<JobProgress>) {
        *self.stream_request.lock().unwrap_or_else(PoisonError::into_inner) = progress;
    }

    pub fn load_state(&self) -> LoadState {
        let stream_request = self
            .stream_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match stream_request {
            Some(job) => job.load_state(&self.session),
            None => self.state.get(),
        }
    }
}

pub struct HttpNetworkTransaction {
    session: Arc<HttpNetworkSession>,
    factory: HttpStreamFactory,
    request: HttpRequestInfo,
    state: State,
    stream_step: StreamStep,
    stream_request: Option<StreamRequest>,
    stream: Option<Box<dyn HttpStream>>,
    server_ssl: SslConfig,
    proxy_ssl: SslConfig,
    proxy_info: ProxyInfo,
    response: HttpResponseInfo,
    request_headers: HeaderMap,
    upload_length: Option<u64>,
    server_auth: Arc<AuthController>,
    /// Controller for the HTTP proxy a plain request is forwarded through.
    proxy_auth: Option<(ProxyServer, Arc<AuthController>)>,
    server_auth_header: Option<(HeaderName, HeaderValue)>,
    proxy_auth_header: Option<(HeaderName, HeaderValue)>,
    awaiting: Option<Awaiting>,
    auth_restarts: u32,
    used_server_auth: bool,
    used_proxy_auth: bool,
    resend: ResendPolicy,
    fallback: TlsFallbackPolicy,
    resent: bool,
    /// The next stream must come from a new connection.
    new_connection_needed: bool,
    headers_received: bool,
    before_network_start: Option<BeforeNetworkStart>,
    timing: LoadTimingInfo,
    /// Bytes received by attempts that have been replaced.
    earlier_received_bytes: u64,
    progress: TransactionProgress,
}

impl HttpNetworkTransaction {
    pub fn new(session: Arc<HttpNetworkSession>, request: HttpRequestInfo) -> Self {
        let cache: Arc<dyn CredentialStore> = Arc::clone(session.auth_cache()) as Arc<dyn CredentialStore>;
        let server_auth = Arc::new(AuthController::for_server(&request.url, cache));
        let config = session.config();
        let server_ssl = SslConfig::from_defaults(&config.ssl);
        let resend = ResendPolicy::new(&config.retry);
        let fallback = TlsFallbackPolicy::new(config.ssl.version_fallback_min);
        Self {
            factory: HttpStreamFactory::new(Arc::clone(&session)),
            progress: TransactionProgress::new(Arc::clone(&session)),
            session,
            request,
            state: State::Idle,
            stream_step: StreamStep::Start,
            stream_request: None,
            stream: None,
            proxy_ssl: server_ssl.clone(),
            server_ssl,
            proxy_info: ProxyInfo::direct(),
            response: HttpResponseInfo::default(),
            request_headers: HeaderMap::new(),
            upload_length: None,
            server_auth,
            proxy_auth: None,
            server_auth_header: None,
            proxy_auth_header: None,
            awaiting: None,
            auth_restarts: 0,
            used_server_auth: false,
            used_proxy_auth: false,
            resend,
            fallback,
            resent: false,
            new_connection_needed: false,
            headers_received: false,
            before_network_start: None,
            timing: LoadTimingInfo::default(),
            earlier_received_bytes: 0,
        }
    }

    pub fn set_before_network_start(&mut self, hook: BeforeNetworkStart) {
        self.before_network_start = Some(hook);
    }

    /// Run until the final response head is in, or the caller must decide
    /// something. A surfaced auth challenge is an `Ok` with
    /// [`HttpResponseInfo::auth_challenge`] set.
    pub async fn start(&mut self) -> Result<(), NetError> {
        if self.state != State::Idle {
            tracing::debug!(request = %self.request.id, state = ?self.state, "Transaction started twice");
            return Err(NetError::Aborted);
        }
        self.timing.request_start = Some(Instant::now());
        self.state = State::NotifyBeforeStart;
        self.run().await
    }

    /// Answer the pending auth challenge with `credentials`.
    pub async fn restart_with_auth(&mut self, credentials: AuthCredentials) -> Result<(), NetError> {
        let awaiting = match self.awaiting.take() {
            Some(a @ (Awaiting::ServerAuth | Awaiting::ProxyAuth | Awaiting::TunnelAuth(_))) => a,
            other => {
                self.awaiting = other;
                return Err(NetError::NotImplemented("no auth challenge to answer"));
            }
        };
        metrics::record_restart("auth");
        self.response.auth_challenge = None;
        match awaiting {
            Awaiting::TunnelAuth(controller) => {
                controller.reset_auth(Some(credentials));
                self.used_proxy_auth = true;
                self.stream_step = StreamStep::RestartTunnel;
                self.state = State::CreateStream;
            }
            Awaiting::ProxyAuth => {
                if let Some((_, controller)) = &self.proxy_auth {
                    controller.reset_auth(Some(credentials));
                }
                self.prepare_auth_restart();
            }
            _ => {
                self.server_auth.reset_auth(Some(credentials));
                self.prepare_auth_restart();
            }
        }
        self.run().await
    }

    /// Continue over the connection whose certificate failed verification.
    pub async fn restart_ignoring_error(&mut self) -> Result<(), NetError> {
        if !matches!(self.awaiting, Some(Awaiting::CertificateError)) {
            return Err(NetError::NotImplemented("no certificate error to ignore"));
        }
        self.awaiting = None;
        if let Some(info) = &self.response.ssl_info {
            if let (Some(der), Some(error)) = (info.end_entity(), info.cert_error.clone()) {
                self.server_ssl.allowed_bad_certs.push(AllowedBadCert {
                    der: der.to_vec(),
                    error,
                });
            }
        }
        metrics::record_restart("ignore_cert_error");
        self.stream_step = StreamStep::IgnoreCertError;
        self.state = State::CreateStream;
        self.run().await
    }

    /// Reconnect presenting `certificate` (or explicitly none) to whoever
    /// asked. The choice is remembered for that host.
    pub async fn restart_with_certificate(&mut self, certificate: Option<ClientCertificate>) -> Result<(), NetError> {
        if !matches!(self.awaiting, Some(Awaiting::ClientCertificate)) {
            return Err(NetError::NotImplemented("no client certificate requested"));
        }
        self.awaiting = None;
        if let Some(info) = self.response.cert_request_info.take() {
            self.session
                .client_auth_cache()
                .add(&info.host_and_port, certificate.clone());
            let config = if info.is_proxy {
                &mut self.proxy_ssl
            } else {
                &mut self.server_ssl
            };
            config.send_client_cert = true;
            config.client_cert = certificate.clone();
        }
        metrics::record_restart("client_certificate");
        self.stream_step = StreamStep::Certificate(certificate);
        self.state = State::CreateStream;
        self.run().await
    }

    /// Next piece of the response body; `None` once it is complete.
    pub async fn read(&mut self) -> Result<Option<Bytes>, NetError> {
        if self.state != State::ReadBody {
            return Ok(None);
        }
        let Some(stream) = self.stream.as_mut() else {
            self.state = State::Done;
            return Ok(None);
        };
        self.progress.state.set(LoadState::ReadingResponse);
        match stream.read_body().await {
            Ok(Some(chunk)) => {
                if stream.is_response_body_complete() {
                    self.finish_stream();
                }
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.finish_stream();
                Ok(None)
            }
            Err(e) => {
                tracing::debug!(url = %self.request.url, error = %e, "Body read failed");
                if let Some(stream) = self.stream.take() {
                    self.earlier_received_bytes += stream.received_bytes();
                }
                self.state = State::Done;
                self.progress.state.set(LoadState::Idle);
                Err(e)
            }
        }
    }

    /// The rest of the body in one piece.
    pub async fn read_to_end(&mut self) -> Result<Bytes, NetError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub fn request(&self) -> &HttpRequestInfo {
        &self.request
    }

    pub fn response_info(&self) -> &HttpResponseInfo {
        &self.response
    }

    pub fn load_timing_info(&self) -> &LoadTimingInfo {
        &self.timing
    }

    pub fn load_state(&self) -> LoadState {
        self.progress.load_state()
    }

    /// A handle for reading the load state while `start` is running.
    pub fn progress(&self) -> TransactionProgress {
        self.progress.clone()
    }

    /// Bytes received over every attempt, heads and bodies.
    pub fn total_received_bytes(&self) -> u64 {
        self.earlier_received_bytes + self.stream.as_ref().map_or(0, |s| s.received_bytes())
    }

    pub fn proxy_info(&self) -> &ProxyInfo {
        &self.proxy_info
    }

    pub fn server_ssl_config(&self) -> &SslConfig {
        &self.server_ssl
    }

    /// Server credentials went out on some attempt.
    pub fn used_server_auth(&self) -> bool {
        self.used_server_auth
    }

    /// Proxy credentials went out on some attempt.
    pub fn used_proxy_auth(&self) -> bool {
        self.used_proxy_auth
    }

    /// The controller the pending auth challenge belongs to.
    pub fn pending_auth_controller(&self) -> Option<Arc<AuthController>> {
        match self.awaiting.as_ref()? {
            Awaiting::ServerAuth => Some(Arc::clone(&self.server_auth)),
            Awaiting::ProxyAuth => self.proxy_auth.as_ref().map(|(_, c)| Arc::clone(c)),
            Awaiting::TunnelAuth(controller) => Some(Arc::clone(controller)),
            Awaiting::CertificateError | Awaiting::ClientCertificate => None,
        }
    }

    /// The pending challenge can be answered without new credentials.
    pub fn is_ready_to_restart_for_auth(&self) -> bool {
        self.pending_auth_controller().is_some_and(|c| c.have_auth())
    }

    async fn run(&mut self) -> Result<(), NetError> {
        let result = self.do_loop().await;
        if self.awaiting.is_none() {
            match &result {
                Ok(()) => metrics::record_transaction(Ok(self.response.status)),
                Err(e) => metrics::record_transaction(Err(e)),
            }
        }
        result
    }

    async fn do_loop(&mut self) -> Result<(), NetError> {
        loop {
            let step = match self.state {
                State::NotifyBeforeStart => self.do_notify_before_start(),
                State::CreateStream => self.do_create_stream().await,
                State::InitStream => self.do_init_stream(),
                State::GenerateProxyAuthToken => self.do_generate_proxy_auth_token(),
                State::GenerateServerAuthToken => self.do_generate_server_auth_token(),
                State::InitRequestBody => self.do_init_request_body(),
                State::BuildRequest => self.do_build_request(),
                State::SendRequest => self.do_send_request().await,
                State::ReadHeaders => self.do_read_headers().await,
                State::DrainBodyForAuthRestart => self.do_drain_body_for_auth_restart().await,
                State::ReadBody | State::Done => return Ok(()),
                State::Idle => unreachable!("transaction driven before start"),
            };
            if let Err(e) = step {
                tracing::debug!(
                    request = %self.request.id,
                    url = %self.request.url,
                    state = ?self.state,
                    error = %e,
                    "Transaction stopped"
                );
                self.state = State::Done;
                self.progress.state.set(LoadState::Idle);
                self.progress.set_stream_request(None);
                if let Some(stream) = self.stream.take() {
                    self.earlier_received_bytes += stream.received_bytes();
                }
                return Err(e);
            }
        }
    }

    fn do_notify_before_start(&mut self) -> Result<(), NetError> {
        if let Some(hook) = self.before_network_start.as_mut() {
            if !hook(&self.request) {
                return Err(NetError::Aborted);
            }
        }
        self.state = State::CreateStream;
        Ok(())
    }

    async fn do_create_stream(&mut self) -> Result<(), NetError> {
        let step = std::mem::replace(&mut self.stream_step, StreamStep::Start);
        if matches!(step, StreamStep::Start) {
            self.apply_remembered_client_cert();
            let mut request = self.factory.request_stream(
                &self.request,
                self.server_ssl.clone(),
                self.proxy_ssl.clone(),
                self.request.priority,
            )?;
            if std::mem::take(&mut self.new_connection_needed) {
                request.require_new_connection();
            }
            self.stream_request = Some(request);
        }
        let Some(stream_request) = self.stream_request.as_mut() else {
            unreachable!("stream request resumed after it was dropped");
        };
        self.progress.set_stream_request(Some(stream_request.progress()));
        let result = match step {
            StreamStep::Start => stream_request.start().await,
            StreamStep::RestartTunnel => stream_request.restart_tunnel_with_proxy_auth().await,
            StreamStep::IgnoreCertError => stream_request.resume_ignoring_cert_error().await,
            StreamStep::Certificate(certificate) => stream_request.restart_with_certificate(certificate).await,
        };
        self.progress.set_stream_request(None);
        match result {
            Ok(ready) => {
                self.stream_request = None;
                self.on_stream_ready(ready);
                Ok(())
            }
            Err(e) => self.on_stream_request_error(e),
        }
    }

    /// A client certificate chosen earlier for this host is offered up front.
    fn apply_remembered_client_cert(&mut self) {
        if !self.request.is_https() || self.server_ssl.send_client_cert {
            return;
        }
        let Ok(origin) = HostPortPair::from_url(&self.request.url) else {
            return;
        };
        if let Some(certificate) = self.session.client_auth_cache().lookup(&origin) {
            tracing::debug!(server = %origin, "Using remembered client certificate choice");
            self.server_ssl.send_client_cert = true;
            self.server_ssl.client_cert = certificate;
        }
    }

    fn on_stream_ready(&mut self, ready: StreamReady) {
        let StreamReady {
            stream,
            proxy_info,
            connect_timing,
            proxy_resolve_start,
            proxy_resolve_end,
            ..
        } = ready;
        self.timing.socket_reused = stream.is_connection_reused();
        self.timing.proxy_resolve_start = proxy_resolve_start;
        self.timing.proxy_resolve_end = proxy_resolve_end;
        self.timing.connect_timing = if self.timing.socket_reused {
            Default::default()
        } else {
            connect_timing
        };
        self.proxy_info = proxy_info;

        if self.is_forwarded_through_proxy() {
            let proxy = self.proxy_info.proxy_server();
            if self.proxy_auth.as_ref().map_or(true, |(p, _)| p != proxy) {
                let cache: Arc<dyn CredentialStore> =
                    Arc::clone(self.session.auth_cache()) as Arc<dyn CredentialStore>;
                self.proxy_auth = Some((proxy.clone(), Arc::new(AuthController::for_proxy(proxy, cache))));
            }
        }
        tracing::debug!(
            request = %self.request.id,
            proxy = %self.proxy_info.proxy_server(),
            reused = self.timing.socket_reused,
            protocol = ?stream.negotiated_protocol(),
            "Stream ready"
        );
        self.stream = Some(stream);
        self.state = State::InitStream;
    }

    fn on_stream_request_error(&mut self, e: StreamRequestError) -> Result<(), NetError> {
        match e {
            StreamRequestError::Failed(error) => {
                self.stream_request = None;
                self.handle_connect_error(error)
            }
            StreamRequestError::CertificateError { error, ssl_info } => {
                self.response.ssl_info = Some(ssl_info);
                self.awaiting = Some(Awaiting::CertificateError);
                Err(error)
            }
            StreamRequestError::ClientAuthRequested(info) => {
                self.response.cert_request_info = Some(info);
                self.awaiting = Some(Awaiting::ClientCertificate);
                Err(NetError::SslClientAuthCertNeeded)
            }
            StreamRequestError::ProxyAuthRequested { response, controller } => {
                self.on_tunnel_auth_challenge(response, controller)
            }
            StreamRequestError::HttpsProxyTunnelResponse(response) => {
                self.stream_request = None;
                self.response = response;
                self.response.was_fetched_via_proxy = true;
                Err(NetError::HttpsProxyTunnelResponse)
            }
        }
    }

    fn handle_connect_error(&mut self, error: NetError) -> Result<(), NetError> {
        if !self.request.is_https()
            || !(error.is_ssl_fallback_candidate() || error == NetError::SslInappropriateFallback)
        {
            return Err(error);
        }
        match self.fallback.on_handshake_error(&mut self.server_ssl, &error) {
            FallbackAction::Retry(version) => {
                tracing::info!(
                    url = %self.request.url,
                    error = %error,
                    version_max = %version,
                    "TLS handshake failed, retrying with a lower version"
                );
                metrics::record_restart("ssl_fallback");
                self.timing.restart();
                self.state = State::CreateStream;
                Ok(())
            }
            FallbackAction::Fail(error) => Err(error),
        }
    }

    fn on_tunnel_auth_challenge(
        &mut self,
        response: HttpResponseInfo,
        controller: Arc<AuthController>,
    ) -> Result<(), NetError> {
        if controller.have_auth() && self.auth_restarts < self.session.config().retry.max_auth_restarts {
            self.auth_restarts += 1;
            self.used_proxy_auth = true;
            controller.reset_auth(None);
            metrics::record_restart("tunnel_auth");
            tracing::debug!(proxy = %controller.origin(), "Restarting tunnel with known proxy credentials");
            self.stream_step = StreamStep::RestartTunnel;
            self.state = State::CreateStream;
            return Ok(());
        }

        self.response = response;
        self.response.was_fetched_via_proxy = true;
        self.response.auth_challenge = controller.auth_info();
        if self.response.auth_challenge.is_none() {
            self.stream_request = None;
            return Err(NetError::ProxyAuthRequested);
        }
        self.awaiting = Some(Awaiting::TunnelAuth(controller));
        self.state = State::Done;
        self.progress.state.set(LoadState::Idle);
        Ok(())
    }

    fn do_init_stream(&mut self) -> Result<(), NetError> {
        debug_assert!(self.stream.is_some());
        self.state = State::GenerateProxyAuthToken;
        Ok(())
    }

    fn do_generate_proxy_auth_token(&mut self) -> Result<(), NetError> {
        self.proxy_auth_header = match self.forwarding_proxy_auth() {
            Some(controller) => controller.auth_header()?,
            None => None,
        };
        self.state = State::GenerateServerAuthToken;
        Ok(())
    }

    fn do_generate_server_auth_token(&mut self) -> Result<(), NetError> {
        self.server_auth_header = self.server_auth.auth_header()?;
        self.state = State::InitRequestBody;
        Ok(())
    }

    fn do_init_request_body(&mut self) -> Result<(), NetError> {
        self.upload_length = match &self.request.body {
            Some(body) => Some(body.len() as u64),
            None if matches!(self.request.method, Method::POST | Method::PUT) => Some(0),
            None => None,
        };
        self.state = State::BuildRequest;
        Ok(())
    }

    fn do_build_request(&mut self) -> Result<(), NetError> {
        let mut headers = HeaderMap::new();
        let host = HeaderValue::from_str(&self.request.host_header())
            .map_err(|_| NetError::InvalidUrl(self.request.url.to_string()))?;
        headers.insert(HOST, host);
        let keep_alive = HeaderValue::from_static("keep-alive");
        if self.is_forwarded_through_proxy() {
            headers.insert(PROXY_CONNECTION, keep_alive);
        } else {
            headers.insert(CONNECTION, keep_alive);
        }
        let user_agent = &self.session.config().http.user_agent;
        if !user_agent.is_empty() {
            if let Ok(value) = HeaderValue::from_str(user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }
        if let Some(length) = self.upload_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
        }
        // Caller headers replace the defaults above.
        headers.extend(self.request.headers.clone());

        if let Some((name, value)) = self.proxy_auth_header.clone() {
            headers.insert(name, value);
            self.used_proxy_auth = true;
        }
        if let Some((name, value)) = self.server_auth_header.clone() {
            headers.insert(name, value);
            self.used_server_auth = true;
        }
        self.request_headers = headers;
        self.state = State::SendRequest;
        Ok(())
    }

    async fn do_send_request(&mut self) -> Result<(), NetError> {
        self.progress.state.set(LoadState::SendingRequest);
        self.timing.send_start = Some(Instant::now());
        let Some(stream) = self.stream.as_mut() else {
            unreachable!("sending without a stream");
        };
        match stream.send_request(&self.request, &self.request_headers).await {
            Ok(()) => {
                self.timing.send_end = Some(Instant::now());
                self.state = State::ReadHeaders;
                Ok(())
            }
            Err(e) => self.handle_io_error(e),
        }
    }

    async fn do_read_headers(&mut self) -> Result<(), NetError> {
        self.progress.state.set(LoadState::WaitingForResponse);
        let Some(stream) = self.stream.as_mut() else {
            unreachable!("reading headers without a stream");
        };
        let response = match stream.read_response_headers(&self.request.method).await {
            Ok(response) => response,
            Err(e) => return self.handle_io_error(e),
        };
        let reused = stream.is_connection_reused();

        if response.is_informational() {
            tracing::trace!(status = response.status, "Skipping informational response");
            self.headers_received = true;
            return Ok(());
        }
        if self
            .resend
            .should_resend_after_status(response.status, reused, self.resent)
        {
            return self.resend_on_new_connection("request_timeout");
        }
        self.headers_received = true;
        self.timing.receive_headers_end = Some(Instant::now());
        self.on_final_headers(response)
    }

    fn on_final_headers(&mut self, mut response: HttpResponseInfo) -> Result<(), NetError> {
        response.was_fetched_via_proxy = !self.proxy_info.is_direct();
        response.proxy_server = self.proxy_info.proxy_server().clone();
        if self.request.is_https() {
            if let (Some(value), Ok(origin)) = (response.header_str(ALT_SVC), HostPortPair::from_url(&self.request.url)) {
                self.session.alternate_services().process_header(&origin, value);
            }
        }
        let status = response.status;
        tracing::debug!(
            request = %self.request.id,
            status,
            reused = response.connection_reused,
            via_proxy = response.was_fetched_via_proxy,
            "Response headers received"
        );
        self.response = response;

        match status {
            407 if !self.is_forwarded_through_proxy() => Err(NetError::UnexpectedProxyAuth),
            401 | 407 => self.handle_auth_challenge(status == 407),
            _ => {
                self.begin_body();
                Ok(())
            }
        }
    }

    fn handle_auth_challenge(&mut self, from_proxy: bool) -> Result<(), NetError> {
        let controller = if from_proxy {
            match self.forwarding_proxy_auth() {
                Some(controller) => controller,
                None => return Err(NetError::UnexpectedProxyAuth),
            }
        } else {
            Arc::clone(&self.server_auth)
        };
        controller.handle_auth_challenge(&self.response.headers);

        if controller.have_auth() && self.auth_restarts < self.session.config().retry.max_auth_restarts {
            self.auth_restarts += 1;
            controller.reset_auth(None);
            metrics::record_restart("auth");
            tracing::debug!(
                challenger = %controller.origin(),
                status = self.response.status,
                "Answering auth challenge with known credentials"
            );
            self.state = State::DrainBodyForAuthRestart;
            return Ok(());
        }

        self.response.auth_challenge = controller.auth_info();
        if self.response.auth_challenge.is_some() {
            self.awaiting = Some(if from_proxy {
                Awaiting::ProxyAuth
            } else {
                Awaiting::ServerAuth
            });
        }
        self.begin_body();
        Ok(())
    }

    /// The caller reads the body next; an already complete body frees the
    /// connection at once.
    fn begin_body(&mut self) {
        self.state = State::ReadBody;
        self.progress.state.set(LoadState::ReadingResponse);
        if self.stream.as_ref().is_some_and(|s| s.is_response_body_complete()) {
            self.finish_stream();
        }
    }

    fn prepare_auth_restart(&mut self) {
        self.state = if self.stream.is_some() {
            State::DrainBodyForAuthRestart
        } else {
            self.reset_for_new_attempt();
            State::CreateStream
        };
    }

    async fn do_drain_body_for_auth_restart(&mut self) -> Result<(), NetError> {
        let Some(mut stream) = self.stream.take() else {
            self.reset_for_new_attempt();
            self.state = State::CreateStream;
            return Ok(());
        };
        let limit = self.session.config().http.max_drain_body_bytes;
        let drained = match stream.drain_body(limit).await {
            Ok(drained) => drained,
            Err(e) => {
                tracing::debug!(error = %e, "Draining for auth restart failed, reconnecting");
                false
            }
        };
        self.earlier_received_bytes += stream.received_bytes();
        self.reset_for_new_attempt();

        let renewed = if drained { stream.renew_for_auth() } else { None };
        match renewed {
            Some(stream) => {
                tracing::trace!(request = %self.request.id, "Auth restart on the same connection");
                self.timing.socket_reused = true;
                self.stream = Some(stream);
                self.state = State::InitStream;
            }
            None => self.state = State::CreateStream,
        }
        Ok(())
    }

    fn handle_io_error(&mut self, error: NetError) -> Result<(), NetError> {
        let reused = self.stream.as_ref().is_some_and(|s| s.is_connection_reused());
        if self
            .resend
            .should_resend_after_error(&error, reused, self.headers_received, self.resent)
        {
            return self.resend_on_new_connection(error.label());
        }
        Err(error)
    }

    fn resend_on_new_connection(&mut self, reason: &'static str) -> Result<(), NetError> {
        tracing::debug!(request = %self.request.id, url = %self.request.url, reason, "Resending on a new connection");
        metrics::record_restart("resend");
        self.resent = true;
        self.new_connection_needed = true;
        if let Some(stream) = self.stream.take() {
            self.earlier_received_bytes += stream.received_bytes();
        }
        self.reset_for_new_attempt();
        self.state = State::CreateStream;
        Ok(())
    }

    fn reset_for_new_attempt(&mut self) {
        self.headers_received = false;
        self.response = HttpResponseInfo::default();
        self.request_headers.clear();
        self.timing.restart();
    }

    fn finish_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.earlier_received_bytes += stream.received_bytes();
            stream.close();
        }
        self.state = State::Done;
        self.progress.state.set(LoadState::Idle);
    }

    /// Plain HTTP through an HTTP-like proxy: the proxy sees the request
    /// itself rather than a tunnel.
    fn is_forwarded_through_proxy(&self) -> bool {
        self.proxy_info.is_http_like() && !self.request.is_https()
    }

    fn forwarding_proxy_auth(&self) -> Option<Arc<AuthController>> {
        if !self.is_forwarded_through_proxy() {
            return None;
        }
        self.proxy_auth.as_ref().map(|(_, c)| Arc::clone(c))
    }
}

impl std::fmt::Debug for HttpNetworkTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkTransaction")
            .field("request", &self.request.id)
            .field("url", &self.request.url.as_str())
            .field("state", &self.state)
            .field("awaiting", &self.awaiting)
            .finish_non_exhaustive()
    }
}
