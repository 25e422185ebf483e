//! Stream factory: from a request to a request-ready stream.
//!
//! # Data Flow
//! ```text
//! HttpStreamFactory::request_stream
//!     → StreamRequest (request.rs)
//!         ├─ main job (job.rs)       proxy resolution → pool → stream
//!         └─ alternate job (job.rs)  only for https with a known
//!                                    alternative service (alternate.rs)
//! HttpStreamFactory::preconnect_streams
//!     → proxy resolution → params.rs → session preconnect
//! ```

pub mod alternate;
pub mod job;
pub(crate) mod params;
pub mod request;

use std::sync::Arc;

use tokio::sync::watch;

use crate::auth::{AuthController, CredentialStore};
use crate::error::NetError;
use crate::http::multiplexed::SessionKey;
use crate::http::request::HttpRequestInfo;
use crate::net::address::HostPortPair;
use crate::net::socket::NextProto;
use crate::net::tls::SslConfig;
use crate::pool::RequestPriority;
use crate::session::HttpNetworkSession;

pub use alternate::{AlternateServiceRegistry, AlternativeService};
pub use job::{JobKind, JobProgress, StreamReady, StreamRequestError, StreamRequestJob};
pub use request::StreamRequest;

use params::{socket_request, Route};

/// Creates stream requests against one session.
#[derive(Debug, Clone)]
pub struct HttpStreamFactory {
    session: Arc<HttpNetworkSession>,
}

impl HttpStreamFactory {
    pub fn new(session: Arc<HttpNetworkSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<HttpNetworkSession> {
        &self.session
    }

    /// Set up the jobs for `request`; nothing runs until
    /// [`StreamRequest::start`].
    pub fn request_stream(
        &self,
        request: &HttpRequestInfo,
        server_ssl: SslConfig,
        proxy_ssl: SslConfig,
        priority: RequestPriority,
    ) -> Result<StreamRequest, NetError> {
        let origin = HostPortPair::from_url(&request.url)?;
        let mut main = StreamRequestJob::new(
            Arc::clone(&self.session),
            request.clone(),
            JobKind::Main,
            server_ssl.clone(),
            proxy_ssl.clone(),
            priority,
        )?;

        let service = request
            .is_https()
            .then(|| self.session.alternate_services().get(&origin))
            .flatten()
            .filter(|s| s.endpoint != origin || s.protocol != NextProto::Http11);
        let alternate = match service {
            Some(service) => {
                let mut alternate = StreamRequestJob::new(
                    Arc::clone(&self.session),
                    request.clone(),
                    JobKind::Alternate(service),
                    server_ssl,
                    proxy_ssl,
                    priority,
                )?;
                let (tx, rx) = watch::channel(None);
                main.wait_for(rx);
                alternate.resume_sibling_with(tx, self.session.config().timeouts.alternate_job_head_start());
                Some(alternate)
            }
            None => None,
        };

        tracing::debug!(
            request = %request.id,
            url = %request.url,
            ?priority,
            alternate = alternate.is_some(),
            "Stream requested"
        );
        Ok(StreamRequest::new(Arc::clone(&self.session), origin, main, alternate))
    }

    /// Open up to `num_streams` connections for requests like `request`
    /// ahead of time.
    ///
    /// Nothing is opened when a multiplexed session already covers the
    /// destination, since one connection serves every stream.
    pub async fn preconnect_streams(
        &self,
        num_streams: usize,
        request: &HttpRequestInfo,
        server_ssl: &SslConfig,
        proxy_ssl: &SslConfig,
    ) -> Result<(), NetError> {
        let origin = HostPortPair::from_url(&request.url)?;
        let proxy_info = self.session.proxy_service().resolve_proxy(&request.url).await?;
        let proxy = proxy_info.proxy_server().clone();

        if let Some(sessions) = self.session.multiplexed_sessions() {
            let key = SessionKey::new(origin.clone(), proxy.clone(), request.privacy_mode);
            if sessions.find_available_session(&key).is_some() {
                tracing::debug!(session = %key, "Preconnect skipped, session exists");
                return Ok(());
            }
        }

        let proxy_auth = proxy.is_http_like().then(|| {
            let cache: Arc<dyn CredentialStore> = Arc::clone(self.session.auth_cache()) as Arc<dyn CredentialStore>;
            Arc::new(AuthController::for_proxy(&proxy, cache))
        });
        let (key, params) = socket_request(Route {
            origin: &origin,
            endpoint: &origin,
            is_https: request.is_https(),
            proxy: &proxy,
            server_ssl,
            proxy_ssl,
            privacy_mode: request.privacy_mode,
            proxy_auth,
        })?;
        tracing::debug!(group = %key, num_streams, "Preconnecting");
        self.session.preconnect(&key, params, num_streams)
    }
}
