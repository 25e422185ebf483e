//! Network session: the pool graph and the caches every request shares.
//!
//! # Responsibilities
//! - Build the layered socket pools and register each with its lower pools
//! - Own the proxy service, auth caches, alternative services and pacer
//! - Route a socket request to the pool matching its [`SocketParams`]
//! - Flush everything when the network changes
//!
//! # Data Flow
//! ```text
//! SocketParams::Ssl ─────────▶ ssl (3) ─┬─▶ transport (0)
//!                                       ├─▶ socks (1) ─────▶ transport (0)
//!                                       └─▶ http_proxy (2) ─┬─▶ transport (0)
//!                                                           └─▶ ssl_for_proxy (1) ─▶ transport (0)
//! SocketParams::HttpProxy ───▶ http_proxy (2)
//! SocketParams::Socks ───────▶ socks (1)
//! SocketParams::Transport ───▶ transport (0)
//! ```
//!
//! # Design Decisions
//! - The pool graph is fixed at construction; pools only ever hold `Arc`s to
//!   lower pools, so there are no reference cycles
//! - Idle sweepers hold weak references and are aborted when the session
//!   is dropped

use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tokio::task::{AbortHandle, JoinHandle};

use crate::auth::AuthCache;
use crate::config::EngineConfig;
use crate::connect_job::{
    HttpProxyConnectJobFactory, HttpProxyParams, SocksConnectJobFactory, SocksParams, SslConnectJobFactory,
    SslParams, TransportConnectJobFactory, TransportParams,
};
use crate::error::NetError;
use crate::http::multiplexed::MultiplexedSessionPool;
use crate::net::{
    ClientSocketFactory, ConnectPacer, HostResolver, NetworkChange, NetworkChangeNotifier, SslClientAuthCache,
    SystemResolver, TcpSocketFactory, TlsConnector,
};
use crate::pool::{
    ClientSocketHandle, ConnectionGroupKey, LoadState, RequestPriority, RequestSocketError, SocketPool,
};
use crate::proxy::rules::ProxyRulesError;
use crate::proxy::service::ProxyService;
use crate::stream_factory::alternate::AlternateServiceRegistry;

/// External collaborators a session is built from.
#[derive(Clone)]
pub struct SessionDeps {
    pub resolver: Arc<dyn HostResolver>,
    pub sockets: Arc<dyn ClientSocketFactory>,
    pub tls: Arc<dyn TlsConnector>,
    pub multiplexed: Option<Arc<dyn MultiplexedSessionPool>>,
}

impl SessionDeps {
    /// System resolver and plain TCP around the given TLS connector.
    pub fn system(tls: Arc<dyn TlsConnector>) -> Self {
        Self {
            resolver: Arc::new(SystemResolver),
            sockets: Arc::new(TcpSocketFactory),
            tls,
            multiplexed: None,
        }
    }
}

/// Parameters for one socket request; the variant picks the pool.
#[derive(Debug, Clone)]
pub enum SocketParams {
    Transport(TransportParams),
    Socks(SocksParams),
    HttpProxy(HttpProxyParams),
    Ssl(SslParams),
}

impl SocketParams {
    fn pool_name(&self) -> &'static str {
        match self {
            SocketParams::Transport(_) => "transport",
            SocketParams::Socks(_) => "socks",
            SocketParams::HttpProxy(_) => "http_proxy",
            SocketParams::Ssl(_) => "ssl",
        }
    }
}

struct Pools {
    transport: Arc<SocketPool<TransportConnectJobFactory>>,
    socks: Arc<SocketPool<SocksConnectJobFactory>>,
    ssl_for_proxy: Arc<SocketPool<SslConnectJobFactory>>,
    http_proxy: Arc<SocketPool<HttpProxyConnectJobFactory>>,
    ssl: Arc<SocketPool<SslConnectJobFactory>>,
}

impl Pools {
    fn build(config: &EngineConfig, deps: &SessionDeps, pacer: Arc<ConnectPacer>) -> Self {
        let timeouts = &config.timeouts;
        let transport = SocketPool::new(
            "transport",
            config.pool.clone(),
            0,
            TransportConnectJobFactory::new(
                Arc::clone(&deps.resolver),
                Arc::clone(&deps.sockets),
                pacer,
                timeouts.transport_connect(),
                timeouts.ipv6_fallback_delay(),
            ),
        );
        let socks = SocketPool::new(
            "socks",
            config.pool.clone(),
            1,
            SocksConnectJobFactory::new(
                Arc::clone(&transport),
                Arc::clone(&deps.resolver),
                timeouts.socks_connect(),
            ),
        );
        let ssl_for_proxy = SocketPool::new(
            "ssl_for_proxy",
            config.pool.clone(),
            1,
            SslConnectJobFactory::new(
                Arc::clone(&transport),
                None,
                None,
                Arc::clone(&deps.tls),
                timeouts.ssl_handshake(),
            ),
        );
        let http_proxy = SocketPool::new(
            "http_proxy",
            config.pool.clone(),
            2,
            HttpProxyConnectJobFactory::new(
                Arc::clone(&transport),
                Arc::clone(&ssl_for_proxy),
                deps.multiplexed.clone(),
                config.http.clone(),
                timeouts.http_proxy_connect(),
            ),
        );
        let ssl = SocketPool::new(
            "ssl",
            config.pool.clone(),
            3,
            SslConnectJobFactory::new(
                Arc::clone(&transport),
                Some(Arc::clone(&socks)),
                Some(Arc::clone(&http_proxy)),
                Arc::clone(&deps.tls),
                timeouts.ssl_handshake(),
            ),
        );

        transport.add_higher_layered_pool(&ssl);
        transport.add_higher_layered_pool(&http_proxy);
        transport.add_higher_layered_pool(&socks);
        transport.add_higher_layered_pool(&ssl_for_proxy);
        socks.add_higher_layered_pool(&ssl);
        ssl_for_proxy.add_higher_layered_pool(&http_proxy);
        http_proxy.add_higher_layered_pool(&ssl);

        Self {
            transport,
            socks,
            ssl_for_proxy,
            http_proxy,
            ssl,
        }
    }

    /// Highest layer first, so a lower flush never hands sockets to a
    /// higher job about to be cancelled.
    fn flush_with_error(&self, error: NetError) {
        self.ssl.flush_with_error(error.clone());
        self.http_proxy.flush_with_error(error.clone());
        self.ssl_for_proxy.flush_with_error(error.clone());
        self.socks.flush_with_error(error.clone());
        self.transport.flush_with_error(error);
    }

    fn close_idle_sockets(&self) -> usize {
        self.ssl.close_idle_sockets()
            + self.http_proxy.close_idle_sockets()
            + self.ssl_for_proxy.close_idle_sockets()
            + self.socks.close_idle_sockets()
            + self.transport.close_idle_sockets()
    }

    fn spawn_idle_sweepers(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.transport.spawn_idle_sweeper(),
            self.socks.spawn_idle_sweeper(),
            self.ssl_for_proxy.spawn_idle_sweeper(),
            self.http_proxy.spawn_idle_sweeper(),
            self.ssl.spawn_idle_sweeper(),
        ]
    }
}

/// State shared by every transaction of one network context.
pub struct HttpNetworkSession {
    config: EngineConfig,
    pools: Pools,
    proxy_service: ProxyService,
    auth_cache: Arc<AuthCache>,
    client_auth_cache: SslClientAuthCache,
    alternate_services: AlternateServiceRegistry,
    multiplexed: Option<Arc<dyn MultiplexedSessionPool>>,
    background: Vec<AbortHandle>,
}

impl HttpNetworkSession {
    /// Build the pool graph from `config`.
    ///
    /// Idle sweepers start only when called inside a tokio runtime.
    pub fn new(config: EngineConfig, deps: SessionDeps) -> Result<Arc<Self>, ProxyRulesError> {
        let proxy_service = ProxyService::new(&config.proxy)?;
        let pacer = Arc::new(ConnectPacer::new(config.timeouts.connect_pacing_interval()));
        let pools = Pools::build(&config, &deps, pacer);
        let background = if tokio::runtime::Handle::try_current().is_ok() {
            pools
                .spawn_idle_sweepers()
                .into_iter()
                .map(|task| task.abort_handle())
                .collect()
        } else {
            Vec::new()
        };
        tracing::info!(
            max_sockets_per_group = config.pool.max_sockets_per_group,
            max_sockets_per_pool = config.pool.max_sockets_per_pool,
            proxy_rules = %config.proxy.rules,
            multiplexed = deps.multiplexed.is_some(),
            "Network session created"
        );
        Ok(Arc::new(Self {
            config,
            pools,
            proxy_service,
            auth_cache: Arc::new(AuthCache::new()),
            client_auth_cache: SslClientAuthCache::new(),
            alternate_services: AlternateServiceRegistry::new(),
            multiplexed: deps.multiplexed,
            background,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn proxy_service(&self) -> &ProxyService {
        &self.proxy_service
    }

    pub fn auth_cache(&self) -> &Arc<AuthCache> {
        &self.auth_cache
    }

    pub fn client_auth_cache(&self) -> &SslClientAuthCache {
        &self.client_auth_cache
    }

    pub fn alternate_services(&self) -> &AlternateServiceRegistry {
        &self.alternate_services
    }

    pub fn multiplexed_sessions(&self) -> Option<&Arc<dyn MultiplexedSessionPool>> {
        self.multiplexed.as_ref()
    }

    pub fn transport_pool(&self) -> &Arc<SocketPool<TransportConnectJobFactory>> {
        &self.pools.transport
    }

    pub fn socks_pool(&self) -> &Arc<SocketPool<SocksConnectJobFactory>> {
        &self.pools.socks
    }

    pub fn http_proxy_pool(&self) -> &Arc<SocketPool<HttpProxyConnectJobFactory>> {
        &self.pools.http_proxy
    }

    pub fn ssl_pool(&self) -> &Arc<SocketPool<SslConnectJobFactory>> {
        &self.pools.ssl
    }

    /// Request a socket from the pool `params` belongs to.
    pub async fn request_socket(
        &self,
        key: &ConnectionGroupKey,
        params: SocketParams,
        priority: RequestPriority,
    ) -> Result<ClientSocketHandle, RequestSocketError> {
        tracing::trace!(group = %key, pool = params.pool_name(), ?priority, "Socket requested");
        match params {
            SocketParams::Transport(p) => self.pools.transport.request_socket(key, p, priority).await,
            SocketParams::Socks(p) => self.pools.socks.request_socket(key, p, priority).await,
            SocketParams::HttpProxy(p) => self.pools.http_proxy.request_socket(key, p, priority).await,
            SocketParams::Ssl(p) => self.pools.ssl.request_socket(key, p, priority).await,
        }
    }

    /// Request a socket over a new connection, passing over idle ones.
    pub async fn request_fresh_socket(
        &self,
        key: &ConnectionGroupKey,
        params: SocketParams,
        priority: RequestPriority,
    ) -> Result<ClientSocketHandle, RequestSocketError> {
        tracing::trace!(group = %key, pool = params.pool_name(), ?priority, "Fresh socket requested");
        match params {
            SocketParams::Transport(p) => self.pools.transport.request_fresh_socket(key, p, priority).await,
            SocketParams::Socks(p) => self.pools.socks.request_fresh_socket(key, p, priority).await,
            SocketParams::HttpProxy(p) => self.pools.http_proxy.request_fresh_socket(key, p, priority).await,
            SocketParams::Ssl(p) => self.pools.ssl.request_fresh_socket(key, p, priority).await,
        }
    }

    /// Warm `key` up to `num_sockets` sockets without a waiting request.
    pub fn preconnect(&self, key: &ConnectionGroupKey, params: SocketParams, num_sockets: usize) -> Result<(), NetError> {
        match params {
            SocketParams::Transport(p) => self.pools.transport.request_sockets(key, p, num_sockets),
            SocketParams::Socks(p) => self.pools.socks.request_sockets(key, p, num_sockets),
            SocketParams::HttpProxy(p) => self.pools.http_proxy.request_sockets(key, p, num_sockets),
            SocketParams::Ssl(p) => self.pools.ssl.request_sockets(key, p, num_sockets),
        }
    }

    /// Load state of `key` in the pool `params` belongs to.
    ///
    /// Lower layers are consulted when the top layer has nothing further
    /// along than waiting, since that is where a layered job actually is.
    pub fn load_state(&self, key: &ConnectionGroupKey, params: &SocketParams) -> LoadState {
        let top = match params {
            SocketParams::Transport(_) => return self.pools.transport.load_state(key),
            SocketParams::Socks(_) => self.pools.socks.load_state(key),
            SocketParams::HttpProxy(_) => self.pools.http_proxy.load_state(key),
            SocketParams::Ssl(_) => self.pools.ssl.load_state(key),
        };
        let lower = [
            self.pools.http_proxy.load_state(key),
            self.pools.ssl_for_proxy.load_state(key),
            self.pools.socks.load_state(key),
            self.pools.transport.load_state(key),
        ];
        lower.into_iter().fold(top, LoadState::max)
    }

    /// Drop every pooled connection: pending requests fail with
    /// `NetworkChanged`, sessions close and proxies get a clean slate.
    pub fn on_network_changed(&self) {
        tracing::info!("Network changed, flushing socket pools");
        self.pools.flush_with_error(NetError::NetworkChanged);
        if let Some(sessions) = &self.multiplexed {
            sessions.close_all(NetError::NetworkChanged);
        }
        self.proxy_service.clear_bad_proxies();
    }

    /// Follow `notifier` until the session is dropped.
    pub fn watch_network_changes(self: &Arc<Self>, notifier: &NetworkChangeNotifier) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut changes = notifier.subscribe();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(NetworkChange::IpAddressChanged) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "Network change notifications lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
                match weak.upgrade() {
                    Some(session) => session.on_network_changed(),
                    None => break,
                }
            }
        })
    }

    pub fn close_idle_connections(&self) -> usize {
        self.pools.close_idle_sockets()
    }

    /// Introspection across every pool plus the alternative services.
    pub fn pool_info(&self) -> Value {
        json!({
            "pools": [
                self.pools.transport.info_as_value(),
                self.pools.socks.info_as_value(),
                self.pools.ssl_for_proxy.info_as_value(),
                self.pools.http_proxy.info_as_value(),
                self.pools.ssl.info_as_value(),
            ],
            "alternate_services": self.alternate_services.info_as_value(),
            "cached_client_certs": self.client_auth_cache.len(),
        })
    }
}

impl Drop for HttpNetworkSession {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

impl std::fmt::Debug for HttpNetworkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpNetworkSession")
            .field("transport_sockets", &self.pools.transport.total_socket_count())
            .field("ssl_sockets", &self.pools.ssl.total_socket_count())
            .finish_non_exhaustive()
    }
}
