//! Transport connect job: resolve, then connect, racing IPv4 against a slow
//! IPv6 attempt.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::connect_job::{ConnectJobFailure, ConnectTiming, ConnectedSocket};
use crate::error::NetError;
use crate::net::address::{AddressList, HostPortPair};
use crate::net::pacing::ConnectPacer;
use crate::net::resolver::HostResolver;
use crate::net::socket::{BoxedSocket, ClientSocketFactory, StreamSocket};
use crate::pool::{ConnectJobFactory, ConnectionGroupKey, LoadState, LoadStateCell, RequestPriority};

/// Where a transport job connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub destination: HostPortPair,
}

impl TransportParams {
    pub fn new(destination: HostPortPair) -> Self {
        Self { destination }
    }
}

/// Creates transport connect jobs.
pub struct TransportConnectJobFactory {
    resolver: Arc<dyn HostResolver>,
    sockets: Arc<dyn ClientSocketFactory>,
    pacer: Arc<ConnectPacer>,
    timeout: Duration,
    ipv6_fallback_delay: Duration,
}

impl TransportConnectJobFactory {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        sockets: Arc<dyn ClientSocketFactory>,
        pacer: Arc<ConnectPacer>,
        timeout: Duration,
        ipv6_fallback_delay: Duration,
    ) -> Self {
        Self {
            resolver,
            sockets,
            pacer,
            timeout,
            ipv6_fallback_delay,
        }
    }

    /// Try each address in order; the last failure is reported.
    async fn connect_any(&self, addrs: &AddressList) -> Result<BoxedSocket, NetError> {
        let mut last_error = NetError::AddressUnreachable;
        for addr in addrs.iter() {
            match self.sockets.connect(*addr).await {
                Ok(socket) => {
                    tracing::trace!(address = %addr, "Transport connected");
                    return Ok(socket);
                }
                Err(e) => {
                    tracing::trace!(address = %addr, error = %e, "Transport connect attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Connect to `addrs`, starting an IPv4-first attempt in parallel if an
    /// IPv6-first list has not connected within the fallback delay.
    ///
    /// The first success wins and the other attempt is dropped. If both
    /// fail, the primary attempt's error is reported.
    async fn connect_racing(&self, addrs: &AddressList) -> Result<BoxedSocket, NetError> {
        let primary = self.connect_any(addrs);
        if !addrs.is_mixed_ipv6_first() {
            return primary.await;
        }
        tokio::pin!(primary);
        tokio::select! {
            result = &mut primary => return result,
            _ = tokio::time::sleep(self.ipv6_fallback_delay) => {}
        }

        let fallback_addrs = addrs.rotated_to_ipv4();
        tracing::debug!(
            primary = ?addrs.first(),
            fallback = ?fallback_addrs.first(),
            "IPv6 connect slow, racing IPv4 fallback"
        );
        let fallback = self.connect_any(&fallback_addrs);
        tokio::pin!(fallback);
        tokio::select! {
            result = &mut primary => match result {
                Ok(socket) => Ok(socket),
                Err(primary_error) => fallback.await.map_err(|_| primary_error),
            },
            result = &mut fallback => match result {
                Ok(socket) => Ok(socket),
                Err(_) => primary.await,
            },
        }
    }
}

#[async_trait]
impl ConnectJobFactory for TransportConnectJobFactory {
    type Params = TransportParams;

    fn connection_timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(
        &self,
        key: &ConnectionGroupKey,
        params: &TransportParams,
        _priority: RequestPriority,
        load_state: &LoadStateCell,
    ) -> Result<ConnectedSocket, ConnectJobFailure> {
        let mut timing = ConnectTiming::default();

        load_state.set(LoadState::ResolvingHost);
        timing.dns_start = Some(Instant::now());
        let addrs = self.resolver.resolve(&params.destination).await?;
        timing.dns_end = Some(Instant::now());
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved(params.destination.host.clone()).into());
        }

        load_state.set(LoadState::Connecting);
        self.pacer.pace().await;
        timing.connect_start = Some(Instant::now());
        let socket = self.connect_racing(&addrs).await?;
        timing.connect_end = Some(Instant::now());

        tracing::debug!(
            group = %key,
            destination = %params.destination,
            peer = ?socket.peer_addr(),
            "Transport connect job complete"
        );
        Ok(ConnectedSocket::new(socket, timing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, SocketAddr};
    use std::sync::Mutex;

    use crate::net::resolver::RuleBasedResolver;
    use crate::pool::SocketType;
    use crate::proxy::ProxyServer;

    /// Connects after a per-address delay, or fails.
    #[derive(Default)]
    struct DelayedSockets {
        behaviour: HashMap<SocketAddr, (Duration, Option<NetError>)>,
        attempts: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl ClientSocketFactory for DelayedSockets {
        async fn connect(&self, addr: SocketAddr) -> Result<BoxedSocket, NetError> {
            self.attempts.lock().unwrap().push(addr);
            let (delay, error) = self.behaviour.get(&addr).cloned().unwrap_or_default();
            tokio::time::sleep(delay).await;
            match error {
                Some(e) => Err(e),
                None => {
                    let (a, _b) = tokio::io::duplex(8);
                    Ok(Box::new(a))
                }
            }
        }
    }

    fn v6() -> SocketAddr {
        "[2001:db8::1]:80".parse().unwrap()
    }

    fn v4() -> SocketAddr {
        "192.0.2.1:80".parse().unwrap()
    }

    fn factory(sockets: DelayedSockets) -> (TransportConnectJobFactory, Arc<DelayedSockets>) {
        let mut resolver = RuleBasedResolver::new(None);
        resolver.add_rule("dual.test", vec![v6().ip(), v4().ip()]);
        resolver.add_rule("v4.test", vec![IpAddr::from([192, 0, 2, 1])]);
        let sockets = Arc::new(sockets);
        let factory = TransportConnectJobFactory::new(
            Arc::new(resolver),
            sockets.clone(),
            Arc::new(ConnectPacer::default()),
            Duration::from_secs(60),
            Duration::from_millis(300),
        );
        (factory, sockets)
    }

    fn key(host: &str) -> ConnectionGroupKey {
        ConnectionGroupKey::new(HostPortPair::new(host, 80), SocketType::Plain, ProxyServer::direct())
    }

    async fn run(factory: &TransportConnectJobFactory, host: &str) -> Result<ConnectedSocket, ConnectJobFailure> {
        let params = TransportParams::new(HostPortPair::new(host, 80));
        factory
            .connect(&key(host), &params, RequestPriority::Low, &LoadStateCell::default())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn fast_ipv6_needs_no_fallback() {
        let mut sockets = DelayedSockets::default();
        sockets.behaviour.insert(v6(), (Duration::from_millis(50), None));
        let (factory, sockets) = factory(sockets);
        let connected = run(&factory, "dual.test").await.unwrap();
        assert_eq!(*sockets.attempts.lock().unwrap(), vec![v6()]);
        assert!(connected.timing.dns_end.is_some());
        assert!(connected.timing.connect_end >= connected.timing.connect_start);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_ipv6_loses_to_ipv4_fallback() {
        let mut sockets = DelayedSockets::default();
        sockets.behaviour.insert(v6(), (Duration::from_secs(10), None));
        sockets.behaviour.insert(v4(), (Duration::from_millis(20), None));
        let (factory, sockets) = factory(sockets);
        let start = Instant::now();
        run(&factory, "dual.test").await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(320));
        assert_eq!(*sockets.attempts.lock().unwrap(), vec![v6(), v4()]);
    }

    #[tokio::test(start_paused = true)]
    async fn both_families_failing_reports_primary_error() {
        let mut sockets = DelayedSockets::default();
        sockets
            .behaviour
            .insert(v6(), (Duration::from_secs(1), Some(NetError::AddressUnreachable)));
        sockets
            .behaviour
            .insert(v4(), (Duration::ZERO, Some(NetError::ConnectionRefused)));
        let (factory, _) = factory(sockets);
        let err = run(&factory, "dual.test").await.unwrap_err();
        // Primary tries v6 then v4, so its final error is the refused v4 connect.
        assert_eq!(err.error, NetError::ConnectionRefused);
    }

    #[tokio::test(start_paused = true)]
    async fn ipv4_only_list_connects_directly() {
        let (factory, sockets) = factory(DelayedSockets::default());
        run(&factory, "v4.test").await.unwrap();
        assert_eq!(sockets.attempts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn resolution_failure_surfaces() {
        let (factory, _) = factory(DelayedSockets::default());
        let err = run(&factory, "missing.test").await.unwrap_err();
        assert_eq!(err.error, NetError::NameNotResolved("missing.test".into()));
    }
}
