//! Host resolution collaborators.
//!
//! The engine only consumes `resolve(host, port) -> ordered address list`.
//! Cancellation is dropping the returned future.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::NetError;
use crate::net::address::{AddressList, HostPortPair};

/// Resolves a host name into an ordered list of endpoints.
#[async_trait]
pub trait HostResolver: Send + Sync + 'static {
    async fn resolve(&self, host: &HostPortPair) -> Result<AddressList, NetError>;
}

/// Resolver backed by the operating system (`getaddrinfo` via Tokio).
#[derive(Debug, Default, Clone)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &HostPortPair) -> Result<AddressList, NetError> {
        if let Some(ip) = host.ip_literal() {
            return Ok(AddressList::new(vec![SocketAddr::new(ip, host.port)]));
        }
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.host.as_str(), host.port))
            .await
            .map_err(|e| {
                tracing::debug!(host = %host, error = %e, "Resolution failed");
                NetError::NameNotResolved(host.host.clone())
            })?
            .collect();
        if addrs.is_empty() {
            return Err(NetError::NameNotResolved(host.host.clone()));
        }
        Ok(AddressList::new(addrs))
    }
}

/// Resolver with fixed host → address rules, deferring to a fallback
/// resolver for everything else.
///
/// Used for `--resolve` overrides and in tests.
#[derive(Clone)]
pub struct RuleBasedResolver {
    rules: HashMap<String, Vec<IpAddr>>,
    fallback: Option<Arc<dyn HostResolver>>,
}

impl RuleBasedResolver {
    pub fn new(fallback: Option<Arc<dyn HostResolver>>) -> Self {
        Self {
            rules: HashMap::new(),
            fallback,
        }
    }

    /// Map `host` to `addrs` (in order). An empty list makes the host fail.
    pub fn add_rule(&mut self, host: impl Into<String>, addrs: Vec<IpAddr>) -> &mut Self {
        self.rules.insert(host.into().to_ascii_lowercase(), addrs);
        self
    }
}

impl std::fmt::Debug for RuleBasedResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleBasedResolver")
            .field("rules", &self.rules)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

#[async_trait]
impl HostResolver for RuleBasedResolver {
    async fn resolve(&self, host: &HostPortPair) -> Result<AddressList, NetError> {
        if let Some(ip) = host.ip_literal() {
            return Ok(AddressList::new(vec![SocketAddr::new(ip, host.port)]));
        }
        match self.rules.get(&host.host.to_ascii_lowercase()) {
            Some(ips) if ips.is_empty() => Err(NetError::NameNotResolved(host.host.clone())),
            Some(ips) => Ok(AddressList::new(
                ips.iter().map(|ip| SocketAddr::new(*ip, host.port)).collect(),
            )),
            None => match &self.fallback {
                Some(fallback) => fallback.resolve(host).await,
                None => Err(NetError::NameNotResolved(host.host.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rules_resolve_in_order() {
        let mut resolver = RuleBasedResolver::new(None);
        resolver.add_rule(
            "Example.com",
            vec!["::1".parse().unwrap(), "127.0.0.1".parse().unwrap()],
        );
        let list = resolver
            .resolve(&HostPortPair::new("example.com", 80))
            .await
            .unwrap();
        assert_eq!(list.len(), 2);
        assert!(list.is_mixed_ipv6_first());
    }

    #[tokio::test]
    async fn unknown_host_without_fallback_fails() {
        let resolver = RuleBasedResolver::new(None);
        let err = resolver
            .resolve(&HostPortPair::new("nowhere.test", 80))
            .await
            .unwrap_err();
        assert_eq!(err, NetError::NameNotResolved("nowhere.test".into()));
    }

    #[tokio::test]
    async fn ip_literals_bypass_rules() {
        let resolver = SystemResolver;
        let list = resolver
            .resolve(&HostPortPair::new("127.0.0.1", 8080))
            .await
            .unwrap();
        assert_eq!(list.first(), Some(&"127.0.0.1:8080".parse().unwrap()));
    }
}
