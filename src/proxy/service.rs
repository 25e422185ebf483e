//! Proxy resolution and the bad-proxy retry list.
//!
//! # Responsibilities
//! - Resolve the ordered proxy list for a URL from swappable fixed rules
//! - Remember proxies that failed and deprioritise them for a while
//! - Decide whether a failure should move a request to its next proxy

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::time::Instant;
use url::Url;

use crate::config::ProxySettings;
use crate::error::NetError;
use crate::proxy::rules::{BypassRules, ProxyRules, ProxyRulesError};
use crate::proxy::server::{ProxyInfo, ProxyServer};

#[derive(Debug)]
struct ResolvedConfig {
    rules: ProxyRules,
    bypass: BypassRules,
}

/// Resolves proxies for requests.
#[derive(Debug)]
pub struct ProxyService {
    config: ArcSwap<ResolvedConfig>,
    /// Proxy → time after which it may be preferred again.
    bad_proxies: DashMap<ProxyServer, Instant>,
    bad_proxy_retry: Duration,
}

impl ProxyService {
    pub fn new(settings: &ProxySettings) -> Result<Self, ProxyRulesError> {
        Ok(Self {
            config: ArcSwap::from_pointee(Self::resolve_settings(settings)?),
            bad_proxies: DashMap::new(),
            bad_proxy_retry: settings.bad_proxy_retry(),
        })
    }

    /// Service that always answers direct.
    pub fn direct() -> Self {
        Self {
            config: ArcSwap::from_pointee(ResolvedConfig {
                rules: ProxyRules::default(),
                bypass: BypassRules::default(),
            }),
            bad_proxies: DashMap::new(),
            bad_proxy_retry: ProxySettings::default().bad_proxy_retry(),
        }
    }

    fn resolve_settings(settings: &ProxySettings) -> Result<ResolvedConfig, ProxyRulesError> {
        Ok(ResolvedConfig {
            rules: ProxyRules::parse(&settings.rules)?,
            bypass: BypassRules::new(&settings.bypass),
        })
    }

    /// Replace the active rules. Requests already resolved keep their list.
    pub fn set_config(&self, settings: &ProxySettings) -> Result<(), ProxyRulesError> {
        let resolved = Self::resolve_settings(settings)?;
        self.config.store(Arc::new(resolved));
        tracing::info!(rules = %settings.rules, "Proxy configuration replaced");
        Ok(())
    }

    /// Proxy list for `url`, with currently-bad proxies moved to the end.
    pub async fn resolve_proxy(&self, url: &Url) -> Result<ProxyInfo, NetError> {
        let config = self.config.load();
        let host = url
            .host_str()
            .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
        if config.rules.is_empty() || config.bypass.matches(host) {
            return Ok(ProxyInfo::direct());
        }
        let mut info = ProxyInfo::from_list(config.rules.proxies_for(url));
        self.expire_bad_proxies();
        if !self.bad_proxies.is_empty() {
            info.deprioritize(|p| self.bad_proxies.contains_key(p));
        }
        tracing::debug!(url = %url, proxies = %info, "Proxy resolved");
        Ok(info)
    }

    /// After `error` on the current proxy, mark it bad and advance `info`.
    ///
    /// Returns the error to surface when no retry should happen, or `None`
    /// when `info` now points at another proxy to try.
    pub fn reconsider_proxy_after_error(&self, info: &mut ProxyInfo, error: &NetError) -> Option<NetError> {
        if info.is_direct() {
            return Some(error.clone());
        }
        let retryable = error.is_proxy_connection_error()
            || (info.is_https() && error.is_certificate_error())
            || (info.is_https() && *error == NetError::SslProtocolError);
        if !retryable {
            if *error == NetError::SocksConnectionHostUnreachable {
                return Some(NetError::AddressUnreachable);
            }
            return Some(error.clone());
        }
        let failed = info.proxy_server().clone();
        self.mark_bad(&failed);
        if info.fallback() {
            tracing::info!(failed = %failed, next = %info.proxy_server(), error = %error, "Falling back to next proxy");
            None
        } else {
            Some(error.clone())
        }
    }

    pub fn mark_bad(&self, proxy: &ProxyServer) {
        if proxy.is_direct() {
            return;
        }
        self.bad_proxies
            .insert(proxy.clone(), Instant::now() + self.bad_proxy_retry);
    }

    pub fn is_bad(&self, proxy: &ProxyServer) -> bool {
        self.bad_proxies
            .get(proxy)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    /// Forget every failure (e.g. after a network change).
    pub fn clear_bad_proxies(&self) {
        self.bad_proxies.clear();
    }

    fn expire_bad_proxies(&self) {
        let now = Instant::now();
        self.bad_proxies.retain(|_, until| *until > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::address::HostPortPair;
    use crate::proxy::server::ProxyScheme;

    fn settings(rules: &str) -> ProxySettings {
        ProxySettings {
            rules: rules.into(),
            bypass: vec!["<local>".into()],
            bad_proxy_retry_secs: 60,
        }
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn bypass_resolves_direct() {
        let service = ProxyService::new(&settings("p1:80")).unwrap();
        assert!(service.resolve_proxy(&url("http://localhost/")).await.unwrap().is_direct());
        assert!(!service.resolve_proxy(&url("http://example.com/")).await.unwrap().is_direct());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_proxy_is_deprioritised_until_retry() {
        let service = ProxyService::new(&settings("p1:80 p2:80")).unwrap();
        let mut info = service.resolve_proxy(&url("http://example.com/")).await.unwrap();
        assert!(service
            .reconsider_proxy_after_error(&mut info, &NetError::ProxyConnectionFailed)
            .is_none());
        assert_eq!(info.proxy_server().host_port(), Some(&HostPortPair::new("p2", 80)));

        let info = service.resolve_proxy(&url("http://example.com/")).await.unwrap();
        assert_eq!(info.proxy_server().host_port(), Some(&HostPortPair::new("p2", 80)));

        tokio::time::advance(Duration::from_secs(61)).await;
        let info = service.resolve_proxy(&url("http://example.com/")).await.unwrap();
        assert_eq!(info.proxy_server().host_port(), Some(&HostPortPair::new("p1", 80)));
    }

    #[tokio::test]
    async fn non_proxy_errors_are_surfaced() {
        let service = ProxyService::new(&settings("p1:80 p2:80")).unwrap();
        let mut info = service.resolve_proxy(&url("http://example.com/")).await.unwrap();
        assert_eq!(
            service.reconsider_proxy_after_error(&mut info, &NetError::CertDateInvalid),
            Some(NetError::CertDateInvalid)
        );
        assert_eq!(
            service.reconsider_proxy_after_error(&mut info, &NetError::SocksConnectionHostUnreachable),
            Some(NetError::AddressUnreachable)
        );
        assert!(!service.is_bad(info.proxy_server()));
    }

    #[tokio::test]
    async fn last_proxy_failure_is_surfaced() {
        let service = ProxyService::new(&settings("socks5://s:1080")).unwrap();
        let mut info = service.resolve_proxy(&url("https://example.com/")).await.unwrap();
        assert_eq!(info.proxy_server().scheme(), ProxyScheme::Socks5);
        assert_eq!(
            service.reconsider_proxy_after_error(&mut info, &NetError::SocksConnectionFailed),
            Some(NetError::SocksConnectionFailed)
        );
        assert!(service.is_bad(info.proxy_server()));
    }

    #[tokio::test]
    async fn config_swap_takes_effect() {
        let service = ProxyService::direct();
        assert!(service.resolve_proxy(&url("http://example.com/")).await.unwrap().is_direct());
        service.set_config(&settings("p1:80")).unwrap();
        assert!(!service.resolve_proxy(&url("http://example.com/")).await.unwrap().is_direct());
        assert!(service.set_config(&settings("ftp://x:1")).is_err());
    }
}
