//! Proxy servers and the per-request proxy decision.

use std::fmt;

use serde::Serialize;

use crate::net::address::HostPortPair;

/// How a proxy is spoken to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ProxyScheme {
    Direct,
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyScheme {
    pub fn default_port(&self) -> u16 {
        match self {
            ProxyScheme::Direct => 0,
            ProxyScheme::Http => 80,
            ProxyScheme::Https => 443,
            ProxyScheme::Socks4 | ProxyScheme::Socks5 => 1080,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Direct => "direct",
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
            ProxyScheme::Socks4 => "socks4",
            ProxyScheme::Socks5 => "socks5",
        }
    }
}

/// One proxy (or the absence of one).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProxyServer {
    scheme: ProxyScheme,
    host_port: Option<HostPortPair>,
}

impl ProxyServer {
    pub fn direct() -> Self {
        Self {
            scheme: ProxyScheme::Direct,
            host_port: None,
        }
    }

    /// A proxy of `scheme` at `host_port`. `Direct` ignores the address.
    pub fn new(scheme: ProxyScheme, host_port: HostPortPair) -> Self {
        if scheme == ProxyScheme::Direct {
            return Self::direct();
        }
        Self {
            scheme,
            host_port: Some(host_port),
        }
    }

    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// The proxy's own address; `None` for direct.
    pub fn host_port(&self) -> Option<&HostPortPair> {
        self.host_port.as_ref()
    }

    pub fn is_direct(&self) -> bool {
        self.scheme == ProxyScheme::Direct
    }

    /// HTTP or HTTPS proxy (both speak HTTP to the proxy).
    pub fn is_http_like(&self) -> bool {
        matches!(self.scheme, ProxyScheme::Http | ProxyScheme::Https)
    }

    pub fn is_https(&self) -> bool {
        self.scheme == ProxyScheme::Https
    }

    pub fn is_socks(&self) -> bool {
        matches!(self.scheme, ProxyScheme::Socks4 | ProxyScheme::Socks5)
    }
}

impl fmt::Display for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host_port {
            None => f.write_str("DIRECT"),
            Some(hp) => write!(f, "{}://{}", self.scheme.as_str(), hp),
        }
    }
}

/// Ordered proxy fallback list resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    proxies: Vec<ProxyServer>,
    current: usize,
}

impl ProxyInfo {
    pub fn direct() -> Self {
        Self::from_list(vec![ProxyServer::direct()])
    }

    /// `proxies` in preference order; an empty list means direct.
    pub fn from_list(proxies: Vec<ProxyServer>) -> Self {
        let proxies = if proxies.is_empty() {
            vec![ProxyServer::direct()]
        } else {
            proxies
        };
        Self { proxies, current: 0 }
    }

    /// The proxy currently in use.
    pub fn proxy_server(&self) -> &ProxyServer {
        &self.proxies[self.current]
    }

    pub fn is_direct(&self) -> bool {
        self.proxy_server().is_direct()
    }

    pub fn is_http_like(&self) -> bool {
        self.proxy_server().is_http_like()
    }

    pub fn is_https(&self) -> bool {
        self.proxy_server().is_https()
    }

    pub fn is_socks(&self) -> bool {
        self.proxy_server().is_socks()
    }

    /// Advance to the next proxy. Returns false when the list is exhausted.
    pub fn fallback(&mut self) -> bool {
        if self.current + 1 < self.proxies.len() {
            self.current += 1;
            true
        } else {
            false
        }
    }

    /// Proxies tried so far for this request, excluding the current one.
    pub fn tried(&self) -> &[ProxyServer] {
        &self.proxies[..self.current]
    }

    /// Move every proxy matching `is_bad` behind the good ones, keeping order.
    pub fn deprioritize(&mut self, is_bad: impl Fn(&ProxyServer) -> bool) {
        let (good, bad): (Vec<_>, Vec<_>) = self.proxies.drain(..).partition(|p| !is_bad(p));
        self.proxies = good.into_iter().chain(bad).collect();
        self.current = 0;
    }

    pub fn proxies(&self) -> &[ProxyServer] {
        &self.proxies
    }
}

impl fmt::Display for ProxyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, p) in self.proxies.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}", p)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(host: &str) -> ProxyServer {
        ProxyServer::new(ProxyScheme::Http, HostPortPair::new(host, 8080))
    }

    #[test]
    fn fallback_walks_the_list() {
        let mut info = ProxyInfo::from_list(vec![http("a"), http("b"), ProxyServer::direct()]);
        assert_eq!(info.proxy_server(), &http("a"));
        assert!(info.fallback());
        assert!(info.fallback());
        assert!(info.is_direct());
        assert_eq!(info.tried().len(), 2);
        assert!(!info.fallback());
    }

    #[test]
    fn deprioritize_keeps_relative_order() {
        let mut info = ProxyInfo::from_list(vec![http("a"), http("b"), http("c")]);
        info.deprioritize(|p| p == &http("a"));
        assert_eq!(info.proxies(), &[http("b"), http("c"), http("a")]);
    }

    #[test]
    fn display_forms() {
        assert_eq!(ProxyServer::direct().to_string(), "DIRECT");
        assert_eq!(http("p").to_string(), "http://p:8080");
        assert_eq!(ProxyInfo::from_list(vec![]).to_string(), "DIRECT");
    }
}
