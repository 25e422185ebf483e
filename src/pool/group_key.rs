//! Connection group keys.
//!
//! A group is the reuse-equivalence class of pooled sockets. The same key
//! is used at every pool layer a request passes through, so a tunnel socket
//! idling in the proxy pool can only ever be picked up by a TLS connect for
//! the same destination.

use std::fmt;

use serde::Serialize;

use crate::net::address::HostPortPair;
use crate::net::tls::TlsVersion;
use crate::proxy::server::ProxyServer;

/// Whether the group's sockets end in a TLS session to the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SocketType {
    Plain,
    Ssl,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionGroupKey {
    destination: HostPortPair,
    socket_type: SocketType,
    privacy_mode: bool,
    proxy: ProxyServer,
    /// Lowered TLS ceiling after version fallback; `None` when not falling back.
    ssl_version_max: Option<TlsVersion>,
}

impl ConnectionGroupKey {
    pub fn new(destination: HostPortPair, socket_type: SocketType, proxy: ProxyServer) -> Self {
        Self {
            destination,
            socket_type,
            privacy_mode: false,
            proxy,
            ssl_version_max: None,
        }
    }

    pub fn with_privacy_mode(mut self, enabled: bool) -> Self {
        self.privacy_mode = enabled;
        self
    }

    pub fn with_ssl_fallback(mut self, version_max: Option<TlsVersion>) -> Self {
        self.ssl_version_max = version_max;
        self
    }

    pub fn destination(&self) -> &HostPortPair {
        &self.destination
    }

    pub fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub fn privacy_mode(&self) -> bool {
        self.privacy_mode
    }

    pub fn proxy(&self) -> &ProxyServer {
        &self.proxy
    }

    pub fn ssl_version_max(&self) -> Option<TlsVersion> {
        self.ssl_version_max
    }
}

impl fmt::Display for ConnectionGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privacy_mode {
            f.write_str("pm/")?;
        }
        if self.socket_type == SocketType::Ssl {
            f.write_str("ssl/")?;
        }
        if let Some(v) = self.ssl_version_max {
            write!(f, "max={}/", v)?;
        }
        write!(f, "{}", self.destination)?;
        if !self.proxy.is_direct() {
            write!(f, " via {}", self.proxy)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::server::ProxyScheme;

    fn key() -> ConnectionGroupKey {
        ConnectionGroupKey::new(
            HostPortPair::new("example.com", 443),
            SocketType::Ssl,
            ProxyServer::direct(),
        )
    }

    #[test]
    fn behaviourally_distinct_configurations_get_distinct_keys() {
        let base = key();
        assert_ne!(base, key().with_privacy_mode(true));
        assert_ne!(base, key().with_ssl_fallback(Some(TlsVersion::Tls1_2)));
        let proxied = ConnectionGroupKey::new(
            HostPortPair::new("example.com", 443),
            SocketType::Ssl,
            ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy", 3128)),
        );
        assert_ne!(base, proxied);
        assert_eq!(base, key());
    }

    #[test]
    fn display_form() {
        assert_eq!(key().to_string(), "ssl/example.com:443");
        assert_eq!(
            key()
                .with_privacy_mode(true)
                .with_ssl_fallback(Some(TlsVersion::Tls1_1))
                .to_string(),
            "pm/ssl/max=tls1.1/example.com:443"
        );
    }
}
