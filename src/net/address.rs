//! Destinations and resolved address lists.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::NetError;

/// A host and port, unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostPortPair {
    pub host: String,
    pub port: u16,
}

impl HostPortPair {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Destination of `url`, using the scheme's default port when absent.
    pub fn from_url(url: &Url) -> Result<Self, NetError> {
        let host = url
            .host_str()
            .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| NetError::InvalidUrl(url.to_string()))?;
        // url keeps IPv6 literals bracketed; the bare form is canonical here.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok(Self::new(host, port))
    }

    /// Parse `host:port` (IPv6 literals must be bracketed).
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            (host, tail.strip_prefix(':')?)
        } else {
            s.rsplit_once(':')?
        };
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self::new(host, port))
    }

    /// The host parsed as an IP literal, if it is one.
    pub fn ip_literal(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }

    /// `host:port` as it appears in a CONNECT request line or Host header.
    pub fn to_authority(&self) -> String {
        match self.ip_literal() {
            Some(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

impl fmt::Display for HostPortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_authority())
    }
}

/// An ordered list of resolved endpoints for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressList {
    addrs: Vec<SocketAddr>,
}

impl AddressList {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self { addrs }
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SocketAddr> {
        self.addrs.iter()
    }

    pub fn first(&self) -> Option<&SocketAddr> {
        self.addrs.first()
    }

    /// Whether the first address is IPv6 and an IPv4 address follows it.
    ///
    /// Only such lists are eligible for the IPv4 fallback race.
    pub fn is_mixed_ipv6_first(&self) -> bool {
        matches!(self.addrs.first(), Some(SocketAddr::V6(_)))
            && self.addrs.iter().any(SocketAddr::is_ipv4)
    }

    /// A copy rotated so that it starts with the first IPv4 address.
    ///
    /// Relative order is kept; addresses before the first IPv4 entry move to
    /// the end.
    pub fn rotated_to_ipv4(&self) -> AddressList {
        match self.addrs.iter().position(SocketAddr::is_ipv4) {
            Some(pos) => {
                let mut addrs = self.addrs.clone();
                addrs.rotate_left(pos);
                AddressList::new(addrs)
            }
            None => self.clone(),
        }
    }
}

impl From<Vec<SocketAddr>> for AddressList {
    fn from(addrs: Vec<SocketAddr>) -> Self {
        Self::new(addrs)
    }
}
