//! Fixed proxy rules and bypass lists.
//!
//! Grammar: `[<url-scheme>=]<proxy-uri>[ <proxy-uri>...][;...]` where
//! `url-scheme` is `http`, `https` or `socks` (the fallback for any scheme
//! without its own entry) and `proxy-uri` is `[<proxy-scheme>://]host:port`
//! or `direct://`.

use std::net::IpAddr;

use thiserror::Error;
use url::Url;

use crate::net::address::HostPortPair;
use crate::proxy::server::{ProxyScheme, ProxyServer};

/// Reasons a rules string is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyRulesError {
    #[error("unknown proxy scheme '{0}'")]
    UnknownProxyScheme(String),
    #[error("unknown url scheme '{0}' in rule")]
    UnknownUrlScheme(String),
    #[error("malformed proxy '{0}'")]
    MalformedProxy(String),
}

/// Parsed proxy rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRules {
    /// Applies to every URL scheme without a dedicated list.
    all: Vec<ProxyServer>,
    http: Vec<ProxyServer>,
    https: Vec<ProxyServer>,
    /// `socks=` entry: used when no per-scheme list matches.
    fallback: Vec<ProxyServer>,
}

impl ProxyRules {
    pub fn parse(rules: &str) -> Result<Self, ProxyRulesError> {
        let mut parsed = ProxyRules::default();
        for entry in rules.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('=') {
                Some((scheme, list)) => {
                    let servers = parse_proxy_list(list, ProxyScheme::Http)?;
                    match scheme.trim().to_ascii_lowercase().as_str() {
                        "http" => parsed.http = servers,
                        "https" => parsed.https = servers,
                        "socks" => parsed.fallback = parse_proxy_list(list, ProxyScheme::Socks4)?,
                        other => return Err(ProxyRulesError::UnknownUrlScheme(other.to_string())),
                    }
                }
                None => parsed.all = parse_proxy_list(entry, ProxyScheme::Http)?,
            }
        }
        Ok(parsed)
    }

    /// No proxy configured at all.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.http.is_empty() && self.https.is_empty() && self.fallback.is_empty()
    }

    /// Proxies for `url`, most preferred first. Empty means direct.
    pub fn proxies_for(&self, url: &Url) -> Vec<ProxyServer> {
        let specific = match url.scheme() {
            "http" | "ws" => &self.http,
            "https" | "wss" => &self.https,
            _ => &self.all,
        };
        if !specific.is_empty() {
            return specific.clone();
        }
        if !self.all.is_empty() {
            return self.all.clone();
        }
        self.fallback.clone()
    }
}

fn parse_proxy_list(list: &str, default_scheme: ProxyScheme) -> Result<Vec<ProxyServer>, ProxyRulesError> {
    list.split_whitespace()
        .map(|uri| parse_proxy_uri(uri, default_scheme))
        .collect()
}

fn parse_proxy_uri(uri: &str, default_scheme: ProxyScheme) -> Result<ProxyServer, ProxyRulesError> {
    let (scheme, rest) = match uri.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = match scheme.to_ascii_lowercase().as_str() {
                "direct" => return Ok(ProxyServer::direct()),
                "http" => ProxyScheme::Http,
                "https" => ProxyScheme::Https,
                "socks" | "socks4" => ProxyScheme::Socks4,
                "socks5" => ProxyScheme::Socks5,
                other => return Err(ProxyRulesError::UnknownProxyScheme(other.to_string())),
            };
            (scheme, rest)
        }
        None => (default_scheme, uri),
    };
    let rest = rest.trim_end_matches('/');
    let host_port = HostPortPair::parse(rest)
        .or_else(|| {
            (!rest.is_empty() && !rest.contains(':'))
                .then(|| HostPortPair::new(rest, scheme.default_port()))
        })
        .ok_or_else(|| ProxyRulesError::MalformedProxy(uri.to_string()))?;
    Ok(ProxyServer::new(scheme, host_port))
}

/// Hosts that are reached directly even when rules name a proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassRules {
    entries: Vec<BypassEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BypassEntry {
    /// `<local>`: dotless names and loopback.
    Local,
    Suffix(String),
    Exact(String),
}

impl BypassRules {
    pub fn new(entries: &[String]) -> Self {
        let entries = entries
            .iter()
            .map(|e| e.trim().to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e == "<local>" {
                    BypassEntry::Local
                } else if let Some(suffix) = e.strip_prefix('*') {
                    BypassEntry::Suffix(suffix.to_string())
                } else if e.starts_with('.') {
                    BypassEntry::Suffix(e)
                } else {
                    BypassEntry::Exact(e)
                }
            })
            .collect();
        Self { entries }
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
        self.entries.iter().any(|entry| match entry {
            BypassEntry::Local => is_local(&host),
            BypassEntry::Suffix(suffix) => host.ends_with(suffix.as_str()) || format!(".{host}") == *suffix,
            BypassEntry::Exact(exact) => host == *exact,
        })
    }
}

fn is_local(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => ip.is_loopback(),
        Err(_) => !host.contains('.'),
    }
}
