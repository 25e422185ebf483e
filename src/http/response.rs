//! Response metadata handed back to the caller.
//!
//! # Responsibilities
//! - Hold the parsed status line and headers of the final response
//! - Record how the response was obtained (proxy, reuse, protocol, TLS)
//! - Answer keep-alive and auth-challenge questions about the headers

use std::net::SocketAddr;

use http::header::{HeaderMap, CONNECTION};
use http::Version;

use crate::auth::AuthChallengeInfo;
use crate::net::socket::NextProto;
use crate::net::tls::{CertRequestInfo, SslInfo};
use crate::proxy::server::ProxyServer;

/// Parsed response head plus connection facts.
#[derive(Debug, Clone)]
pub struct HttpResponseInfo {
    pub status: u16,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub was_fetched_via_proxy: bool,
    pub proxy_server: ProxyServer,
    /// The response arrived on a socket that had carried an earlier request.
    pub connection_reused: bool,
    pub negotiated_protocol: NextProto,
    pub ssl_info: Option<SslInfo>,
    /// Set when the caller must supply credentials to continue.
    pub auth_challenge: Option<AuthChallengeInfo>,
    /// Set when the caller must pick a client certificate to continue.
    pub cert_request_info: Option<CertRequestInfo>,
    pub remote_endpoint: Option<SocketAddr>,
}

impl Default for HttpResponseInfo {
    fn default() -> Self {
        Self {
            status: 0,
            reason: String::new(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            was_fetched_via_proxy: false,
            proxy_server: ProxyServer::direct(),
            connection_reused: false,
            negotiated_protocol: NextProto::Http11,
            ssl_info: None,
            auth_challenge: None,
            cert_request_info: None,
            remote_endpoint: None,
        }
    }
}

impl HttpResponseInfo {
    /// Whether the connection may carry another request after this response.
    ///
    /// HTTP/1.1 persists unless told otherwise; HTTP/1.0 only when asked.
    /// `Proxy-Connection` is honoured as a synonym of `Connection`.
    pub fn is_keep_alive(&self) -> bool {
        let tokens = self
            .headers
            .get_all(CONNECTION)
            .iter()
            .chain(self.headers.get_all("proxy-connection").iter())
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .collect::<Vec<_>>();
        if tokens.iter().any(|t| t == "close") {
            return false;
        }
        match self.version {
            Version::HTTP_10 | Version::HTTP_09 => tokens.iter().any(|t| t == "keep-alive"),
            _ => true,
        }
    }

    /// 1xx other than `101 Switching Protocols`.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// `HTTP/1.1 200 OK` style status line.
    pub fn status_line(&self) -> String {
        format!("{:?} {} {}", self.version, self.status, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(version: Version, headers: &[(&'static str, &'static str)]) -> HttpResponseInfo {
        let mut info = HttpResponseInfo {
            status: 200,
            version,
            ..Default::default()
        };
        for (name, value) in headers {
            info.headers.append(*name, value.parse().unwrap());
        }
        info
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        assert!(response(Version::HTTP_11, &[]).is_keep_alive());
        assert!(!response(Version::HTTP_11, &[("connection", "Close")]).is_keep_alive());
        assert!(!response(Version::HTTP_11, &[("proxy-connection", "close")]).is_keep_alive());
    }

    #[test]
    fn http10_needs_explicit_keep_alive() {
        assert!(!response(Version::HTTP_10, &[]).is_keep_alive());
        assert!(response(Version::HTTP_10, &[("connection", "keep-alive")]).is_keep_alive());
    }

    #[test]
    fn status_line_and_informational() {
        let mut info = response(Version::HTTP_11, &[]);
        info.reason = "OK".into();
        assert_eq!(info.status_line(), "HTTP/1.1 200 OK");
        info.status = 100;
        assert!(info.is_informational());
        info.status = 101;
        assert!(!info.is_informational());
    }
}
