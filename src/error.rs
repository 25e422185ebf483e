//! Network error taxonomy.
//!
//! Every layer of the engine reports failures as a [`NetError`]. Connect jobs
//! surface raw errors, the socket pool passes them through untouched, and the
//! stream request job and transaction decide which ones are recoverable.
//!
//! # Design Decisions
//! - One flat enum so errors cross layers without wrapping
//! - `Clone` so a single failure can be fanned out to every pending request
//!   when a pool is flushed
//! - Classification lives here, not at call sites, so policy stays in one place

use std::io;

use thiserror::Error;

/// Errors produced anywhere in the connection/transaction engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    // Resolution
    #[error("Name not resolved: {0}")]
    NameNotResolved(String),

    // Transport
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection reset")]
    ConnectionReset,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection aborted")]
    ConnectionAborted,
    #[error("Connection timed out")]
    ConnectionTimedOut,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Address unreachable")]
    AddressUnreachable,
    #[error("Socket is not connected")]
    SocketNotConnected,
    #[error("I/O error: {0}")]
    Io(String),

    // TLS
    #[error("SSL protocol error")]
    SslProtocolError,
    #[error("SSL version or cipher mismatch")]
    SslVersionOrCipherMismatch,
    #[error("SSL fallback rejected by server as inappropriate")]
    SslInappropriateFallback,
    #[error("SSL client certificate needed")]
    SslClientAuthCertNeeded,
    #[error("SSL bad record MAC alert")]
    SslBadRecordMacAlert,
    #[error("Negotiated protocol differs from the one required")]
    AlpnNegotiationFailed,
    #[error("Certificate common name invalid")]
    CertCommonNameInvalid,
    #[error("Certificate date invalid")]
    CertDateInvalid,
    #[error("Certificate authority invalid")]
    CertAuthorityInvalid,
    #[error("Certificate invalid")]
    CertInvalid,

    // Proxy and tunnel
    #[error("Proxy authentication requested")]
    ProxyAuthRequested,
    #[error("Tunnel connection failed")]
    TunnelConnectionFailed,
    #[error("HTTPS proxy returned a response to CONNECT")]
    HttpsProxyTunnelResponse,
    #[error("Proxy connection failed")]
    ProxyConnectionFailed,
    #[error("SOCKS connection failed")]
    SocksConnectionFailed,
    #[error("SOCKS destination host unreachable")]
    SocksConnectionHostUnreachable,
    #[error("Proxy closed the connection during an auth restart")]
    NoKeepAliveOnAuthRestart,
    #[error("Unexpected proxy authentication challenge")]
    UnexpectedProxyAuth,

    // Protocol
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Empty response")]
    EmptyResponse,
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Multiple distinct Content-Length headers")]
    MultipleContentLength,
    #[error("Invalid chunked encoding")]
    InvalidChunkedEncoding,
    #[error("Incomplete chunked encoding")]
    IncompleteChunkedEncoding,
    #[error("Content-Length mismatch")]
    ContentLengthMismatch,

    // Pool and session
    #[error("Network changed")]
    NetworkChanged,
    #[error("Preconnect stopped at the socket limit")]
    PreconnectMaxSocketLimit,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    // Caller
    #[error("Request aborted")]
    Aborted,
}

/// Result alias used throughout the crate.
pub type NetResult<T> = Result<T, NetError>;

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::ConnectionReset => NetError::ConnectionReset,
            io::ErrorKind::ConnectionAborted => NetError::ConnectionAborted,
            io::ErrorKind::NotConnected => NetError::SocketNotConnected,
            io::ErrorKind::BrokenPipe => NetError::ConnectionReset,
            io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::AddrNotAvailable => NetError::AddressUnreachable,
            _ => NetError::Io(err.to_string()),
        }
    }
}

impl NetError {
    /// Certificate verification failures that a caller may choose to override.
    pub fn is_certificate_error(&self) -> bool {
        matches!(
            self,
            NetError::CertCommonNameInvalid
                | NetError::CertDateInvalid
                | NetError::CertAuthorityInvalid
                | NetError::CertInvalid
        )
    }

    /// The server asked for a client certificate.
    pub fn is_client_auth_error(&self) -> bool {
        matches!(self, NetError::SslClientAuthCertNeeded)
    }

    /// The peer dropped a connection that had been established.
    pub fn is_transient_reset(&self) -> bool {
        matches!(
            self,
            NetError::ConnectionReset | NetError::ConnectionClosed | NetError::ConnectionAborted
        )
    }

    /// Errors that may warrant lowering the TLS version ceiling and retrying.
    pub fn is_ssl_fallback_candidate(&self) -> bool {
        matches!(
            self,
            NetError::SslProtocolError
                | NetError::SslVersionOrCipherMismatch
                | NetError::SslBadRecordMacAlert
                | NetError::ConnectionClosed
                | NetError::ConnectionReset
        )
    }

    /// Failures that indicate the proxy itself is unusable, so the next proxy
    /// in the fallback list should be tried.
    pub fn is_proxy_connection_error(&self) -> bool {
        matches!(
            self,
            NetError::ProxyConnectionFailed
                | NetError::NameNotResolved(_)
                | NetError::ConnectionRefused
                | NetError::ConnectionAborted
                | NetError::ConnectionReset
                | NetError::ConnectionClosed
                | NetError::ConnectionTimedOut
                | NetError::TimedOut
                | NetError::AddressUnreachable
                | NetError::SocksConnectionFailed
                | NetError::TunnelConnectionFailed
        )
    }

    /// Short stable label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            NetError::NameNotResolved(_) => "name_not_resolved",
            NetError::ConnectionRefused => "connection_refused",
            NetError::ConnectionReset => "connection_reset",
            NetError::ConnectionClosed => "connection_closed",
            NetError::ConnectionAborted => "connection_aborted",
            NetError::ConnectionTimedOut => "connection_timed_out",
            NetError::TimedOut => "timed_out",
            NetError::AddressUnreachable => "address_unreachable",
            NetError::SocketNotConnected => "socket_not_connected",
            NetError::Io(_) => "io",
            NetError::SslProtocolError => "ssl_protocol_error",
            NetError::SslVersionOrCipherMismatch => "ssl_version_or_cipher_mismatch",
            NetError::SslInappropriateFallback => "ssl_inappropriate_fallback",
            NetError::SslClientAuthCertNeeded => "ssl_client_auth_cert_needed",
            NetError::SslBadRecordMacAlert => "ssl_bad_record_mac_alert",
            NetError::AlpnNegotiationFailed => "alpn_negotiation_failed",
            NetError::CertCommonNameInvalid => "cert_common_name_invalid",
            NetError::CertDateInvalid => "cert_date_invalid",
            NetError::CertAuthorityInvalid => "cert_authority_invalid",
            NetError::CertInvalid => "cert_invalid",
            NetError::ProxyAuthRequested => "proxy_auth_requested",
            NetError::TunnelConnectionFailed => "tunnel_connection_failed",
            NetError::HttpsProxyTunnelResponse => "https_proxy_tunnel_response",
            NetError::ProxyConnectionFailed => "proxy_connection_failed",
            NetError::SocksConnectionFailed => "socks_connection_failed",
            NetError::SocksConnectionHostUnreachable => "socks_host_unreachable",
            NetError::NoKeepAliveOnAuthRestart => "no_keep_alive_on_auth_restart",
            NetError::UnexpectedProxyAuth => "unexpected_proxy_auth",
            NetError::InvalidResponse(_) => "invalid_response",
            NetError::EmptyResponse => "empty_response",
            NetError::ResponseHeadersTooBig => "response_headers_too_big",
            NetError::MultipleContentLength => "multiple_content_length",
            NetError::InvalidChunkedEncoding => "invalid_chunked_encoding",
            NetError::IncompleteChunkedEncoding => "incomplete_chunked_encoding",
            NetError::ContentLengthMismatch => "content_length_mismatch",
            NetError::NetworkChanged => "network_changed",
            NetError::PreconnectMaxSocketLimit => "preconnect_max_socket_limit",
            NetError::InvalidUrl(_) => "invalid_url",
            NetError::UnsupportedScheme(_) => "unsupported_scheme",
            NetError::NotImplemented(_) => "not_implemented",
            NetError::Aborted => "aborted",
        }
    }
}
