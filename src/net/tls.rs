//! TLS collaborator interface and per-connection TLS parameters.
//!
//! # Responsibilities
//! - [`SslConfig`]: the snapshot of negotiable parameters a connect job uses
//! - [`TlsConnector`]: `handshake(stream, config) -> encrypted stream` or one
//!   of three structured failures
//! - Metadata ([`SslInfo`], [`CertRequestInfo`]) carried up to the caller
//!
//! # Design Decisions
//! - A certificate error keeps the completed handshake's stream so a caller
//!   override can resume on the same connection
//! - A client certificate request never keeps the stream; the caller retries
//!   from a fresh connection once a certificate is chosen
//! - The cryptography itself is opaque; see `net::rustls` for the adapter

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SslDefaults;
use crate::error::NetError;
use crate::net::address::HostPortPair;
use crate::net::socket::{BoxedSocket, NextProto};

/// TLS protocol versions, ordered oldest to newest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "tls1.0")]
    Tls1_0,
    #[serde(rename = "tls1.1")]
    Tls1_1,
    #[serde(rename = "tls1.2")]
    Tls1_2,
    #[serde(rename = "tls1.3")]
    Tls1_3,
}

impl TlsVersion {
    /// One protocol step down, if any.
    pub fn previous(self) -> Option<TlsVersion> {
        match self {
            TlsVersion::Tls1_0 => None,
            TlsVersion::Tls1_1 => Some(TlsVersion::Tls1_0),
            TlsVersion::Tls1_2 => Some(TlsVersion::Tls1_1),
            TlsVersion::Tls1_3 => Some(TlsVersion::Tls1_2),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls1_0 => "tls1.0",
            TlsVersion::Tls1_1 => "tls1.1",
            TlsVersion::Tls1_2 => "tls1.2",
            TlsVersion::Tls1_3 => "tls1.3",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A client certificate chain and its PKCS#8 private key, both DER.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub cert_chain: Vec<Vec<u8>>,
    pub private_key_pkcs8: Vec<u8>,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// A certificate the caller chose to accept despite `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedBadCert {
    pub der: Vec<u8>,
    pub error: NetError,
}

/// Negotiable TLS parameters for one connection attempt.
///
/// The transaction owns the mutable copy; connect jobs receive a clone so a
/// fallback decision never changes parameters under an in-flight handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SslConfig {
    pub version_min: TlsVersion,
    pub version_max: TlsVersion,
    /// Set once the ceiling has been lowered by fallback.
    pub version_fallback: bool,
    pub rev_checking_enabled: bool,
    pub allowed_bad_certs: Vec<AllowedBadCert>,
    /// Whether the caller has decided about a client certificate (possibly none).
    pub send_client_cert: bool,
    pub client_cert: Option<ClientCertificate>,
    pub alpn_protocols: Vec<NextProto>,
}

impl Default for SslConfig {
    fn default() -> Self {
        Self::from_defaults(&SslDefaults::default())
    }
}

impl SslConfig {
    pub fn from_defaults(defaults: &SslDefaults) -> Self {
        Self {
            version_min: defaults.version_min,
            version_max: defaults.version_max,
            version_fallback: false,
            rev_checking_enabled: defaults.rev_checking_enabled,
            allowed_bad_certs: Vec::new(),
            send_client_cert: false,
            client_cert: None,
            alpn_protocols: vec![NextProto::Http11],
        }
    }

    /// Whether `der` was explicitly allowed by the caller.
    pub fn is_allowed_bad_cert(&self, der: &[u8]) -> bool {
        self.allowed_bad_certs.iter().any(|c| c.der == der)
    }
}

/// Facts about an established (or certificate-failed) TLS connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SslInfo {
    pub version: Option<TlsVersion>,
    pub cipher_suite: Option<String>,
    /// Peer chain, end-entity first, DER.
    pub cert_chain: Vec<Vec<u8>>,
    /// Verification error the connection was accepted with, if any.
    pub cert_error: Option<NetError>,
    pub client_cert_sent: bool,
    pub negotiated_protocol: NextProto,
}

impl SslInfo {
    pub fn end_entity(&self) -> Option<&[u8]> {
        self.cert_chain.first().map(Vec::as_slice)
    }
}

/// A server's request for a client certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRequestInfo {
    pub host_and_port: HostPortPair,
    /// DER-encoded distinguished names the server will accept.
    pub acceptable_issuers: Vec<Vec<u8>>,
    pub is_proxy: bool,
}

/// Structured handshake failure.
pub enum TlsHandshakeError {
    /// The handshake failed outright.
    Failed(NetError),
    /// Verification failed but the handshake completed; the stream is kept.
    CertificateError {
        error: NetError,
        ssl_info: SslInfo,
        socket: BoxedSocket,
    },
    /// The server wants a client certificate and none is configured.
    ClientAuthRequested(CertRequestInfo),
}

impl TlsHandshakeError {
    pub fn net_error(&self) -> NetError {
        match self {
            TlsHandshakeError::Failed(e) => e.clone(),
            TlsHandshakeError::CertificateError { error, .. } => error.clone(),
            TlsHandshakeError::ClientAuthRequested(_) => NetError::SslClientAuthCertNeeded,
        }
    }
}

impl fmt::Debug for TlsHandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsHandshakeError::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
            TlsHandshakeError::CertificateError { error, ssl_info, .. } => f
                .debug_struct("CertificateError")
                .field("error", error)
                .field("ssl_info", ssl_info)
                .finish_non_exhaustive(),
            TlsHandshakeError::ClientAuthRequested(info) => {
                f.debug_tuple("ClientAuthRequested").field(info).finish()
            }
        }
    }
}

/// Performs the client side of a TLS handshake over an existing stream.
#[async_trait]
pub trait TlsConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        host: &HostPortPair,
        config: &SslConfig,
        socket: BoxedSocket,
    ) -> Result<BoxedSocket, TlsHandshakeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_steps_down_to_tls10() {
        assert_eq!(TlsVersion::Tls1_3.previous(), Some(TlsVersion::Tls1_2));
        assert_eq!(TlsVersion::Tls1_0.previous(), None);
        assert!(TlsVersion::Tls1_1 < TlsVersion::Tls1_2);
    }

    #[test]
    fn versions_deserialize_from_dotted_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            v: TlsVersion,
        }
        let w: Wrapper = toml::from_str("v = \"tls1.2\"").unwrap();
        assert_eq!(w.v, TlsVersion::Tls1_2);
    }

    #[test]
    fn allowed_bad_cert_lookup() {
        let mut config = SslConfig::default();
        config.allowed_bad_certs.push(AllowedBadCert {
            der: vec![1, 2, 3],
            error: NetError::CertAuthorityInvalid,
        });
        assert!(config.is_allowed_bad_cert(&[1, 2, 3]));
        assert!(!config.is_allowed_bad_cert(&[4]));
    }
}
