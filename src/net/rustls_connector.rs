//! [`TlsConnector`] backed by rustls.
//!
//! # Design Decisions
//! - The WebPKI verdict is recorded instead of aborting the handshake, so a
//!   certificate error still yields a completed stream the caller may accept
//! - A client certificate request with nothing configured is recorded by a
//!   resolver that declines; the connector then reports it as
//!   `SslClientAuthCertNeeded` whatever alert the server sent
//! - rustls only speaks TLS 1.2 and 1.3; a ceiling below 1.2 fails as a
//!   version mismatch, which drives the caller's fallback floor check

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, WebPkiServerVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{
    AlertDescription, CertificateError, ClientConfig, DigitallySignedStruct, ProtocolVersion,
    RootCertStore, SignatureScheme,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::NetError;
use crate::net::address::HostPortPair;
use crate::net::socket::{BoxedSocket, NextProto, StreamSocket};
use crate::net::tls::{
    CertRequestInfo, SslConfig, SslInfo, TlsConnector, TlsHandshakeError, TlsVersion,
};

/// rustls-based TLS client.
#[derive(Debug, Clone)]
pub struct RustlsConnector {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl RustlsConnector {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Build a connector trusting every certificate in a PEM bundle.
    pub fn from_pem_file(path: &Path) -> io::Result<Self> {
        let file = std::fs::File::open(path)?;
        let mut reader = io::BufReader::new(file);
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert?;
            if let Err(e) = roots.add(cert) {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unusable CA certificate");
            }
        }
        tracing::info!(path = %path.display(), roots = roots.len(), "Loaded trust anchors");
        Ok(Self::new(roots))
    }

    fn client_config(
        &self,
        config: &SslConfig,
        verifier: Arc<RecordingVerifier>,
        resolver: Arc<RecordingCertResolver>,
    ) -> Result<ClientConfig, NetError> {
        let versions = protocol_versions(config.version_min, config.version_max);
        if versions.is_empty() {
            return Err(NetError::SslVersionOrCipherMismatch);
        }
        let builder = ClientConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_protocol_versions(&versions)
            .map_err(|_| NetError::SslVersionOrCipherMismatch)?
            .dangerous()
            .with_custom_certificate_verifier(verifier);

        let mut client = match (&config.client_cert, config.send_client_cert) {
            (Some(cert), true) => {
                let chain = cert
                    .cert_chain
                    .iter()
                    .map(|der| CertificateDer::from(der.clone()))
                    .collect();
                let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
                    cert.private_key_pkcs8.clone(),
                ));
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| NetError::Io(format!("invalid client certificate: {e}")))?
            }
            _ => builder.with_client_cert_resolver(resolver),
        };
        client.alpn_protocols = config
            .alpn_protocols
            .iter()
            .map(|p| p.alpn_id().to_vec())
            .collect();
        Ok(client)
    }
}

#[async_trait]
impl TlsConnector for RustlsConnector {
    async fn connect(
        &self,
        host: &HostPortPair,
        config: &SslConfig,
        socket: BoxedSocket,
    ) -> Result<BoxedSocket, TlsHandshakeError> {
        if protocol_versions(config.version_min, config.version_max).is_empty() {
            return Err(TlsHandshakeError::Failed(NetError::SslVersionOrCipherMismatch));
        }
        let inner = WebPkiServerVerifier::builder_with_provider(
            Arc::clone(&self.roots),
            Arc::clone(&self.provider),
        )
        .build()
        .map_err(|e| TlsHandshakeError::Failed(NetError::Io(format!("verifier: {e}"))))?;
        let verifier = Arc::new(RecordingVerifier {
            inner,
            verdict: Mutex::new(None),
        });
        let resolver = Arc::new(RecordingCertResolver::default());
        let client = self
            .client_config(config, Arc::clone(&verifier), Arc::clone(&resolver))
            .map_err(TlsHandshakeError::Failed)?;

        let server_name = ServerName::try_from(host.host.clone())
            .map_err(|_| TlsHandshakeError::Failed(NetError::InvalidUrl(host.host.clone())))?;

        let connector = tokio_rustls::TlsConnector::from(Arc::new(client));
        let stream = match connector.connect(server_name, socket).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Some(issuers) = resolver.take_request() {
                    if !config.send_client_cert {
                        return Err(TlsHandshakeError::ClientAuthRequested(CertRequestInfo {
                            host_and_port: host.clone(),
                            acceptable_issuers: issuers,
                            is_proxy: false,
                        }));
                    }
                }
                let error = map_handshake_error(&e);
                tracing::debug!(host = %host, error = %error, "TLS handshake failed");
                return Err(TlsHandshakeError::Failed(error));
            }
        };

        let (_, conn) = stream.get_ref();
        let negotiated_protocol = conn
            .alpn_protocol()
            .and_then(NextProto::from_alpn)
            .unwrap_or_default();
        let mut ssl_info = SslInfo {
            version: conn.protocol_version().and_then(map_protocol_version),
            cipher_suite: conn
                .negotiated_cipher_suite()
                .map(|s| format!("{:?}", s.suite())),
            cert_chain: conn
                .peer_certificates()
                .map(|chain| chain.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default(),
            cert_error: None,
            client_cert_sent: config.send_client_cert && config.client_cert.is_some(),
            negotiated_protocol,
        };

        let verdict = verifier.verdict.lock().ok().and_then(|mut v| v.take());
        if let Some(error) = verdict {
            ssl_info.cert_error = Some(error.clone());
            let allowed = ssl_info
                .end_entity()
                .map(|der| config.is_allowed_bad_cert(der))
                .unwrap_or(false);
            let socket: BoxedSocket = Box::new(RustlsStream {
                inner: stream,
                ssl_info: ssl_info.clone(),
            });
            if !allowed {
                return Err(TlsHandshakeError::CertificateError {
                    error,
                    ssl_info,
                    socket,
                });
            }
            return Ok(socket);
        }

        Ok(Box::new(RustlsStream {
            inner: stream,
            ssl_info,
        }))
    }
}

fn protocol_versions(
    min: TlsVersion,
    max: TlsVersion,
) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let mut versions = Vec::new();
    if min <= TlsVersion::Tls1_3 && max >= TlsVersion::Tls1_3 {
        versions.push(&rustls::version::TLS13);
    }
    if min <= TlsVersion::Tls1_2 && max >= TlsVersion::Tls1_2 {
        versions.push(&rustls::version::TLS12);
    }
    versions
}

fn map_protocol_version(v: ProtocolVersion) -> Option<TlsVersion> {
    match v {
        ProtocolVersion::TLSv1_0 => Some(TlsVersion::Tls1_0),
        ProtocolVersion::TLSv1_1 => Some(TlsVersion::Tls1_1),
        ProtocolVersion::TLSv1_2 => Some(TlsVersion::Tls1_2),
        ProtocolVersion::TLSv1_3 => Some(TlsVersion::Tls1_3),
        _ => None,
    }
}

fn map_certificate_error(err: &rustls::Error) -> NetError {
    match err {
        rustls::Error::InvalidCertificate(cert) => match cert {
            CertificateError::Expired | CertificateError::NotValidYet => NetError::CertDateInvalid,
            CertificateError::UnknownIssuer => NetError::CertAuthorityInvalid,
            CertificateError::NotValidForName => NetError::CertCommonNameInvalid,
            _ => NetError::CertInvalid,
        },
        _ => NetError::CertInvalid,
    }
}

fn map_tls_error(err: &rustls::Error) -> NetError {
    match err {
        rustls::Error::AlertReceived(AlertDescription::InappropriateFallback) => {
            NetError::SslInappropriateFallback
        }
        rustls::Error::AlertReceived(AlertDescription::BadRecordMac) => {
            NetError::SslBadRecordMacAlert
        }
        rustls::Error::AlertReceived(AlertDescription::CertificateRequired) => {
            NetError::SslClientAuthCertNeeded
        }
        rustls::Error::AlertReceived(
            AlertDescription::ProtocolVersion | AlertDescription::HandshakeFailure,
        )
        | rustls::Error::PeerIncompatible(_) => NetError::SslVersionOrCipherMismatch,
        rustls::Error::InvalidCertificate(_) => map_certificate_error(err),
        _ => NetError::SslProtocolError,
    }
}

fn map_handshake_error(err: &io::Error) -> NetError {
    match err.get_ref().and_then(|inner| inner.downcast_ref::<rustls::Error>()) {
        Some(tls) => map_tls_error(tls),
        None => match err.kind() {
            io::ErrorKind::InvalidData => NetError::SslProtocolError,
            _ => NetError::from(io::Error::from(err.kind())),
        },
    }
}

/// Delegates to WebPKI but records the verdict instead of failing.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    verdict: Mutex<Option<NetError>>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Err(e) = self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            if let Ok(mut verdict) = self.verdict.lock() {
                *verdict = Some(map_certificate_error(&e));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Declines every client certificate request, remembering that one happened.
#[derive(Debug, Default)]
struct RecordingCertResolver {
    requested: Mutex<Option<Vec<Vec<u8>>>>,
}

impl RecordingCertResolver {
    fn take_request(&self) -> Option<Vec<Vec<u8>>> {
        self.requested.lock().ok().and_then(|mut r| r.take())
    }
}

impl ResolvesClientCert for RecordingCertResolver {
    fn resolve(
        &self,
        root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        if let Ok(mut requested) = self.requested.lock() {
            *requested = Some(root_hint_subjects.iter().map(|s| s.to_vec()).collect());
        }
        None
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// A rustls client stream with its handshake facts attached.
struct RustlsStream {
    inner: tokio_rustls::client::TlsStream<BoxedSocket>,
    ssl_info: SslInfo,
}

impl AsyncRead for RustlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RustlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl StreamSocket for RustlsStream {
    fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.get_ref().0.peer_addr()
    }

    fn negotiated_protocol(&self) -> NextProto {
        self.ssl_info.negotiated_protocol
    }

    fn ssl_info(&self) -> Option<SslInfo> {
        Some(self.ssl_info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_below_tls12_are_unsupported() {
        assert!(protocol_versions(TlsVersion::Tls1_0, TlsVersion::Tls1_1).is_empty());
        assert_eq!(protocol_versions(TlsVersion::Tls1_0, TlsVersion::Tls1_2).len(), 1);
        assert_eq!(protocol_versions(TlsVersion::Tls1_2, TlsVersion::Tls1_3).len(), 2);
    }

    #[test]
    fn alerts_map_to_fallback_signals() {
        assert_eq!(
            map_tls_error(&rustls::Error::AlertReceived(AlertDescription::InappropriateFallback)),
            NetError::SslInappropriateFallback
        );
        assert_eq!(
            map_tls_error(&rustls::Error::AlertReceived(AlertDescription::ProtocolVersion)),
            NetError::SslVersionOrCipherMismatch
        );
        assert_eq!(
            map_tls_error(&rustls::Error::InvalidCertificate(CertificateError::Expired)),
            NetError::CertDateInvalid
        );
    }

    #[test]
    fn io_errors_without_tls_cause_keep_kind() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(map_handshake_error(&err), NetError::ConnectionReset);

        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::BadRecordMac),
        );
        assert_eq!(map_handshake_error(&err), NetError::SslBadRecordMacAlert);
    }

    #[tokio::test]
    async fn ceiling_below_tls12_fails_before_io() {
        let connector = RustlsConnector::new(RootCertStore::empty());
        let mut config = SslConfig::default();
        config.version_max = TlsVersion::Tls1_1;
        let (client, _server) = tokio::io::duplex(64);
        let Err(err) = connector
            .connect(&HostPortPair::new("example.com", 443), &config, Box::new(client))
            .await
        else {
            panic!("handshake should not start below TLS 1.2");
        };
        assert_eq!(err.net_error(), NetError::SslVersionOrCipherMismatch);
    }
}
