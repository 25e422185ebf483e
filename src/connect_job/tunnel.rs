//! CONNECT tunnel establishment over an already-connected proxy socket.
//!
//! Shared by the HTTP proxy connect job and by the stream request job when
//! it resumes a tunnel after proxy authentication.

use std::sync::Arc;

use bytes::BytesMut;
use http::header::{HeaderMap, HeaderValue, HOST, USER_AGENT};
use http::Method;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::AuthController;
use crate::config::HttpConfig;
use crate::connect_job::{ConnectJobFailure, FailureExtra, ProxyAuthChallenge};
use crate::error::NetError;
use crate::http::parser::{body_framing, read_response_head, BodyDecoder, BodyFraming};
use crate::http::request::serialize_request_head;
use crate::http::response::HttpResponseInfo;
use crate::net::address::HostPortPair;

/// Everything a CONNECT exchange needs besides the socket.
pub struct TunnelRequest<'a> {
    pub destination: &'a HostPortPair,
    pub auth: &'a Arc<AuthController>,
    pub is_https_proxy: bool,
    pub http: &'a HttpConfig,
}

impl TunnelRequest<'_> {
    fn head(&self) -> Result<Vec<u8>, NetError> {
        let authority = self.destination.to_authority();
        let mut headers = HeaderMap::new();
        headers.insert(
            HOST,
            HeaderValue::from_str(&authority).map_err(|_| NetError::InvalidUrl(authority.clone()))?,
        );
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        if !self.http.user_agent.is_empty() {
            if let Ok(ua) = HeaderValue::from_str(&self.http.user_agent) {
                headers.insert(USER_AGENT, ua);
            }
        }
        if let Some((name, value)) = self.auth.auth_header()? {
            headers.insert(name, value);
        }
        Ok(serialize_request_head(&Method::CONNECT, &authority, &headers))
    }
}

/// Send CONNECT on `socket` and read the proxy's answer.
///
/// On `407` the challenge is handed to the proxy auth controller and the
/// failure carries [`FailureExtra::ProxyAuthRequired`]; when the proxy kept
/// the connection alive, its body has been drained so the same socket can
/// carry the retry. No socket is attached here; the caller owns it.
pub async fn establish_tunnel<S>(socket: &mut S, request: &TunnelRequest<'_>) -> Result<(), ConnectJobFailure>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let head = request.head()?;
    socket.write_all(&head).await.map_err(NetError::from)?;
    socket.flush().await.map_err(NetError::from)?;

    let mut buf = BytesMut::new();
    let response = read_response_head(socket, &mut buf, request.http.max_response_header_bytes).await?;
    tracing::debug!(
        destination = %request.destination,
        status = response.status,
        "CONNECT response received"
    );

    match response.status {
        200 => {
            if !buf.is_empty() {
                tracing::debug!(extra = buf.len(), "Proxy sent data after 200 to CONNECT");
                return Err(NetError::TunnelConnectionFailed.into());
            }
            Ok(())
        }
        407 => {
            request.auth.handle_auth_challenge(&response.headers);
            let keep_alive = response.is_keep_alive()
                && drain_body(socket, &response, &mut buf, request.http.max_drain_body_bytes).await;
            Err(ConnectJobFailure::with_extra(
                NetError::ProxyAuthRequested,
                FailureExtra::ProxyAuthRequired(ProxyAuthChallenge {
                    response,
                    controller: Arc::clone(request.auth),
                    keep_alive,
                    tunnel: None,
                }),
            ))
        }
        // A redirect from an HTTPS proxy is authenticated by the proxy's
        // certificate, so it may be shown to the caller.
        300..=399 if request.is_https_proxy => Err(ConnectJobFailure::with_extra(
            NetError::HttpsProxyTunnelResponse,
            FailureExtra::TunnelResponse(response),
        )),
        status => {
            tracing::debug!(status, destination = %request.destination, "Proxy refused tunnel");
            Err(NetError::TunnelConnectionFailed.into())
        }
    }
}

/// Read and discard a 407 body. `false` when the connection cannot be
/// reused afterwards.
async fn drain_body<S>(socket: &mut S, response: &HttpResponseInfo, buf: &mut BytesMut, limit: u64) -> bool
where
    S: AsyncRead + Unpin + ?Sized,
{
    let framing = match body_framing(response, &Method::CONNECT) {
        Ok(BodyFraming::UntilClose) | Err(_) => return false,
        Ok(framing) => framing,
    };
    let mut decoder = BodyDecoder::new(framing);
    let mut drained = 0u64;
    loop {
        match decoder.next_chunk(socket, buf).await {
            Ok(Some(chunk)) => {
                drained += chunk.len() as u64;
                if drained > limit {
                    return false;
                }
            }
            Ok(None) => return decoder.ended_cleanly(buf),
            Err(_) => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::auth::{AuthCache, AuthCredentials, CredentialStore};
    use crate::proxy::{ProxyScheme, ProxyServer};

    const PROXY_ORIGIN: &str = "http://proxy.test:3128";

    fn controller(cache: Arc<AuthCache>) -> Arc<AuthController> {
        let proxy = ProxyServer::new(ProxyScheme::Http, HostPortPair::new("proxy.test", 3128));
        Arc::new(AuthController::for_proxy(&proxy, cache))
    }

    async fn read_head(server: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            if server.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    #[tokio::test]
    async fn established_on_200() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let auth = controller(Arc::new(AuthCache::new()));
        let http = HttpConfig::default();
        let destination = HostPortPair::new("secure.test", 443);
        let proxy = tokio::spawn(async move {
            let head = read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await.unwrap();
            (head, server)
        });

        let request = TunnelRequest {
            destination: &destination,
            auth: &auth,
            is_https_proxy: false,
            http: &http,
        };
        establish_tunnel(&mut client, &request).await.unwrap();
        let (head, _server) = proxy.await.unwrap();
        assert!(head.starts_with("CONNECT secure.test:443 HTTP/1.1\r\n"));
        assert!(head.contains("host: secure.test:443\r\n"));
        assert!(head.contains("proxy-connection: keep-alive\r\n"));
        assert!(!head.contains("proxy-authorization"));
    }

    #[tokio::test]
    async fn data_after_200_fails_the_tunnel() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let auth = controller(Arc::new(AuthCache::new()));
        let http = HttpConfig::default();
        let destination = HostPortPair::new("secure.test", 443);
        tokio::spawn(async move {
            read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\nsurprise").await.unwrap();
            std::future::pending::<()>().await;
        });
        let request = TunnelRequest {
            destination: &destination,
            auth: &auth,
            is_https_proxy: false,
            http: &http,
        };
        let err = establish_tunnel(&mut client, &request).await.unwrap_err();
        assert_eq!(err.error, NetError::TunnelConnectionFailed);
    }

    #[tokio::test]
    async fn auth_challenge_then_retry_on_same_socket() {
        let cache = Arc::new(AuthCache::new());
        cache.add(PROXY_ORIGIN, "corp", "basic", None, AuthCredentials::new("u", "p"));
        let auth = controller(cache);
        let http = HttpConfig::default();
        let destination = HostPortPair::new("secure.test", 443);
        let (mut client, mut server) = tokio::io::duplex(1024);
        let proxy = tokio::spawn(async move {
            read_head(&mut server).await;
            server
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"corp\"\r\n\
                      Content-Length: 6\r\n\r\ndenied",
                )
                .await
                .unwrap();
            let retry = read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
            (retry, server)
        });

        let request = TunnelRequest {
            destination: &destination,
            auth: &auth,
            is_https_proxy: false,
            http: &http,
        };
        let failure = establish_tunnel(&mut client, &request).await.unwrap_err();
        assert_eq!(failure.error, NetError::ProxyAuthRequested);
        match failure.extra {
            Some(FailureExtra::ProxyAuthRequired(challenge)) => {
                assert_eq!(challenge.response.status, 407);
                assert!(challenge.keep_alive);
            }
            other => panic!("unexpected extra: {other:?}"),
        }
        assert!(auth.have_auth());

        establish_tunnel(&mut client, &request).await.unwrap();
        let (retry, _server) = proxy.await.unwrap();
        assert!(retry.contains("proxy-authorization: Basic dTpw\r\n"));
    }

    #[tokio::test]
    async fn chunked_auth_challenge_without_credentials() {
        let auth = controller(Arc::new(AuthCache::new()));
        let http = HttpConfig::default();
        let destination = HostPortPair::new("secure.test", 443);
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            read_head(&mut server).await;
            server
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"corp\"\r\n\
                      Transfer-Encoding: chunked\r\n\r\n4\r\nnope\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
            std::future::pending::<()>().await;
        });
        let request = TunnelRequest {
            destination: &destination,
            auth: &auth,
            is_https_proxy: false,
            http: &http,
        };
        let failure = establish_tunnel(&mut client, &request).await.unwrap_err();
        let Some(FailureExtra::ProxyAuthRequired(challenge)) = failure.extra else {
            panic!("expected a proxy auth challenge");
        };
        assert!(challenge.keep_alive);
        assert!(!auth.have_auth());
        assert_eq!(auth.auth_info().map(|i| i.realm), Some("corp".to_string()));
    }

    #[tokio::test]
    async fn rejection_codes_depend_on_proxy_kind() {
        for (is_https_proxy, status_line, expected) in [
            (false, "HTTP/1.1 403 Forbidden", NetError::TunnelConnectionFailed),
            (true, "HTTP/1.1 403 Forbidden", NetError::TunnelConnectionFailed),
            (false, "HTTP/1.1 302 Found", NetError::TunnelConnectionFailed),
            (true, "HTTP/1.1 302 Found", NetError::HttpsProxyTunnelResponse),
        ] {
            let auth = controller(Arc::new(AuthCache::new()));
            let http = HttpConfig::default();
            let destination = HostPortPair::new("secure.test", 443);
            let (mut client, mut server) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                read_head(&mut server).await;
                let response = format!("{status_line}\r\nLocation: http://login.test/\r\nContent-Length: 0\r\n\r\n");
                server.write_all(response.as_bytes()).await.unwrap();
                std::future::pending::<()>().await;
            });
            let request = TunnelRequest {
                destination: &destination,
                auth: &auth,
                is_https_proxy,
                http: &http,
            };
            let failure = establish_tunnel(&mut client, &request).await.unwrap_err();
            assert_eq!(failure.error, expected);
            if expected == NetError::HttpsProxyTunnelResponse {
                assert!(matches!(failure.extra, Some(FailureExtra::TunnelResponse(ref r)) if r.status == 302));
            }
        }
    }
}
