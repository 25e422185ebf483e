//! Retries the caller never sees: resending on a stale keep-alive
//! connection and TLS version fallback.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use common::{read_request, session, MockServer, RequestLog, ScriptedTls, OK_RESPONSE};
use http_transit::config::EngineConfig;
use http_transit::http::HttpRequestInfo;
use http_transit::net::{HostPortPair, TlsVersion};
use http_transit::pool::{ConnectionGroupKey, SocketType};
use http_transit::proxy::ProxyServer;
use http_transit::{HttpNetworkTransaction, NetError};

#[tokio::test]
async fn request_on_a_dead_reused_connection_is_resent_once() {
    let log = RequestLog::default();
    let server_log = log.clone();
    // First connection answers one request, then hangs up on the next.
    let server = MockServer::start(move |index, mut conn| {
        let log = server_log.clone();
        async move {
            while let Some(head) = read_request(&mut conn).await {
                log.push(head);
                if index == 0 && log.heads().len() > 1 {
                    return;
                }
                if conn.write_all(OK_RESPONSE).await.is_err() {
                    return;
                }
            }
        }
    })
    .await;
    let session = session(EngineConfig::default(), ScriptedTls::pass_through());

    for path in ["/first", "/second"] {
        let url = format!("http://origin.test:{}{}", server.port(), path);
        let mut trans = HttpNetworkTransaction::new(Arc::clone(&session), HttpRequestInfo::get(&url).unwrap());
        trans.start().await.unwrap();
        assert_eq!(&trans.read_to_end().await.unwrap()[..], b"ok");
        if path == "/second" {
            assert!(!trans.response_info().connection_reused);
        }
    }

    assert_eq!(server.accepted(), 2);
    assert_eq!(log.paths(), vec!["/first", "/second", "/second"]);
}

#[tokio::test]
async fn resend_skips_other_stale_idle_connections() {
    let log = RequestLog::default();
    let server_log = log.clone();
    // The first two connections each answer one request, once both have
    // arrived, then hang up on the next. Later connections stay healthy.
    let server = MockServer::start(move |index, mut conn| {
        let log = server_log.clone();
        async move {
            if index < 2 {
                let Some(head) = read_request(&mut conn).await else { return };
                log.push(head);
                while log.heads().len() < 2 {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                if conn.write_all(OK_RESPONSE).await.is_err() {
                    return;
                }
                if let Some(head) = read_request(&mut conn).await {
                    log.push(head);
                }
                return;
            }
            while let Some(head) = read_request(&mut conn).await {
                log.push(head);
                if conn.write_all(OK_RESPONSE).await.is_err() {
                    return;
                }
            }
        }
    })
    .await;
    let session = session(EngineConfig::default(), ScriptedTls::pass_through());
    let url = |path: &str| format!("http://origin.test:{}{}", server.port(), path);

    let fetches: Vec<_> = ["/a", "/b"]
        .into_iter()
        .map(|path| {
            let session = Arc::clone(&session);
            let url = url(path);
            tokio::spawn(async move {
                let mut trans = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
                trans.start().await.unwrap();
                trans.read_to_end().await.unwrap()
            })
        })
        .collect();
    for fetch in fetches {
        assert_eq!(&fetch.await.unwrap()[..], b"ok");
    }
    let key = ConnectionGroupKey::new(
        HostPortPair::new("origin.test", server.port()),
        SocketType::Plain,
        ProxyServer::direct(),
    );
    assert_eq!(session.transport_pool().idle_socket_count_in_group(&key), 2);

    let mut trans = HttpNetworkTransaction::new(Arc::clone(&session), HttpRequestInfo::get(&url("/c")).unwrap());
    trans.start().await.unwrap();
    assert_eq!(&trans.read_to_end().await.unwrap()[..], b"ok");
    assert!(!trans.response_info().connection_reused);

    assert_eq!(server.accepted(), 3);
    let paths = log.paths();
    let mut first_two = paths[..2].to_vec();
    first_two.sort();
    assert_eq!(first_two, vec!["/a", "/b"]);
    assert_eq!(&paths[2..], ["/c", "/c"]);
}

#[tokio::test]
async fn failure_on_a_fresh_connection_is_reported() {
    let server = MockServer::start(|_, mut conn| async move {
        let _ = read_request(&mut conn).await;
    })
    .await;
    let session = session(EngineConfig::default(), ScriptedTls::pass_through());

    let url = format!("http://origin.test:{}/", server.port());
    let mut trans = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
    assert_eq!(trans.start().await.unwrap_err(), NetError::EmptyResponse);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn resend_disabled_when_the_error_is_not_listed() {
    let log = RequestLog::default();
    let server_log = log.clone();
    let server = MockServer::start(move |_, mut conn| {
        let log = server_log.clone();
        async move {
            while let Some(head) = read_request(&mut conn).await {
                log.push(head);
                if log.heads().len() > 1 {
                    return;
                }
                let _ = conn.write_all(OK_RESPONSE).await;
            }
        }
    })
    .await;
    let mut config = EngineConfig::default();
    config.retry.resend_on_errors.clear();
    let session = session(config, ScriptedTls::pass_through());

    let url = format!("http://origin.test:{}/", server.port());
    let mut first = HttpNetworkTransaction::new(Arc::clone(&session), HttpRequestInfo::get(&url).unwrap());
    first.start().await.unwrap();
    first.read_to_end().await.unwrap();

    let mut second = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
    assert_eq!(second.start().await.unwrap_err(), NetError::EmptyResponse);
    assert_eq!(server.accepted(), 1);
}

#[tokio::test]
async fn tls_version_intolerance_falls_back() {
    let server = MockServer::keep_alive(RequestLog::default()).await;
    let tls = ScriptedTls::intolerant(TlsVersion::Tls1_2, false);
    let session = session(EngineConfig::default(), tls.clone());

    let url = format!("https://origin.test:{}/", server.port());
    let mut trans = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
    trans.start().await.unwrap();
    assert_eq!(&trans.read_to_end().await.unwrap()[..], b"ok");

    let attempts: Vec<_> = tls.handshakes().iter().map(|h| (h.version_max, h.version_fallback)).collect();
    assert_eq!(attempts, vec![(TlsVersion::Tls1_3, false), (TlsVersion::Tls1_2, true)]);
    assert_eq!(trans.server_ssl_config().version_max, TlsVersion::Tls1_2);
    assert!(trans.server_ssl_config().version_fallback);
}

#[tokio::test]
async fn tls_fallback_stops_at_the_configured_floor() {
    let server = MockServer::keep_alive(RequestLog::default()).await;
    let tls = ScriptedTls::intolerant(TlsVersion::Tls1_1, false);
    let mut config = EngineConfig::default();
    config.ssl.version_fallback_min = TlsVersion::Tls1_2;
    let session = session(config, tls.clone());

    let url = format!("https://origin.test:{}/", server.port());
    let mut trans = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
    assert_eq!(trans.start().await.unwrap_err(), NetError::SslVersionOrCipherMismatch);

    let versions: Vec<_> = tls.handshakes().iter().map(|h| h.version_max).collect();
    assert_eq!(versions, vec![TlsVersion::Tls1_3, TlsVersion::Tls1_2]);
}

#[tokio::test]
async fn inappropriate_fallback_reports_the_original_failure() {
    let server = MockServer::keep_alive(RequestLog::default()).await;
    let tls = ScriptedTls::intolerant(TlsVersion::Tls1_2, true);
    let session = session(EngineConfig::default(), tls.clone());

    let url = format!("https://origin.test:{}/", server.port());
    let mut trans = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
    assert_eq!(trans.start().await.unwrap_err(), NetError::SslVersionOrCipherMismatch);
    assert_eq!(tls.handshakes().len(), 2);
}

#[tokio::test]
async fn plain_http_never_falls_back() {
    let server = MockServer::start(|_, mut conn| async move {
        let _ = read_request(&mut conn).await;
    })
    .await;
    let tls = ScriptedTls::pass_through();
    let session = session(EngineConfig::default(), tls.clone());

    let url = format!("http://origin.test:{}/", server.port());
    let mut trans = HttpNetworkTransaction::new(session, HttpRequestInfo::get(&url).unwrap());
    assert!(trans.start().await.is_err());
    assert!(tls.handshakes().is_empty());
    assert!(!trans.server_ssl_config().version_fallback);
}
