//! Shared utilities for the integration tests: raw-HTTP mock servers over
//! loopback TCP, a session wired to them, and scripted TLS connectors.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use http_transit::config::EngineConfig;
use http_transit::net::{
    BoxedSocket, HostPortPair, RuleBasedResolver, SslConfig, TcpSocketFactory, TlsConnector, TlsHandshakeError,
    TlsVersion,
};
use http_transit::{HttpNetworkSession, NetError, SessionDeps};

pub const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// A loopback server running `handler` for every accepted connection.
pub struct MockServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl MockServer {
    /// `handler` gets the connection's index (from zero) and the stream.
    pub async fn start<F, Fut>(handler: F) -> Self
    where
        F: Fn(usize, TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let index = counter.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { handler(index, socket).await });
            }
        });
        Self { addr, accepted }
    }

    /// Answers every request on every connection with [`OK_RESPONSE`],
    /// keeping connections alive, and logs each request head.
    pub async fn keep_alive(log: RequestLog) -> Self {
        Self::start(move |_, mut conn| {
            let log = log.clone();
            async move {
                while let Some(head) = read_request(&mut conn).await {
                    log.push(head);
                    if conn.write_all(OK_RESPONSE).await.is_err() {
                        return;
                    }
                }
            }
        })
        .await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Request heads in arrival order, lowercased.
#[derive(Clone, Default)]
pub struct RequestLog(Arc<Mutex<Vec<String>>>);

impl RequestLog {
    pub fn push(&self, head: String) {
        self.0.lock().unwrap().push(head);
    }

    pub fn heads(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.heads().iter().map(|h| request_path(h).to_string()).collect()
    }
}

/// Read one request head, lowercased. `None` once the peer is gone.
pub async fn read_request(conn: &mut TcpStream) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match conn.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
    }
    Some(String::from_utf8_lossy(&head).to_ascii_lowercase())
}

/// Second token of the request line.
pub fn request_path(head: &str) -> &str {
    head.split_whitespace().nth(1).unwrap_or_default()
}

/// A session whose resolver maps `origin.test` and `proxy.test` to loopback.
pub fn session(config: EngineConfig, tls: Arc<dyn TlsConnector>) -> Arc<HttpNetworkSession> {
    let mut resolver = RuleBasedResolver::new(None);
    resolver
        .add_rule("origin.test", vec!["127.0.0.1".parse().unwrap()])
        .add_rule("proxy.test", vec!["127.0.0.1".parse().unwrap()]);
    let deps = SessionDeps {
        resolver: Arc::new(resolver),
        sockets: Arc::new(TcpSocketFactory),
        tls,
        multiplexed: None,
    };
    HttpNetworkSession::new(config, deps).unwrap()
}

/// Poll `condition` until it holds, failing after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// One recorded handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub host: HostPortPair,
    pub version_max: TlsVersion,
    pub version_fallback: bool,
}

/// Hands the socket back unencrypted, recording each handshake.
///
/// The server side cannot speak anything newer than `max_supported`; with
/// `rejects_fallback` it also answers any fallback attempt with an
/// inappropriate-fallback alert.
pub struct ScriptedTls {
    max_supported: TlsVersion,
    rejects_fallback: bool,
    handshakes: Mutex<Vec<Handshake>>,
}

impl ScriptedTls {
    pub fn pass_through() -> Arc<Self> {
        Self::intolerant(TlsVersion::Tls1_3, false)
    }

    pub fn intolerant(max_supported: TlsVersion, rejects_fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            max_supported,
            rejects_fallback,
            handshakes: Mutex::new(Vec::new()),
        })
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }
}

#[async_trait]
impl TlsConnector for ScriptedTls {
    async fn connect(
        &self,
        host: &HostPortPair,
        config: &SslConfig,
        socket: BoxedSocket,
    ) -> Result<BoxedSocket, TlsHandshakeError> {
        self.handshakes.lock().unwrap().push(Handshake {
            host: host.clone(),
            version_max: config.version_max,
            version_fallback: config.version_fallback,
        });
        if config.version_max > self.max_supported {
            return Err(TlsHandshakeError::Failed(NetError::SslVersionOrCipherMismatch));
        }
        if self.rejects_fallback && config.version_fallback {
            return Err(TlsHandshakeError::Failed(NetError::SslInappropriateFallback));
        }
        Ok(socket)
    }
}
