//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Destination (HostPortPair)
//!     → resolver.rs (host → ordered AddressList)
//!     → pacing.rs (process-wide connect spacing)
//!     → socket.rs (raw transport connect → BoxedSocket)
//!     → tls.rs / rustls_connector.rs (optional handshake over any BoxedSocket)
//!
//! Socket stacking:
//!     TCP → [pool handle] → [SOCKS | CONNECT tunnel] → [pool handle] → TLS
//! ```
//!
//! # Design Decisions
//! - Every collaborator is a trait so tests can script it
//! - Sockets are type-erased (`BoxedSocket`) so layers compose freely
//! - Network change is a broadcast, not a callback registry

pub mod address;
pub mod client_auth_cache;
pub mod connection;
pub mod network_change;
pub mod pacing;
pub mod resolver;
pub mod rustls_connector;
pub mod socket;
pub mod tls;

pub use address::{AddressList, HostPortPair};
pub use client_auth_cache::SslClientAuthCache;
pub use connection::SocketId;
pub use network_change::{NetworkChange, NetworkChangeNotifier};
pub use pacing::ConnectPacer;
pub use resolver::{HostResolver, RuleBasedResolver, SystemResolver};
pub use rustls_connector::RustlsConnector;
pub use socket::{BoxedSocket, ClientSocketFactory, NextProto, StreamSocket, TcpSocketFactory};
pub use tls::{
    CertRequestInfo, ClientCertificate, SslConfig, SslInfo, TlsConnector, TlsHandshakeError,
    TlsVersion,
};
