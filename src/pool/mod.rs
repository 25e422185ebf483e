//! Layered socket pools.
//!
//! # Data Flow
//! ```text
//! SocketPool<SslConnectJobFactory>        depth 3
//!     └─▶ SocketPool<HttpProxyConnectJobFactory>   depth 2
//!             └─▶ SocketPool<SslConnectJobFactory> (proxy TLS)  depth 1
//!             └─▶ SocketPool<TransportConnectJobFactory>        depth 0
//! SocketPool<SocksConnectJobFactory>      depth 1
//!     └─▶ SocketPool<TransportConnectJobFactory>                depth 0
//! ```
//!
//! Every layer uses the same [`ConnectionGroupKey`]; a handle from a lower
//! pool is the byte stream a higher layer's connect job builds on.
//!
//! # Design Decisions
//! - One generic pool, parameterised by its connect job factory
//! - Lower pools only know higher pools through [`HigherLayeredPool`]

pub mod group_key;
pub mod handle;
pub mod layered;
pub mod pending;
pub mod priority;
pub mod socket_pool;

pub use group_key::{ConnectionGroupKey, SocketType};
pub use handle::{ClientSocketHandle, ReuseType};
pub use layered::HigherLayeredPool;
pub use pending::RequestId;
pub use priority::{LoadState, LoadStateCell, RequestPriority};
pub use socket_pool::{ConnectJobFactory, RequestSocketError, SocketPool};
