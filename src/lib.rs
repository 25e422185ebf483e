//! Client-side HTTP connection and transaction engine.
//!
//! # Architecture Overview
//!
//! ```text
//!   HttpNetworkTransaction (transaction)
//!       │  auth restarts, TLS fallback, resend-once
//!       ▼
//!   HttpStreamFactory → StreamRequest (stream_factory)
//!       │  proxy resolution, main/alternate job race, user-action pauses
//!       ▼
//!   HttpNetworkSession (session)
//!       │  ┌──────────────────────────────────────────────────┐
//!       └─▶│ ssl pool ─▶ http-proxy pool ─▶ ssl-for-proxy pool │
//!          │     │            │                    │           │
//!          │     ├─▶ socks pool ──────────────────┤           │
//!          │     └──────────────▶ transport pool ◀┘           │
//!          └──────────────────────────────────────────────────┘
//!                 pools run connect jobs (connect_job)
//!                 over the net collaborators (net)
//! ```
//!
//! Cross-cutting: `config` (TOML), `error` (`NetError`), `observability`
//! (tracing and metrics), `auth`, `proxy`.

pub mod auth;
pub mod config;
pub mod connect_job;
pub mod error;
pub mod http;
pub mod net;
pub mod observability;
pub mod pool;
pub mod proxy;
pub mod session;
pub mod stream_factory;
pub mod transaction;

pub use config::EngineConfig;
pub use error::{NetError, NetResult};
pub use session::{HttpNetworkSession, SessionDeps};
pub use transaction::HttpNetworkTransaction;
