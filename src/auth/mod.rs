//! HTTP authentication subsystem.
//!
//! # Data Flow
//! ```text
//! 401 / 407 response
//!     → challenge.rs (parse WWW-Authenticate / Proxy-Authenticate)
//!     → controller.rs (reject old identity, choose handler, next identity)
//!         ↔ cache.rs (origin + realm + scheme → credentials)
//!     → handler.rs (Basic token)
//!     → Authorization / Proxy-Authorization on the restarted request
//! ```
//!
//! # Design Decisions
//! - Only Basic is built in; the handler trait admits other schemes
//! - One controller per target per transaction; the proxy controller is
//!   shared with the connect jobs that build CONNECT requests

pub mod cache;
pub mod challenge;
pub mod controller;
pub mod handler;

pub use cache::{AuthCache, AuthCredentials, CachedIdentity, CredentialStore};
pub use challenge::{parse_challenges, AuthChallenge, AuthChallengeInfo};
pub use controller::{AuthController, AuthTarget};
pub use handler::{AuthHandler, BasicAuthHandler, ChallengeResult};
