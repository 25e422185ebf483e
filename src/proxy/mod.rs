//! Proxy subsystem.
//!
//! # Data Flow
//! ```text
//! ProxySettings (config)
//!     → rules.rs (parse rules + bypass list)
//!     → service.rs (resolve per URL, bad-proxy deprioritisation)
//!     → ProxyInfo (ordered fallback list, owned by one stream request job)
//! ```
//!
//! # Design Decisions
//! - Fixed rules only; script-based proxy configuration is out of scope
//! - Rules are swapped atomically; in-flight requests keep their ProxyInfo
//! - The bad-proxy list is process-lifetime and cleared on network change

pub mod rules;
pub mod server;
pub mod service;

pub use rules::{BypassRules, ProxyRules, ProxyRulesError};
pub use server::{ProxyInfo, ProxyScheme, ProxyServer};
pub use service::ProxyService;
