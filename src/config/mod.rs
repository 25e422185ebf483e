//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → EngineConfig (validated, immutable)
//!     → shared via Arc by the session and every pool
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; only proxy rules can be swapped at runtime
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::EngineConfig;
pub use schema::HttpConfig;
pub use schema::PoolConfig;
pub use schema::ProxySettings;
pub use schema::ResendableError;
pub use schema::RetryConfig;
pub use schema::SslDefaults;
pub use schema::TimeoutConfig;
