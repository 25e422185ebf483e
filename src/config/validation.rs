//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, limit nesting)
//! - Check TLS version ordering
//! - Check that proxy rules parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::EngineConfig;
use crate::proxy::ProxyRules;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A limit that must be positive was zero.
    ZeroLimit(&'static str),
    /// A narrower limit exceeds the limit that contains it.
    LimitExceedsPool { field: &'static str, value: usize, pool: usize },
    /// `version_min <= version_fallback_min <= version_max` does not hold.
    TlsVersionOrder,
    /// The proxy rules string could not be parsed.
    ProxyRules(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::ZeroLimit(field) => write!(f, "{} must be greater than zero", field),
            ValidationError::LimitExceedsPool { field, value, pool } => {
                write!(f, "{} ({}) exceeds max_sockets_per_pool ({})", field, value, pool)
            }
            ValidationError::TlsVersionOrder => {
                write!(f, "ssl versions must satisfy version_min <= version_fallback_min <= version_max")
            }
            ValidationError::ProxyRules(msg) => write!(f, "invalid proxy rules: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let pool = &config.pool;

    let limits = [
        ("max_sockets_per_group", pool.max_sockets_per_group),
        ("max_sockets_per_pool", pool.max_sockets_per_pool),
        ("max_sockets_per_proxy", pool.max_sockets_per_proxy),
    ];
    for (field, value) in limits {
        if value == 0 {
            errors.push(ValidationError::ZeroLimit(field));
        }
    }

    if pool.max_sockets_per_pool > 0 {
        for (field, value) in [
            ("max_sockets_per_group", pool.max_sockets_per_group),
            ("max_sockets_per_proxy", pool.max_sockets_per_proxy),
        ] {
            if value > pool.max_sockets_per_pool {
                errors.push(ValidationError::LimitExceedsPool {
                    field,
                    value,
                    pool: pool.max_sockets_per_pool,
                });
            }
        }
    }

    if pool.cleanup_interval_secs == 0 {
        errors.push(ValidationError::ZeroLimit("cleanup_interval_secs"));
    }

    let ssl = &config.ssl;
    if !(ssl.version_min <= ssl.version_fallback_min && ssl.version_fallback_min <= ssl.version_max) {
        errors.push(ValidationError::TlsVersionOrder);
    }

    if let Err(e) = ProxyRules::parse(&config.proxy.rules) {
        errors.push(ValidationError::ProxyRules(e.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
