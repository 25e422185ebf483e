//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetError;
use crate::net::tls::TlsVersion;

/// Root configuration for the connection/transaction engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    /// Socket pool limits and idle policy.
    pub pool: PoolConfig,

    /// Connect job and racing timeouts.
    pub timeouts: TimeoutConfig,

    /// Default TLS parameters.
    pub ssl: SslDefaults,

    /// Proxy rules.
    pub proxy: ProxySettings,

    /// Transparent retry policy.
    pub retry: RetryConfig,

    /// HTTP/1.1 stream settings.
    pub http: HttpConfig,
}

/// Socket pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum sockets (active + idle + connecting) per connection group.
    pub max_sockets_per_group: usize,

    /// Maximum sockets across every group of one pool.
    pub max_sockets_per_pool: usize,

    /// Maximum sockets across every group routed through one proxy server.
    pub max_sockets_per_proxy: usize,

    /// Lifetime of an idle socket that has never carried a request.
    pub unused_idle_timeout_secs: u64,

    /// Lifetime of an idle socket that has been used before.
    pub used_idle_timeout_secs: u64,

    /// How often the idle sweeper runs.
    pub cleanup_interval_secs: u64,

    /// Whether a speculative backup connect job is started for slow connects.
    pub backup_jobs_enabled: bool,

    /// Delay before the backup connect job starts.
    pub backup_connect_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sockets_per_group: 6,
            max_sockets_per_pool: 256,
            max_sockets_per_proxy: 32,
            unused_idle_timeout_secs: 10,
            used_idle_timeout_secs: 300,
            cleanup_interval_secs: 10,
            backup_jobs_enabled: true,
            backup_connect_delay_ms: 250,
        }
    }
}

impl PoolConfig {
    pub fn unused_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.unused_idle_timeout_secs)
    }

    pub fn used_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.used_idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn backup_connect_delay(&self) -> Duration {
        Duration::from_millis(self.backup_connect_delay_ms)
    }
}

/// Timeout configuration (all values in seconds unless suffixed).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Budget for a transport connect job, resolution included.
    pub transport_connect_secs: u64,

    /// Budget for the TLS handshake of an SSL connect job.
    pub ssl_handshake_secs: u64,

    /// Budget for the SOCKS handshake.
    pub socks_connect_secs: u64,

    /// Budget for establishing an HTTP proxy tunnel.
    pub http_proxy_connect_secs: u64,

    /// Delay before the IPv4 fallback connect races an IPv6 attempt.
    pub ipv6_fallback_delay_ms: u64,

    /// Minimum spacing between consecutive new connects (0 disables pacing).
    pub connect_pacing_interval_ms: u64,

    /// Head start given to an alternate-protocol job before the main job runs.
    pub alternate_job_head_start_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transport_connect_secs: 240,
            ssl_handshake_secs: 30,
            socks_connect_secs: 30,
            http_proxy_connect_secs: 30,
            ipv6_fallback_delay_ms: 300,
            connect_pacing_interval_ms: 0,
            alternate_job_head_start_ms: 300,
        }
    }
}

impl TimeoutConfig {
    pub fn transport_connect(&self) -> Duration {
        Duration::from_secs(self.transport_connect_secs)
    }

    pub fn ssl_handshake(&self) -> Duration {
        Duration::from_secs(self.ssl_handshake_secs)
    }

    pub fn socks_connect(&self) -> Duration {
        Duration::from_secs(self.socks_connect_secs)
    }

    pub fn http_proxy_connect(&self) -> Duration {
        Duration::from_secs(self.http_proxy_connect_secs)
    }

    pub fn ipv6_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.ipv6_fallback_delay_ms)
    }

    pub fn connect_pacing_interval(&self) -> Duration {
        Duration::from_millis(self.connect_pacing_interval_ms)
    }

    pub fn alternate_job_head_start(&self) -> Duration {
        Duration::from_millis(self.alternate_job_head_start_ms)
    }
}

/// Default TLS parameters applied to every new `SslConfig`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SslDefaults {
    /// Lowest protocol version ever offered.
    pub version_min: TlsVersion,

    /// Highest protocol version offered on a first attempt.
    pub version_max: TlsVersion,

    /// The ceiling is never lowered below this version by fallback.
    pub version_fallback_min: TlsVersion,

    /// Whether revocation checking is requested from the verifier.
    pub rev_checking_enabled: bool,

    /// PEM bundle of trust anchors for the rustls adapter.
    pub ca_file: Option<String>,
}

impl Default for SslDefaults {
    fn default() -> Self {
        Self {
            version_min: TlsVersion::Tls1_0,
            version_max: TlsVersion::Tls1_3,
            version_fallback_min: TlsVersion::Tls1_0,
            rev_checking_enabled: false,
            ca_file: None,
        }
    }
}

/// Proxy settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Proxy rules string, e.g. `"https=proxy:8080;socks5://s:1080"`.
    /// Empty means direct.
    pub rules: String,

    /// Hosts that bypass the proxy (`.example.com`, `*.corp`, `<local>`).
    pub bypass: Vec<String>,

    /// How long a failed proxy is deprioritised.
    pub bad_proxy_retry_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            rules: String::new(),
            bypass: Vec::new(),
            bad_proxy_retry_secs: 300,
        }
    }
}

impl ProxySettings {
    pub fn bad_proxy_retry(&self) -> Duration {
        Duration::from_secs(self.bad_proxy_retry_secs)
    }
}

/// Errors that may trigger a single transparent resend on a reused connection.
///
/// This is policy: the default set is fixed and only widened by explicit
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResendableError {
    ConnectionReset,
    ConnectionClosed,
    ConnectionAborted,
    SocketNotConnected,
    EmptyResponse,
}

impl ResendableError {
    /// Whether `err` is the error this entry names.
    pub fn matches(&self, err: &NetError) -> bool {
        matches!(
            (self, err),
            (ResendableError::ConnectionReset, NetError::ConnectionReset)
                | (ResendableError::ConnectionClosed, NetError::ConnectionClosed)
                | (ResendableError::ConnectionAborted, NetError::ConnectionAborted)
                | (ResendableError::SocketNotConnected, NetError::SocketNotConnected)
                | (ResendableError::EmptyResponse, NetError::EmptyResponse)
        )
    }
}

/// Transparent retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Errors that cause one resend when seen on a reused connection.
    pub resend_on_errors: Vec<ResendableError>,

    /// Upper bound on automatic auth restarts within one transaction.
    pub max_auth_restarts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            resend_on_errors: vec![
                ResendableError::ConnectionReset,
                ResendableError::ConnectionClosed,
                ResendableError::ConnectionAborted,
                ResendableError::SocketNotConnected,
                ResendableError::EmptyResponse,
            ],
            max_auth_restarts: 8,
        }
    }
}

/// HTTP/1.1 stream configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// User-Agent header sent on requests and CONNECT tunnels.
    pub user_agent: String,

    /// Response header block size limit.
    pub max_response_header_bytes: usize,

    /// Largest body that is drained (rather than discarded) for an auth restart.
    pub max_drain_body_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("http-transit/", env!("CARGO_PKG_VERSION")).to_string(),
            max_response_header_bytes: 256 * 1024,
            max_drain_body_bytes: 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.max_sockets_per_group, 6);
        assert_eq!(config.pool.max_sockets_per_pool, 256);
        assert_eq!(config.pool.max_sockets_per_proxy, 32);
        assert_eq!(config.pool.backup_connect_delay(), Duration::from_millis(250));
        assert_eq!(config.timeouts.ipv6_fallback_delay(), Duration::from_millis(300));
        assert_eq!(config.retry.resend_on_errors.len(), 5);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [pool]
            max_sockets_per_group = 2

            [retry]
            resend_on_errors = ["connection_reset"]
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.max_sockets_per_group, 2);
        assert_eq!(config.pool.max_sockets_per_pool, 256);
        assert_eq!(config.retry.resend_on_errors, vec![ResendableError::ConnectionReset]);
        assert_eq!(config.retry.max_auth_restarts, 8);
    }

    #[test]
    fn unknown_resend_error_rejected() {
        let parsed: Result<EngineConfig, _> = toml::from_str(
            r#"
            [retry]
            resend_on_errors = ["connection_refused"]
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn resendable_error_matching() {
        assert!(ResendableError::EmptyResponse.matches(&NetError::EmptyResponse));
        assert!(!ResendableError::ConnectionReset.matches(&NetError::ConnectionClosed));
    }
}
