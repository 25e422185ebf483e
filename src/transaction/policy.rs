//! The transaction's transparent retry rules.
//!
//! Both policies are pure decisions over the current attempt; the state
//! machine in `mod.rs` performs the reconnect.

use crate::config::{ResendableError, RetryConfig};
use crate::error::NetError;
use crate::net::tls::{SslConfig, TlsVersion};

/// When a failed exchange is sent again on a new connection.
///
/// Only a connection that already carried a request qualifies, only before
/// any response head has arrived, and only once per transaction.
#[derive(Debug, Clone)]
pub struct ResendPolicy {
    errors: Vec<ResendableError>,
}

impl ResendPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            errors: config.resend_on_errors.clone(),
        }
    }

    pub fn should_resend_after_error(
        &self,
        error: &NetError,
        connection_reused: bool,
        headers_received: bool,
        already_resent: bool,
    ) -> bool {
        connection_reused
            && !headers_received
            && !already_resent
            && self.errors.iter().any(|e| e.matches(error))
    }

    /// A 408 on a reused connection means the server timed the idle
    /// connection out just as the request went out.
    pub fn should_resend_after_status(&self, status: u16, connection_reused: bool, already_resent: bool) -> bool {
        status == 408 && connection_reused && !already_resent
    }
}

/// What to do after a TLS handshake error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackAction {
    /// The ceiling was lowered; connect again.
    Retry(TlsVersion),
    /// Report this error to the caller.
    Fail(NetError),
}

/// Version fallback for servers that mishandle newer TLS versions.
#[derive(Debug, Clone)]
pub struct TlsFallbackPolicy {
    floor: TlsVersion,
    /// The error that started the fallback, reported if the server later
    /// says the fallback was unnecessary.
    pinned: Option<NetError>,
}

impl TlsFallbackPolicy {
    pub fn new(floor: TlsVersion) -> Self {
        Self { floor, pinned: None }
    }

    pub fn is_falling_back(&self) -> bool {
        self.pinned.is_some()
    }

    pub fn on_handshake_error(&mut self, config: &mut SslConfig, error: &NetError) -> FallbackAction {
        if *error == NetError::SslInappropriateFallback {
            return FallbackAction::Fail(self.pinned.take().unwrap_or(NetError::SslInappropriateFallback));
        }
        if !error.is_ssl_fallback_candidate() {
            return FallbackAction::Fail(error.clone());
        }
        let floor = self.floor.max(config.version_min);
        match config.version_max.previous() {
            Some(lower) if lower >= floor => {
                config.version_max = lower;
                config.version_fallback = true;
                self.pinned.get_or_insert_with(|| error.clone());
                FallbackAction::Retry(lower)
            }
            _ => FallbackAction::Fail(self.pinned.clone().unwrap_or_else(|| error.clone())),
        }
    }
}
