//! Load timing: when each phase of the attempt that produced the response ran.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;

use crate::connect_job::ConnectTiming;

#[derive(Debug, Clone, Default)]
pub struct LoadTimingInfo {
    /// The connection had carried an earlier request; connect times are
    /// then unset.
    pub socket_reused: bool,
    pub request_start: Option<Instant>,
    pub proxy_resolve_start: Option<Instant>,
    pub proxy_resolve_end: Option<Instant>,
    pub connect_timing: ConnectTiming,
    pub send_start: Option<Instant>,
    pub send_end: Option<Instant>,
    pub receive_headers_end: Option<Instant>,
}

impl LoadTimingInfo {
    /// Forget everything measured for an attempt that is being replaced,
    /// keeping when the request started.
    pub(crate) fn restart(&mut self) {
        *self = Self {
            request_start: self.request_start,
            ..Self::default()
        };
    }

    /// Milliseconds from request start for every recorded phase.
    pub fn as_value(&self) -> Value {
        let since = |at: Option<Instant>| -> Value {
            match (self.request_start, at) {
                (Some(start), Some(at)) => json!(millis(at.saturating_duration_since(start))),
                _ => Value::Null,
            }
        };
        let connect = &self.connect_timing;
        json!({
            "socket_reused": self.socket_reused,
            "proxy_resolve_start": since(self.proxy_resolve_start),
            "proxy_resolve_end": since(self.proxy_resolve_end),
            "dns_start": since(connect.dns_start),
            "dns_end": since(connect.dns_end),
            "connect_start": since(connect.connect_start),
            "connect_end": since(connect.connect_end),
            "ssl_start": since(connect.ssl_start),
            "ssl_end": since(connect.ssl_end),
            "send_start": since(self.send_start),
            "send_end": since(self.send_end),
            "receive_headers_end": since(self.receive_headers_end),
        })
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
