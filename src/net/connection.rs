//! Connection identity.
//!
//! Every socket a connect job produces gets a process-unique id that follows
//! it through the pools, the log lines and the load-timing info.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// Only uniqueness matters here, so relaxed ordering.
static SOCKET_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an established socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SocketId(u64);

impl SocketId {
    pub fn next() -> Self {
        Self(SOCKET_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sock-{}", self.0)
    }
}
