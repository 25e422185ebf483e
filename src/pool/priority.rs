//! Request priorities and load states.

use serde::{Deserialize, Serialize};

/// Priority of a socket or stream request. Higher variants are served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    Throttled,
    Idle,
    Lowest,
    #[default]
    Low,
    Medium,
    Highest,
}

impl RequestPriority {
    pub const ALL: [RequestPriority; 6] = [
        RequestPriority::Throttled,
        RequestPriority::Idle,
        RequestPriority::Lowest,
        RequestPriority::Low,
        RequestPriority::Medium,
        RequestPriority::Highest,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// What a request is currently blocked on, most advanced stage last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    Idle,
    WaitingForAvailableSocket,
    ResolvingProxyForUrl,
    ResolvingHost,
    Connecting,
    SslHandshake,
    EstablishingProxyTunnel,
    SendingRequest,
    WaitingForResponse,
    ReadingResponse,
}

impl LoadState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoadState::WaitingForAvailableSocket,
            2 => LoadState::ResolvingProxyForUrl,
            3 => LoadState::ResolvingHost,
            4 => LoadState::Connecting,
            5 => LoadState::SslHandshake,
            6 => LoadState::EstablishingProxyTunnel,
            7 => LoadState::SendingRequest,
            8 => LoadState::WaitingForResponse,
            9 => LoadState::ReadingResponse,
            _ => LoadState::Idle,
        }
    }
}

/// Shared, lock-free load state published by a running connect job.
#[derive(Debug, Clone, Default)]
pub struct LoadStateCell(std::sync::Arc<std::sync::atomic::AtomicU8>);

impl LoadStateCell {
    pub fn set(&self, state: LoadState) {
        self.0.store(state as u8, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn get(&self) -> LoadState {
        LoadState::from_u8(self.0.load(std::sync::atomic::Ordering::Relaxed))
    }
}
