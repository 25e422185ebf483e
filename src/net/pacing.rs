//! Process-wide connect pacing.
//!
//! The single piece of shared mutable state below the pools: the time of the
//! most recent transport connect. It is injected into every transport connect
//! job rather than living in a global, and reads Tokio's clock so tests can
//! pause and advance time.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Spaces new transport connects at least `min_interval` apart.
#[derive(Debug)]
pub struct ConnectPacer {
    min_interval: Duration,
    last_connect: Mutex<Option<Instant>>,
}

impl ConnectPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_connect: Mutex::new(None),
        }
    }

    /// Reserve the next connect slot and wait for it.
    ///
    /// Slots are reserved under the lock, so concurrent callers are spaced
    /// out in the order they arrived even though they sleep independently.
    pub async fn pace(&self) {
        let now = Instant::now();
        let slot = {
            let mut last = match self.last_connect.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let slot = match *last {
                Some(prev) if !self.min_interval.is_zero() => (prev + self.min_interval).max(now),
                _ => now,
            };
            *last = Some(slot);
            slot
        };
        if slot > now {
            tracing::trace!(delay_ms = (slot - now).as_millis() as u64, "Pacing connect");
            tokio::time::sleep_until(slot).await;
        }
    }

    /// When the most recent connect was (or is scheduled to be) started.
    pub fn last_connect_time(&self) -> Option<Instant> {
        match self.last_connect.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl Default for ConnectPacer {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn spaces_consecutive_connects() {
        let pacer = ConnectPacer::new(Duration::from_millis(100));
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        pacer.pace().await;
        assert_eq!(Instant::now() - start, Duration::from_millis(200));
        assert_eq!(pacer.last_connect_time(), Some(start + Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_pacer_never_waits() {
        let pacer = ConnectPacer::default();
        let start = Instant::now();
        pacer.pace().await;
        pacer.pace().await;
        assert_eq!(Instant::now(), start);
        assert!(pacer.last_connect_time().is_some());
    }
}
