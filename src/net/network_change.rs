//! Network change notifications.
//!
//! Pools flush themselves when the local addresses change because idle
//! sockets bound to the old interface are almost certainly dead.

use tokio::sync::broadcast;

/// Kinds of change observers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    IpAddressChanged,
}

/// Broadcasts network changes to any number of subscribers.
#[derive(Debug, Clone)]
pub struct NetworkChangeNotifier {
    tx: broadcast::Sender<NetworkChange>,
}

impl NetworkChangeNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkChange> {
        self.tx.subscribe()
    }

    /// Announce a change. Returns the number of subscribers reached.
    pub fn notify_ip_address_changed(&self) -> usize {
        tracing::info!("IP address change announced");
        self.tx.send(NetworkChange::IpAddressChanged).unwrap_or(0)
    }
}

impl Default for NetworkChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_changes() {
        let notifier = NetworkChangeNotifier::new();
        assert_eq!(notifier.notify_ip_address_changed(), 0);

        let mut rx = notifier.subscribe();
        assert_eq!(notifier.notify_ip_address_changed(), 1);
        assert_eq!(rx.recv().await.unwrap(), NetworkChange::IpAddressChanged);
    }
}
