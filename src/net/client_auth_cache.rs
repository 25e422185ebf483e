//! Remembered client certificate decisions, per server.

use dashmap::DashMap;

use crate::net::address::HostPortPair;
use crate::net::tls::ClientCertificate;

/// `host:port` → the caller's client certificate choice.
///
/// `None` records an explicit decision to send no certificate, so the
/// caller is not asked again.
#[derive(Debug, Default)]
pub struct SslClientAuthCache {
    entries: DashMap<HostPortPair, Option<ClientCertificate>>,
}

impl SslClientAuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored decision, or `None` when the caller has not decided.
    pub fn lookup(&self, server: &HostPortPair) -> Option<Option<ClientCertificate>> {
        self.entries.get(server).map(|entry| entry.value().clone())
    }

    pub fn add(&self, server: &HostPortPair, certificate: Option<ClientCertificate>) {
        tracing::debug!(server = %server, has_cert = certificate.is_some(), "Client certificate decision cached");
        self.entries.insert(server.clone(), certificate);
    }

    pub fn remove(&self, server: &HostPortPair) -> bool {
        self.entries.remove(server).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_both_kinds_of_decision() {
        let cache = SslClientAuthCache::new();
        let with_cert = HostPortPair::new("a.test", 443);
        let without = HostPortPair::new("b.test", 443);
        let cert = ClientCertificate {
            cert_chain: vec![vec![1]],
            private_key_pkcs8: vec![2],
        };
        cache.add(&with_cert, Some(cert.clone()));
        cache.add(&without, None);

        assert_eq!(cache.lookup(&with_cert), Some(Some(cert)));
        assert_eq!(cache.lookup(&without), Some(None));
        assert_eq!(cache.lookup(&HostPortPair::new("c.test", 443)), None);

        assert!(cache.remove(&without));
        assert_eq!(cache.len(), 1);
    }
}
