//! Alternative services learned from `Alt-Svc` response headers.
//!
//! An origin with a usable alternative gets a racing alternate job next
//! time; an alternative that fails is marked broken for a while and the
//! origin falls back to its default route.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::net::address::HostPortPair;
use crate::net::socket::NextProto;

const BROKEN_RETRY: Duration = Duration::from_secs(300);

/// Another endpoint serving the same origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlternativeService {
    pub protocol: NextProto,
    pub endpoint: HostPortPair,
}

#[derive(Debug)]
struct Entry {
    service: AlternativeService,
    expires: Instant,
    broken_until: Option<Instant>,
}

/// Origin → alternative service.
#[derive(Debug, Default)]
pub struct AlternateServiceRegistry {
    entries: DashMap<HostPortPair, Entry>,
}

impl AlternateServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, origin: &HostPortPair, service: AlternativeService, max_age: Duration) {
        tracing::debug!(origin = %origin, endpoint = %service.endpoint, protocol = ?service.protocol, "Alternative service recorded");
        let broken_until = self.entries.get(origin).and_then(|e| {
            if e.service == service {
                e.broken_until
            } else {
                None
            }
        });
        self.entries.insert(
            origin.clone(),
            Entry {
                service,
                expires: Instant::now() + max_age,
                broken_until,
            },
        );
    }

    /// The usable alternative for `origin`: known, unexpired and not broken.
    pub fn get(&self, origin: &HostPortPair) -> Option<AlternativeService> {
        let now = Instant::now();
        let entry = self.entries.get(origin)?;
        if entry.expires <= now || entry.broken_until.is_some_and(|until| until > now) {
            return None;
        }
        Some(entry.service.clone())
    }

    pub fn mark_broken(&self, origin: &HostPortPair) {
        if let Some(mut entry) = self.entries.get_mut(origin) {
            tracing::info!(origin = %origin, endpoint = %entry.service.endpoint, "Alternative service marked broken");
            entry.broken_until = Some(Instant::now() + BROKEN_RETRY);
        }
    }

    pub fn is_broken(&self, origin: &HostPortPair) -> bool {
        self.entries
            .get(origin)
            .and_then(|e| e.broken_until)
            .is_some_and(|until| until > Instant::now())
    }

    pub fn remove(&self, origin: &HostPortPair) {
        self.entries.remove(origin);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Apply an `Alt-Svc` header received from `origin`.
    pub fn process_header(&self, origin: &HostPortPair, value: &str) {
        match parse_alt_svc(origin, value) {
            AltSvc::Clear => self.remove(origin),
            AltSvc::Services(services) => {
                if let Some((service, max_age)) = services.into_iter().next() {
                    self.set(origin, service, max_age);
                }
            }
        }
    }

    pub fn info_as_value(&self) -> Value {
        let now = Instant::now();
        let entries: Vec<Value> = self
            .entries
            .iter()
            .map(|e| {
                json!({
                    "origin": e.key().to_string(),
                    "endpoint": e.value().service.endpoint.to_string(),
                    "protocol": e.value().service.protocol,
                    "broken": e.value().broken_until.is_some_and(|until| until > now),
                })
            })
            .collect();
        Value::Array(entries)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum AltSvc {
    Clear,
    Services(Vec<(AlternativeService, Duration)>),
}

/// Parse `h2="alt.example:443"; ma=3600, http/1.1=":8443"` or `clear`.
///
/// Unknown protocols and malformed entries are skipped. An empty host
/// means the origin's host.
fn parse_alt_svc(origin: &HostPortPair, value: &str) -> AltSvc {
    if value.trim().eq_ignore_ascii_case("clear") {
        return AltSvc::Clear;
    }
    let mut services = Vec::new();
    for item in value.split(',') {
        let mut params = item.split(';').map(str::trim);
        let Some((protocol, authority)) = params.next().and_then(|p| p.split_once('=')) else {
            continue;
        };
        let Some(protocol) = NextProto::from_alpn(protocol.trim().as_bytes()) else {
            continue;
        };
        let authority = authority.trim().trim_matches('"');
        let endpoint = match authority.strip_prefix(':') {
            Some(port) => match port.parse() {
                Ok(port) => HostPortPair::new(origin.host.clone(), port),
                Err(_) => continue,
            },
            None => match HostPortPair::parse(authority) {
                Some(hp) => hp,
                None => continue,
            },
        };
        let max_age = params
            .filter_map(|p| p.strip_prefix("ma="))
            .find_map(|v| v.parse::<u64>().ok())
            .unwrap_or(86_400);
        services.push((AlternativeService { protocol, endpoint }, Duration::from_secs(max_age)));
    }
    AltSvc::Services(services)
}
