//! In-memory credential store.
//!
//! # Design Decisions
//! - Keyed by origin + realm + scheme, so a realm answers every path on its
//!   origin once a challenge names it
//! - Paths that succeeded are remembered per entry; a request whose path
//!   falls under one of them sends credentials preemptively
//! - Process lifetime only; nothing is persisted

use std::fmt;

use dashmap::DashMap;

/// Username and password.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

impl AuthCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `user:password` (the password may be empty or contain `:`).
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((user, password)) => Self::new(user, password),
            None => Self::new(s, ""),
        }
    }
}

impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// A cache hit from a path lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedIdentity {
    pub realm: String,
    pub scheme: String,
    pub credentials: AuthCredentials,
}

/// Where auth controllers look up and remember credentials.
pub trait CredentialStore: Send + Sync {
    fn lookup(&self, origin: &str, realm: &str, scheme: &str) -> Option<AuthCredentials>;

    /// Credentials for the deepest remembered path that contains `path`.
    fn lookup_by_path(&self, origin: &str, path: &str) -> Option<CachedIdentity>;

    /// Remember credentials; `path`, when given, enables preemptive use
    /// under its directory.
    fn add(&self, origin: &str, realm: &str, scheme: &str, path: Option<&str>, credentials: AuthCredentials);

    /// Forget an entry, but only if it still holds `credentials`.
    fn remove(&self, origin: &str, realm: &str, scheme: &str, credentials: &AuthCredentials) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    origin: String,
    realm: String,
    scheme: String,
}

#[derive(Debug)]
struct CacheEntry {
    credentials: AuthCredentials,
    /// Directories (ending in `/`, or empty for proxies).
    paths: Vec<String>,
}

/// Process-lifetime auth cache.
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// `/a/b/c` → `/a/b/`; proxy auth uses the empty path.
fn directory_of(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) => path[..=pos].to_string(),
        None => String::new(),
    }
}

impl CredentialStore for AuthCache {
    fn lookup(&self, origin: &str, realm: &str, scheme: &str) -> Option<AuthCredentials> {
        let key = CacheKey {
            origin: origin.to_string(),
            realm: realm.to_string(),
            scheme: scheme.to_string(),
        };
        self.entries.get(&key).map(|entry| entry.credentials.clone())
    }

    fn lookup_by_path(&self, origin: &str, path: &str) -> Option<CachedIdentity> {
        let dir = directory_of(path);
        let mut best: Option<(usize, CachedIdentity)> = None;
        for item in self.entries.iter() {
            if item.key().origin != origin {
                continue;
            }
            let depth = item
                .value()
                .paths
                .iter()
                .filter(|p| dir.starts_with(p.as_str()))
                .map(String::len)
                .max();
            if let Some(depth) = depth {
                if best.as_ref().map_or(true, |(d, _)| depth > *d) {
                    best = Some((
                        depth,
                        CachedIdentity {
                            realm: item.key().realm.clone(),
                            scheme: item.key().scheme.clone(),
                            credentials: item.value().credentials.clone(),
                        },
                    ));
                }
            }
        }
        best.map(|(_, identity)| identity)
    }

    fn add(&self, origin: &str, realm: &str, scheme: &str, path: Option<&str>, credentials: AuthCredentials) {
        let key = CacheKey {
            origin: origin.to_string(),
            realm: realm.to_string(),
            scheme: scheme.to_string(),
        };
        let mut entry = self.entries.entry(key).or_insert_with(|| CacheEntry {
            credentials: credentials.clone(),
            paths: Vec::new(),
        });
        entry.credentials = credentials;
        if let Some(path) = path {
            let dir = directory_of(path);
            // A shorter remembered directory already covers deeper ones.
            if !entry.paths.iter().any(|p| dir.starts_with(p.as_str())) {
                entry.paths.retain(|p| !p.starts_with(dir.as_str()));
                entry.paths.push(dir);
            }
        }
        tracing::debug!(origin, realm, scheme, "Credentials cached");
    }

    fn remove(&self, origin: &str, realm: &str, scheme: &str, credentials: &AuthCredentials) -> bool {
        let key = CacheKey {
            origin: origin.to_string(),
            realm: realm.to_string(),
            scheme: scheme.to_string(),
        };
        let removed = self
            .entries
            .remove_if(&key, |_, entry| entry.credentials == *credentials)
            .is_some();
        if removed {
            tracing::debug!(origin, realm, scheme, "Rejected credentials removed from cache");
        }
        removed
    }
}
