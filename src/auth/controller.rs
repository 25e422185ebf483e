//! Per-target auth state for one transaction.
//!
//! # Responsibilities
//! - Produce the `Authorization` / `Proxy-Authorization` header for the next
//!   attempt, preemptively when the cache knows the path
//! - Digest a 401/407: detect rejected credentials, pick a handler, and pick
//!   the next identity to try
//! - Tell the caller when only it can supply credentials
//!
//! # Data Flow
//! ```text
//! identity sources, tried in order per challenge:
//!   path lookup (preemptive) → URL-embedded (once) → realm cache → caller
//! ```
//!
//! # Design Decisions
//! - Shared as `Arc` between the transaction and the connect jobs that build
//!   CONNECT requests, so state sits behind a mutex never held across awaits
//! - A rejected cached identity is removed from the cache so it is not
//!   offered again

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::header::{AUTHORIZATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use url::Url;

use crate::auth::cache::{AuthCredentials, CredentialStore};
use crate::auth::challenge::{parse_challenges, AuthChallengeInfo};
use crate::auth::handler::{choose_handler, handler_for_scheme, AuthHandler, ChallengeResult};
use crate::error::NetError;
use crate::proxy::server::ProxyServer;

/// Who is asking for credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTarget {
    Proxy,
    Server,
}

impl AuthTarget {
    pub fn challenge_header(&self) -> HeaderName {
        match self {
            AuthTarget::Proxy => PROXY_AUTHENTICATE,
            AuthTarget::Server => WWW_AUTHENTICATE,
        }
    }

    pub fn authorization_header(&self) -> HeaderName {
        match self {
            AuthTarget::Proxy => PROXY_AUTHORIZATION,
            AuthTarget::Server => AUTHORIZATION,
        }
    }

    /// Status code carrying a challenge for this target.
    pub fn challenge_status(&self) -> u16 {
        match self {
            AuthTarget::Proxy => 407,
            AuthTarget::Server => 401,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentitySource {
    PathLookup,
    UrlEmbedded,
    RealmLookup,
    External,
}

#[derive(Debug, Clone)]
struct Identity {
    source: IdentitySource,
    credentials: AuthCredentials,
}

#[derive(Default)]
struct ControllerState {
    handler: Option<Box<dyn AuthHandler>>,
    identity: Option<Identity>,
    embedded_identity_used: bool,
    disabled_schemes: HashSet<String>,
    /// Set when the caller has to provide credentials.
    challenge: Option<AuthChallengeInfo>,
}

/// Auth state for one target of one transaction.
pub struct AuthController {
    target: AuthTarget,
    /// `scheme://host:port` of the server or proxy.
    origin: String,
    /// Request path for servers; empty for proxies.
    path: String,
    embedded: Option<AuthCredentials>,
    cache: Arc<dyn CredentialStore>,
    state: Mutex<ControllerState>,
}

impl AuthController {
    pub fn new(
        target: AuthTarget,
        origin: String,
        path: String,
        embedded: Option<AuthCredentials>,
        cache: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            target,
            origin,
            path,
            embedded,
            cache,
            state: Mutex::new(ControllerState::default()),
        }
    }

    /// Controller for the origin server of `url`, picking up credentials
    /// embedded in the URL.
    pub fn for_server(url: &Url, cache: Arc<dyn CredentialStore>) -> Self {
        let embedded = (!url.username().is_empty()).then(|| {
            AuthCredentials::new(url.username(), url.password().unwrap_or_default())
        });
        let origin = format!(
            "{}://{}:{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        Self::new(AuthTarget::Server, origin, url.path().to_string(), embedded, cache)
    }

    /// Controller for `proxy`.
    pub fn for_proxy(proxy: &ProxyServer, cache: Arc<dyn CredentialStore>) -> Self {
        let origin = match proxy.host_port() {
            Some(hp) => format!("{}://{}", if proxy.is_https() { "https" } else { "http" }, hp),
            None => String::new(),
        };
        Self::new(AuthTarget::Proxy, origin, String::new(), None, cache)
    }

    pub fn target(&self) -> AuthTarget {
        self.target
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Header to attach to the next attempt, if any credentials apply.
    ///
    /// Without a handler this tries a preemptive path lookup in the cache.
    pub fn auth_header(&self) -> Result<Option<(HeaderName, HeaderValue)>, NetError> {
        let mut state = self.lock();
        if state.handler.is_none() && state.identity.is_none() {
            if let Some(cached) = self.cache.lookup_by_path(&self.origin, &self.path) {
                if let Some(handler) = handler_for_scheme(&cached.scheme, &cached.realm) {
                    tracing::debug!(origin = %self.origin, realm = %cached.realm, "Preemptive auth from cache");
                    state.handler = Some(handler);
                    state.identity = Some(Identity {
                        source: IdentitySource::PathLookup,
                        credentials: cached.credentials,
                    });
                }
            }
        }
        let (Some(handler), Some(identity)) = (&state.handler, &state.identity) else {
            return Ok(None);
        };
        let token = handler.generate_token(&identity.credentials);
        let value = HeaderValue::from_str(&token)
            .map_err(|_| NetError::InvalidUrl("credentials contain invalid header bytes".into()))?;
        Ok(Some((self.target.authorization_header(), value)))
    }

    /// Digest a 401/407 response's challenges.
    ///
    /// Afterwards either [`have_auth`](Self::have_auth) is true and the
    /// request can be restarted, or [`auth_info`](Self::auth_info) says what
    /// the caller must answer, or neither (no supported scheme: the response
    /// is shown as is).
    pub fn handle_auth_challenge(&self, headers: &HeaderMap) {
        let challenges = parse_challenges(
            headers
                .get_all(self.target.challenge_header())
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        let mut state = self.lock();
        state.challenge = None;

        if let Some(handler) = state.handler.take() {
            match handler.handle_another_challenge(&challenges) {
                ChallengeResult::Accept => {
                    state.handler = Some(handler);
                    return;
                }
                ChallengeResult::Reject => {
                    match state.identity.take() {
                        Some(identity) => self.invalidate_rejected(handler.as_ref(), &identity),
                        // A challenge for a request that carried no identity
                        // means the scheme itself failed.
                        None => {
                            state.disabled_schemes.insert(handler.scheme().to_string());
                        }
                    }
                }
                ChallengeResult::DifferentRealm => {
                    state.identity = None;
                }
            }
        }

        let disabled = state.disabled_schemes.clone();
        let Some(handler) = choose_handler(&challenges, |s| disabled.contains(s)) else {
            tracing::debug!(origin = %self.origin, "No supported auth scheme offered");
            state.identity = None;
            return;
        };

        if state.identity.is_none() {
            let identity = self.select_next_identity(&mut state, handler.as_ref());
            state.identity = identity;
        }
        if state.identity.is_none() {
            state.challenge = Some(AuthChallengeInfo {
                is_proxy: self.target == AuthTarget::Proxy,
                challenger: self.origin.clone(),
                scheme: handler.scheme().to_string(),
                realm: handler.realm().to_string(),
            });
        }
        tracing::debug!(
            origin = %self.origin,
            scheme = handler.scheme(),
            realm = handler.realm(),
            have_identity = state.identity.is_some(),
            "Auth challenge handled"
        );
        state.handler = Some(handler);
    }

    fn select_next_identity(&self, state: &mut ControllerState, handler: &dyn AuthHandler) -> Option<Identity> {
        if !state.embedded_identity_used {
            if let Some(credentials) = &self.embedded {
                state.embedded_identity_used = true;
                return Some(Identity {
                    source: IdentitySource::UrlEmbedded,
                    credentials: credentials.clone(),
                });
            }
        }
        self.cache
            .lookup(&self.origin, handler.realm(), handler.scheme())
            .map(|credentials| Identity {
                source: IdentitySource::RealmLookup,
                credentials,
            })
    }

    fn invalidate_rejected(&self, handler: &dyn AuthHandler, identity: &Identity) {
        tracing::debug!(origin = %self.origin, realm = handler.realm(), source = ?identity.source, "Credentials rejected");
        self.cache
            .remove(&self.origin, handler.realm(), handler.scheme(), &identity.credentials);
    }

    /// Continue after a challenge: with caller `credentials`, or with the
    /// identity already selected when `None`. The identity is cached.
    pub fn reset_auth(&self, credentials: Option<AuthCredentials>) {
        let mut state = self.lock();
        if let Some(credentials) = credentials {
            state.identity = Some(Identity {
                source: IdentitySource::External,
                credentials,
            });
        }
        state.challenge = None;
        if let (Some(handler), Some(identity)) = (&state.handler, &state.identity) {
            let path = (self.target == AuthTarget::Server).then_some(self.path.as_str());
            self.cache.add(
                &self.origin,
                handler.realm(),
                handler.scheme(),
                path.or(Some("")),
                identity.credentials.clone(),
            );
        }
    }

    /// A handler and an identity are ready, so a restart will send credentials.
    pub fn have_auth(&self) -> bool {
        let state = self.lock();
        state.handler.is_some() && state.identity.is_some()
    }

    pub fn have_auth_handler(&self) -> bool {
        self.lock().handler.is_some()
    }

    /// What the caller must answer, if anything.
    pub fn auth_info(&self) -> Option<AuthChallengeInfo> {
        self.lock().challenge.clone()
    }
}

impl std::fmt::Debug for AuthController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthController")
            .field("target", &self.target)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::cache::AuthCache;

    fn challenge(target: AuthTarget, value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(target.challenge_header(), HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn caller_credentials_are_cached_for_preemptive_use() {
        let cache = Arc::new(AuthCache::new());
        let url = Url::parse("http://example.com/docs/a.html").unwrap();
        let controller = AuthController::for_server(&url, cache.clone());
        assert!(controller.auth_header().unwrap().is_none());

        controller.handle_auth_challenge(&challenge(AuthTarget::Server, "Basic realm=\"docs\""));
        assert!(!controller.have_auth());
        let info = controller.auth_info().unwrap();
        assert_eq!(info.realm, "docs");
        assert!(!info.is_proxy);

        controller.reset_auth(Some(AuthCredentials::new("u", "p")));
        assert!(controller.have_auth());
        let (name, _) = controller.auth_header().unwrap().unwrap();
        assert_eq!(name, AUTHORIZATION);

        // A later transaction under the same directory sends it up front.
        let url = Url::parse("http://example.com/docs/b.html").unwrap();
        let next = AuthController::for_server(&url, cache);
        assert!(next.auth_header().unwrap().is_some());
    }

    #[test]
    fn embedded_identity_tried_once_then_caller() {
        let cache = Arc::new(AuthCache::new());
        let url = Url::parse("http://bob:pw@example.com/").unwrap();
        let controller = AuthController::for_server(&url, cache);
        controller.handle_auth_challenge(&challenge(AuthTarget::Server, "Basic realm=\"r\""));
        assert!(controller.have_auth());
        controller.reset_auth(None);

        controller.handle_auth_challenge(&challenge(AuthTarget::Server, "Basic realm=\"r\""));
        assert!(!controller.have_auth());
        assert!(controller.auth_info().is_some());
    }

    #[test]
    fn rejected_cached_identity_is_removed() {
        let cache = Arc::new(AuthCache::new());
        let proxy = ProxyServer::new(
            crate::proxy::ProxyScheme::Http,
            crate::net::address::HostPortPair::new("proxy", 3128),
        );
        cache.add("http://proxy:3128", "p", "basic", None, AuthCredentials::new("u", "old"));
        let controller = AuthController::for_proxy(&proxy, cache.clone());

        controller.handle_auth_challenge(&challenge(AuthTarget::Proxy, "Basic realm=\"p\""));
        assert!(controller.have_auth());
        let (name, value) = controller.auth_header().unwrap().unwrap();
        assert_eq!(name, PROXY_AUTHORIZATION);
        assert!(value.to_str().unwrap().starts_with("Basic "));

        controller.handle_auth_challenge(&challenge(AuthTarget::Proxy, "Basic realm=\"p\""));
        assert!(!controller.have_auth());
        assert!(cache.is_empty());
        assert!(controller.auth_info().unwrap().is_proxy);
    }

    #[test]
    fn unsupported_scheme_leaves_response_to_caller() {
        let cache = Arc::new(AuthCache::new());
        let url = Url::parse("http://example.com/").unwrap();
        let controller = AuthController::for_server(&url, cache);
        controller.handle_auth_challenge(&challenge(AuthTarget::Server, "Negotiate"));
        assert!(!controller.have_auth_handler());
        assert!(controller.auth_info().is_none());
    }
}
