//! Per-scheme auth handlers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::auth::cache::AuthCredentials;
use crate::auth::challenge::AuthChallenge;

/// How a handler reads a follow-up challenge from the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeResult {
    /// The credentials just sent were refused.
    Reject,
    /// The handshake continues (multi-round schemes).
    Accept,
    /// The peer now asks for a different realm.
    DifferentRealm,
}

/// State for one negotiated scheme.
pub trait AuthHandler: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn realm(&self) -> &str;

    /// `Authorization` / `Proxy-Authorization` value for `credentials`.
    fn generate_token(&self, credentials: &AuthCredentials) -> String;

    fn handle_another_challenge(&self, challenges: &[AuthChallenge]) -> ChallengeResult;
}

/// RFC 7617 Basic.
#[derive(Debug, Clone)]
pub struct BasicAuthHandler {
    realm: String,
}

impl BasicAuthHandler {
    pub const SCHEME: &'static str = "basic";

    pub fn new(realm: impl Into<String>) -> Self {
        Self { realm: realm.into() }
    }
}

impl AuthHandler for BasicAuthHandler {
    fn scheme(&self) -> &'static str {
        Self::SCHEME
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn generate_token(&self, credentials: &AuthCredentials) -> String {
        let raw = format!("{}:{}", credentials.username, credentials.password);
        format!("Basic {}", STANDARD.encode(raw))
    }

    fn handle_another_challenge(&self, challenges: &[AuthChallenge]) -> ChallengeResult {
        // Basic is one round: the same realm asking again means no.
        match challenges.iter().find(|c| c.scheme == Self::SCHEME) {
            Some(c) if c.realm() == self.realm => ChallengeResult::Reject,
            Some(_) => ChallengeResult::DifferentRealm,
            None => ChallengeResult::Reject,
        }
    }
}

/// A handler for `scheme` with `realm`, if the scheme is supported.
pub fn handler_for_scheme(scheme: &str, realm: &str) -> Option<Box<dyn AuthHandler>> {
    match scheme {
        BasicAuthHandler::SCHEME => Some(Box::new(BasicAuthHandler::new(realm))),
        _ => None,
    }
}

/// A handler for the first supported challenge whose scheme is not disabled.
pub fn choose_handler(
    challenges: &[AuthChallenge],
    is_disabled: impl Fn(&str) -> bool,
) -> Option<Box<dyn AuthHandler>> {
    challenges
        .iter()
        .filter(|c| !is_disabled(&c.scheme))
        .find_map(|c| handler_for_scheme(&c.scheme, c.realm()))
}
