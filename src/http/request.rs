//! Request description and HTTP/1.1 request-head serialization.
//!
//! # Responsibilities
//! - Describe one logical request (method, URL, headers, optional body)
//! - Tag every transaction with a unique id for tracing
//! - Render the request line in origin-form or, through a plain HTTP proxy,
//!   absolute-form
//!
//! # Design Decisions
//! - The id is assigned when the request is described, so log lines from the
//!   proxy resolution onwards can be correlated
//! - Credentials embedded in the URL never reach the wire in the request line

use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;
use uuid::Uuid;

use crate::error::NetError;
use crate::pool::RequestPriority;

/// Unique id of one logical request, stable across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What the caller wants fetched.
#[derive(Debug, Clone)]
pub struct HttpRequestInfo {
    pub id: TransactionId,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    /// Upload body; replayed verbatim on resend and auth restart.
    pub body: Option<Bytes>,
    /// Sockets opened in privacy mode never mix with ordinary ones.
    pub privacy_mode: bool,
    pub priority: RequestPriority,
}

impl HttpRequestInfo {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: TransactionId::new(),
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            privacy_mode: false,
            priority: RequestPriority::Medium,
        }
    }

    /// A GET for `url`.
    pub fn get(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::new(Method::GET, url))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_privacy_mode(mut self, enabled: bool) -> Self {
        self.privacy_mode = enabled;
        self
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Request target for the request line.
    ///
    /// Absolute-form (minus credentials and fragment) when talking to a
    /// plain HTTP proxy, origin-form otherwise.
    pub fn request_target(&self, via_proxy: bool) -> String {
        if via_proxy {
            let mut url = self.url.clone();
            // Both setters only fail for cannot-be-a-base URLs, which never
            // reach this point.
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.set_fragment(None);
            return url.to_string();
        }
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// `Host` header value: host, plus port when not the scheme default.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }
}

/// Serialize a request line and headers, terminated by the blank line.
pub fn serialize_request_head(method: &Method, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
