//! The request-ready stream a transaction talks HTTP over.

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderMap;
use http::Method;

use crate::error::NetError;
use crate::http::request::HttpRequestInfo;
use crate::http::response::HttpResponseInfo;
use crate::net::socket::NextProto;
use crate::net::tls::SslInfo;

/// One request/response exchange over an established connection.
///
/// Implemented by the HTTP/1.1 stream and by multiplexed-session streams.
#[async_trait]
pub trait HttpStream: Send {
    /// Write the request head built from `request` and `headers`, then the body.
    async fn send_request(&mut self, request: &HttpRequestInfo, headers: &HeaderMap) -> Result<(), NetError>;

    /// Read the next response head. Called again after an informational
    /// response.
    async fn read_response_headers(&mut self, method: &Method) -> Result<HttpResponseInfo, NetError>;

    /// Next piece of the body; `None` once complete.
    async fn read_body(&mut self) -> Result<Option<Bytes>, NetError>;

    fn is_response_body_complete(&self) -> bool;

    /// The connection can carry another request once this one is done.
    fn can_reuse_connection(&self) -> bool;

    /// The underlying connection had carried an earlier request.
    fn is_connection_reused(&self) -> bool;

    /// Bytes received so far, head and body.
    fn received_bytes(&self) -> u64;

    fn negotiated_protocol(&self) -> NextProto;

    fn ssl_info(&self) -> Option<SslInfo>;

    fn remote_endpoint(&self) -> Option<SocketAddr>;

    /// Finish with the stream: a reusable connection goes back to its pool,
    /// anything else is closed.
    fn close(self: Box<Self>);

    /// A fresh stream on the same connection for an auth restart, if the
    /// connection survived the previous exchange.
    fn renew_for_auth(self: Box<Self>) -> Option<Box<dyn HttpStream>>;

    /// Read and discard the rest of the body, up to `limit` bytes.
    ///
    /// Returns whether the body was fully consumed within the limit.
    async fn drain_body(&mut self, limit: u64) -> Result<bool, NetError> {
        let mut drained = 0u64;
        while !self.is_response_body_complete() {
            match self.read_body().await? {
                Some(chunk) => {
                    drained += chunk.len() as u64;
                    if drained > limit {
                        return Ok(false);
                    }
                }
                None => break,
            }
        }
        Ok(true)
    }
}
