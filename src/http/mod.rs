//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! HttpRequestInfo (request.rs)
//!     → HttpStream (stream.rs)
//!         basic_stream.rs: HTTP/1.1 over a pooled ClientSocketHandle
//!         multiplexed.rs:  stream inside an injected session layer
//!     → parser.rs (status line, headers, body framing)
//!     → HttpResponseInfo (response.rs)
//! ```

pub mod basic_stream;
pub mod multiplexed;
pub mod parser;
pub mod request;
pub mod response;
pub mod stream;

pub use basic_stream::HttpBasicStream;
pub use multiplexed::{MultiplexedSession, MultiplexedSessionPool, SessionKey, TunnelOutcome};
pub use request::{HttpRequestInfo, TransactionId};
pub use response::HttpResponseInfo;
pub use stream::HttpStream;
