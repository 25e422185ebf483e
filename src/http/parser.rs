//! HTTP/1.x response parsing over any byte stream.
//!
//! # Data Flow
//! ```text
//! socket ─▶ read buffer ─▶ read_response_head (httparse) ─▶ HttpResponseInfo
//!                │
//!                └──────▶ BodyDecoder (length | chunked | until close) ─▶ body bytes
//! ```
//!
//! # Design Decisions
//! - One read buffer per connection; bytes read past the head belong to the body
//! - Leftover bytes after a complete body make the connection non-reusable
//!   (no pipelining)

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::NetError;
use crate::http::response::HttpResponseInfo;

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_LINE: usize = 4096;
const READ_CHUNK: usize = 16 * 1024;

/// Read and parse a response head, leaving any following bytes in `buf`.
///
/// A peer that closes before sending anything yields `EmptyResponse`; one
/// that closes mid-head yields `ConnectionClosed`.
pub async fn read_response_head<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_header_bytes: usize,
) -> Result<HttpResponseInfo, NetError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some((info, consumed)) = parse_head(buf)? {
            buf.advance(consumed);
            return Ok(info);
        }
        if buf.len() >= max_header_bytes {
            return Err(NetError::ResponseHeadersTooBig);
        }
        buf.reserve(READ_CHUNK);
        if reader.read_buf(buf).await? == 0 {
            return Err(if buf.is_empty() {
                NetError::EmptyResponse
            } else {
                NetError::ConnectionClosed
            });
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<(HttpResponseInfo, usize)>, NetError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    let consumed = match response.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(NetError::ResponseHeadersTooBig),
        Err(e) => return Err(NetError::InvalidResponse(e.to_string())),
    };

    let mut info = HttpResponseInfo {
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        version: match response.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        },
        ..Default::default()
    };
    for header in response.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| NetError::InvalidResponse(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|e| NetError::InvalidResponse(e.to_string()))?;
        info.headers.append(name, value);
    }
    Ok(Some((info, consumed)))
}

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Framing of the body of `info`, a response to `method`.
pub fn body_framing(info: &HttpResponseInfo, method: &Method) -> Result<BodyFraming, NetError> {
    if *method == Method::HEAD
        || (*method == Method::CONNECT && (200..300).contains(&info.status))
        || (100..200).contains(&info.status)
        || info.status == 204
        || info.status == 304
    {
        return Ok(BodyFraming::Empty);
    }

    let chunked = info
        .headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return Ok(BodyFraming::Chunked);
    }

    let mut length: Option<u64> = None;
    for value in info.headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| NetError::InvalidResponse("bad Content-Length".into()))?;
        match length {
            Some(existing) if existing != parsed => return Err(NetError::MultipleContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(0) => BodyFraming::Empty,
        Some(n) => BodyFraming::Length(n),
        None => BodyFraming::UntilClose,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Incremental body decoder for one response.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: BodyFraming,
    remaining: u64,
    chunk: ChunkState,
    done: bool,
}

impl BodyDecoder {
    pub fn new(framing: BodyFraming) -> Self {
        let (remaining, done) = match framing {
            BodyFraming::Empty => (0, true),
            BodyFraming::Length(n) => (n, false),
            BodyFraming::Chunked | BodyFraming::UntilClose => (0, false),
        };
        Self {
            framing,
            remaining,
            chunk: ChunkState::Size,
            done,
        }
    }

    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The body ended on its own framing, so the connection is positioned at
    /// the start of the next response.
    pub fn ended_cleanly(&self, buf: &BytesMut) -> bool {
        self.done && self.framing != BodyFraming::UntilClose && buf.is_empty()
    }

    /// Next piece of body data, or `None` once the body is complete.
    pub async fn next_chunk<R>(&mut self, reader: &mut R, buf: &mut BytesMut) -> Result<Option<Bytes>, NetError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        loop {
            if self.done {
                return Ok(None);
            }
            if let Some(data) = self.decode(buf)? {
                return Ok(Some(data));
            }
            if self.done {
                return Ok(None);
            }
            buf.reserve(READ_CHUNK);
            if reader.read_buf(buf).await? == 0 {
                return match self.framing {
                    BodyFraming::UntilClose => {
                        self.done = true;
                        Ok(None)
                    }
                    BodyFraming::Length(_) => Err(NetError::ContentLengthMismatch),
                    BodyFraming::Chunked => Err(NetError::IncompleteChunkedEncoding),
                    BodyFraming::Empty => Ok(None),
                };
            }
        }
    }

    /// Take whatever body bytes `buf` already holds. `Ok(None)` means more
    /// input is needed (or the body just finished).
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        match self.framing {
            BodyFraming::Empty => {
                self.done = true;
                Ok(None)
            }
            BodyFraming::UntilClose => {
                if buf.is_empty() {
                    return Ok(None);
                }
                Ok(Some(buf.split().freeze()))
            }
            BodyFraming::Length(_) => {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (buf.len() as u64).min(self.remaining) as usize;
                self.remaining -= take as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(Some(buf.split_to(take).freeze()))
            }
            BodyFraming::Chunked => self.decode_chunked(buf),
        }
    }

    fn decode_chunked(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        loop {
            match self.chunk {
                ChunkState::Size => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let size_field = line.split(|b| *b == b';').next().unwrap_or_default();
                    let size_str = std::str::from_utf8(size_field)
                        .map_err(|_| NetError::InvalidChunkedEncoding)?
                        .trim();
                    let size =
                        u64::from_str_radix(size_str, 16).map_err(|_| NetError::InvalidChunkedEncoding)?;
                    self.chunk = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(left) => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (buf.len() as u64).min(left) as usize;
                    let left = left - take as u64;
                    self.chunk = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(Some(buf.split_to(take).freeze()));
                }
                ChunkState::DataEnd => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    if !line.is_empty() {
                        return Err(NetError::InvalidChunkedEncoding);
                    }
                    self.chunk = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.done = true;
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Split one CRLF-terminated line off `buf`, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(NetError::InvalidChunkedEncoding),
        None => Ok(None),
    }
}
