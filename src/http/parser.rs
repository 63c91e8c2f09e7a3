//! Incremental HTTP/1.1 request parser.
//!
//! # Responsibilities
//! - Parse the request line and header fields once they are fully buffered
//! - Enforce the header-section limit and the (adjustable) body limit
//! - Decode `Content-Length` and `chunked` bodies across partial reads
//!
//! # Design Decisions
//! - The parser consumes bytes from the connection buffer; anything left
//!   over belongs to the next request on the connection
//! - A declared length is checked against the body limit by the caller once
//!   it has settled which limit applies, before any body byte is read

use bytes::{Buf, Bytes, BytesMut};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, Version};
use thiserror::Error;

use crate::security::limits::HTTP_HEADER_LIMIT;

const MAX_HEADERS: usize = 100;
const MAX_CHUNK_LINE: usize = 1024;

/// Errors produced while parsing a request.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("header section exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: u64 },

    #[error("invalid content-length")]
    InvalidContentLength,

    #[error("invalid chunked encoding")]
    InvalidChunk,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::TooManyHeaders => ParseError::HeaderTooLarge(HTTP_HEADER_LIMIT),
            other => ParseError::Malformed(other.to_string()),
        }
    }
}

/// The parsed request line and header fields.
#[derive(Debug, Clone)]
pub struct Head {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

/// A complete request as released by the parser.
#[derive(Debug)]
pub struct Message {
    pub head: Head,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyDecoder {
    Length(u64),
    Chunked(ChunkState),
}

/// Parser state for one request.
#[derive(Debug)]
pub struct RequestParser {
    header_limit: usize,
    body_limit: u64,
    head: Option<Head>,
    content_length: Option<u64>,
    decoder: Option<BodyDecoder>,
    body: BytesMut,
    done: bool,
}

impl RequestParser {
    /// Create a parser with the fixed header limit and the given body limit.
    pub fn new(body_limit: u64) -> Self {
        Self {
            header_limit: HTTP_HEADER_LIMIT,
            body_limit,
            head: None,
            content_length: None,
            decoder: None,
            body: BytesMut::new(),
            done: false,
        }
    }

    pub fn body_limit(&self) -> u64 {
        self.body_limit
    }

    /// Change the body limit. Applies to body bytes not yet decoded.
    pub fn set_body_limit(&mut self, limit: u64) {
        self.body_limit = limit;
    }

    pub fn header_limit(&self) -> usize {
        self.header_limit
    }

    pub fn head(&self) -> Option<&Head> {
        self.head.as_ref()
    }

    /// Declared `Content-Length`, if the request carried one.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Fail if the declared `Content-Length` is over the current body limit.
    pub fn check_declared_length(&self) -> Result<(), ParseError> {
        match self.content_length {
            Some(n) if n > self.body_limit => Err(ParseError::BodyTooLarge {
                limit: self.body_limit,
            }),
            _ => Ok(()),
        }
    }

    /// Whether the whole message (head and body) has been parsed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Try to parse the header section from `buf`.
    ///
    /// Returns `Ok(true)` once the head is complete; the head bytes are
    /// consumed from `buf`. Returns `Ok(false)` when more data is needed.
    pub fn parse_head(&mut self, buf: &mut BytesMut) -> Result<bool, ParseError> {
        if self.head.is_some() {
            return Ok(true);
        }

        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut storage);
        let consumed = match req.parse(buf)? {
            httparse::Status::Complete(n) => n,
            httparse::Status::Partial => {
                if buf.len() > self.header_limit {
                    return Err(ParseError::HeaderTooLarge(self.header_limit));
                }
                return Ok(false);
            }
        };
        if consumed > self.header_limit {
            return Err(ParseError::HeaderTooLarge(self.header_limit));
        }

        let method = req
            .method
            .ok_or_else(|| ParseError::Malformed("missing method".into()))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ParseError::Malformed(format!("invalid method {method}")))?;
        let target = req
            .path
            .ok_or_else(|| ParseError::Malformed("missing target".into()))?
            .to_string();
        let version = match req.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        };

        let mut headers = HeaderMap::with_capacity(req.headers.len());
        for h in req.headers.iter() {
            let name = HeaderName::from_bytes(h.name.as_bytes())
                .map_err(|_| ParseError::Malformed(format!("invalid header name {}", h.name)))?;
            let value = HeaderValue::from_bytes(h.value)
                .map_err(|_| ParseError::Malformed(format!("invalid value for {}", h.name)))?;
            headers.append(name, value);
        }

        let decoder = self.body_decoder(&headers)?;
        buf.advance(consumed);

        self.head = Some(Head {
            method,
            target,
            version,
            headers,
        });
        match decoder {
            None => self.done = true,
            Some(decoder) => self.decoder = Some(decoder),
        }
        Ok(true)
    }

    fn body_decoder(&mut self, headers: &HeaderMap) -> Result<Option<BodyDecoder>, ParseError> {
        if let Some(te) = headers.get(header::TRANSFER_ENCODING) {
            let te = te.to_str().map_err(|_| ParseError::UnsupportedTransferEncoding)?;
            let last = te.rsplit(',').next().map(str::trim).unwrap_or("");
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(ParseError::UnsupportedTransferEncoding);
            }
            return Ok(Some(BodyDecoder::Chunked(ChunkState::Size)));
        }

        let mut length: Option<u64> = None;
        for value in headers.get_all(header::CONTENT_LENGTH) {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ParseError::InvalidContentLength)?;
            if length.is_some_and(|l| l != parsed) {
                return Err(ParseError::InvalidContentLength);
            }
            length = Some(parsed);
        }

        self.content_length = length;
        match length {
            Some(0) | None => Ok(None),
            Some(n) => Ok(Some(BodyDecoder::Length(n))),
        }
    }

    /// Decode as much body as `buf` holds, consuming it.
    pub fn parse_body(&mut self, buf: &mut BytesMut) -> Result<(), ParseError> {
        while !self.done {
            let Some(decoder) = self.decoder else {
                self.done = true;
                break;
            };
            match decoder {
                BodyDecoder::Length(remaining) => {
                    if buf.is_empty() {
                        break;
                    }
                    let take = remaining.min(buf.len() as u64) as usize;
                    self.append_body(buf, take)?;
                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        self.finish();
                    } else {
                        self.decoder = Some(BodyDecoder::Length(remaining));
                    }
                }
                BodyDecoder::Chunked(state) => {
                    if !self.decode_chunk(state, buf)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Advance the chunked decoder by one step. Returns `false` when more input is needed.
    fn decode_chunk(&mut self, state: ChunkState, buf: &mut BytesMut) -> Result<bool, ParseError> {
        match state {
            ChunkState::Size => {
                let Some(line) = take_line(buf)? else {
                    return Ok(false);
                };
                let size = line[..].split(|b: &u8| *b == b';').next().unwrap_or(&[]);
                let size = std::str::from_utf8(size)
                    .ok()
                    .and_then(|s| u64::from_str_radix(s.trim(), 16).ok())
                    .ok_or(ParseError::InvalidChunk)?;
                if size == 0 {
                    self.decoder = Some(BodyDecoder::Chunked(ChunkState::Trailers));
                } else {
                    if (self.body.len() as u64).saturating_add(size) > self.body_limit {
                        return Err(ParseError::BodyTooLarge {
                            limit: self.body_limit,
                        });
                    }
                    self.decoder = Some(BodyDecoder::Chunked(ChunkState::Data(size)));
                }
                Ok(true)
            }
            ChunkState::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(false);
                }
                let take = remaining.min(buf.len() as u64) as usize;
                self.append_body(buf, take)?;
                let remaining = remaining - take as u64;
                self.decoder = Some(BodyDecoder::Chunked(if remaining == 0 {
                    ChunkState::DataEnd
                } else {
                    ChunkState::Data(remaining)
                }));
                Ok(true)
            }
            ChunkState::DataEnd => {
                if buf.len() < 2 {
                    return Ok(false);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(ParseError::InvalidChunk);
                }
                buf.advance(2);
                self.decoder = Some(BodyDecoder::Chunked(ChunkState::Size));
                Ok(true)
            }
            ChunkState::Trailers => {
                let Some(line) = take_line(buf)? else {
                    return Ok(false);
                };
                if line.is_empty() {
                    self.finish();
                }
                Ok(true)
            }
        }
    }

    fn append_body(&mut self, buf: &mut BytesMut, len: usize) -> Result<(), ParseError> {
        if (self.body.len() + len) as u64 > self.body_limit {
            return Err(ParseError::BodyTooLarge {
                limit: self.body_limit,
            });
        }
        self.body.extend_from_slice(&buf[..len]);
        buf.advance(len);
        Ok(())
    }

    fn finish(&mut self) {
        self.decoder = None;
        self.done = true;
    }

    /// Release the parsed message. Returns `None` if the head was never parsed.
    pub fn release(self) -> Option<Message> {
        let head = self.head?;
        Some(Message {
            head,
            body: self.body.freeze(),
        })
    }
}

/// Split one CRLF-terminated line off `buf`, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(ParseError::InvalidChunk),
        None => Ok(None),
    }
}
