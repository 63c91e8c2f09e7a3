//! The request value handed to handlers.
//!
//! # Responsibilities
//! - Build an `http::Request` from the parser's released message
//! - Carry the caller's session and resolved client address
//! - Answer the header questions the connection asks (keep-alive, upgrade)

use bytes::Bytes;
use http::header::{self, AsHeaderName, HeaderMap};
use http::{Method, Uri, Version};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::http::parser::Message;
use crate::security::session::UserSession;

/// Failure to turn a parsed message into a request value.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request target: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    #[error("failed to build request: {0}")]
    Build(#[from] http::Error),
}

/// A fully read HTTP request.
#[derive(Debug)]
pub struct Request {
    inner: http::Request<Bytes>,
    /// Session bound by authentication, if any.
    pub session: Option<Arc<UserSession>>,
    /// Peer address; empty when the socket could not report it.
    pub ip_address: Option<IpAddr>,
}

impl Request {
    /// Construct the request from the parser's released message.
    pub fn from_message(message: Message) -> Result<Self, RequestError> {
        let Message { head, body } = message;
        let uri: Uri = head.target.parse()?;
        let mut inner = http::Request::builder()
            .method(head.method)
            .uri(uri)
            .version(head.version)
            .body(body)?;
        *inner.headers_mut() = head.headers;
        Ok(Self::from_http(inner))
    }

    /// Wrap an already-built `http::Request`.
    pub fn from_http(inner: http::Request<Bytes>) -> Self {
        Self {
            inner,
            session: None,
            ip_address: None,
        }
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// The request target as sent (path plus query).
    pub fn target(&self) -> &str {
        self.inner
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }

    pub fn path(&self) -> &str {
        self.inner.uri().path()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Header value as a string, empty when absent or not valid text.
    pub fn header_value<K: AsHeaderName>(&self, name: K) -> &str {
        self.inner
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn body(&self) -> &Bytes {
        self.inner.body()
    }

    /// Whether the client asked to keep the connection open after this request.
    pub fn keep_alive(&self) -> bool {
        let headers = self.inner.headers();
        match self.inner.version() {
            Version::HTTP_09 | Version::HTTP_10 => connection_has_token(headers, "keep-alive"),
            _ => !connection_has_token(headers, "close"),
        }
    }

    /// Whether this is an HTTP/1.1 protocol upgrade request.
    pub fn is_upgrade(&self) -> bool {
        connection_has_token(self.inner.headers(), "upgrade")
            && self.inner.headers().contains_key(header::UPGRADE)
    }

    pub fn inner(&self) -> &http::Request<Bytes> {
        &self.inner
    }

    pub fn into_inner(self) -> http::Request<Bytes> {
        self.inner
    }
}

/// Check the comma separated `Connection` header for a token.
pub fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether an `Accept` header explicitly lists the media type. Wildcards do not count.
pub fn accepts_media_type(accept: &str, media_type: &str) -> bool {
    accept
        .split(',')
        .filter_map(|range| range.split(';').next())
        .map(str::trim)
        .any(|range| range.eq_ignore_ascii_case(media_type))
}
