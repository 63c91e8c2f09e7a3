//! Response construction and serialization.
//!
//! # Responsibilities
//! - Build simple status responses for protocol errors
//! - Append the fields every response carries (keep-alive, date, length)
//! - Serialize a response into HTTP/1.1 wire bytes
//!
//! # Design Decisions
//! - The serialized form only exists for the duration of a write
//! - Security headers are added unless a handler already set them

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::StatusCode;

/// Responses are fully buffered.
pub type Response = http::Response<Bytes>;

/// A response with the given status and an empty body.
pub fn status_response(status: StatusCode) -> Response {
    let mut res = Response::new(Bytes::new());
    *res.status_mut() = status;
    res
}

/// Append keep-alive policy, `Date`, `Content-Length` and security headers.
pub fn complete_response_fields(res: &mut Response, keep_alive: bool, date: &str) {
    let status = res.status();
    let body_len = res.body().len();
    let headers = res.headers_mut();

    headers.insert(
        header::CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );
    if let Ok(value) = HeaderValue::from_str(date) {
        headers.insert(header::DATE, value);
    }
    if status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED {
        headers.remove(header::CONTENT_LENGTH);
    } else {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body_len));
    }

    add_security_headers(res);
}

fn add_security_headers(res: &mut Response) {
    let headers = res.headers_mut();
    let defaults = [
        (header::STRICT_TRANSPORT_SECURITY, "max-age=31536000; includeSubdomains"),
        (header::X_FRAME_OPTIONS, "DENY"),
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::PRAGMA, "no-cache"),
        (header::CACHE_CONTROL, "no-store, max-age=0"),
    ];
    for (name, value) in defaults {
        if !headers.contains_key(&name) {
            headers.insert(name, HeaderValue::from_static(value));
        }
    }
}

/// Encode the status line, header block and (unless `head_only`) the body.
pub fn serialize(res: &Response, head_only: bool) -> Vec<u8> {
    let status = res.status();
    let mut out = Vec::with_capacity(256 + res.body().len());

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in res.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    if !head_only {
        out.extend_from_slice(res.body());
    }
    out
}
