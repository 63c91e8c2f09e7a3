//! Responses for requests that reached a protected path without a session.

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::StatusCode;

use crate::http::request::accepts_media_type;
use crate::http::response::{status_response, Response};

/// Build the unauthorized response.
///
/// Browsers asking for a page outside the Redfish tree are sent to the login
/// page. Everyone else gets a 401, with a Basic challenge unless the request
/// came from script (`X-Requested-With` set), so browsers do not pop a dialog.
pub fn send_unauthorized(path: &str, x_requested_with: &str, accept: &str) -> Response {
    let is_redfish = path == "/redfish" || path.starts_with("/redfish/");
    if !is_redfish && accepts_media_type(accept, "text/html") {
        let mut res = status_response(StatusCode::TEMPORARY_REDIRECT);
        if let Ok(location) = HeaderValue::from_str(&format!("/#/login?next={path}")) {
            res.headers_mut().insert(header::LOCATION, location);
        }
        return res;
    }

    let mut res = status_response(StatusCode::UNAUTHORIZED);
    if x_requested_with.is_empty() {
        res.headers_mut()
            .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    }
    *res.body_mut() = Bytes::from_static(b"Unauthorized");
    res
}
