//! Request authentication.
//!
//! # Responsibilities
//! - Resolve the caller's session from a client certificate, token or cookie
//! - Decide which paths may be reached without a session
//! - Extract the user named by Basic credentials for lockout handling
//!
//! # Data Flow
//! ```text
//! headers parsed
//!     → mTLS session bound at handshake?    → use it
//!     → X-Auth-Token matches a session?     → use it
//!     → SESSION cookie (+ X-XSRF-TOKEN)     → use it
//!     → none                                → unauthenticated
//! ```

use base64::Engine;
use futures_util::future::BoxFuture;
use http::header::{self, HeaderMap};
use http::Method;
use rustls::pki_types::CertificateDer;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use crate::http::request::Request;
use crate::http::response::Response;
use crate::security::session::{SessionOrigin, SessionStore, UserSession};
use crate::security::unauthorized::send_unauthorized;

const DEFAULT_GET_ALLOWLIST: &[&str] = &[
    "/redfish",
    "/redfish/",
    "/redfish/v1",
    "/redfish/v1/",
    "/redfish/v1/odata",
    "/redfish/v1/odata/",
];

const DEFAULT_POST_ALLOWLIST: &[&str] = &[
    "/redfish/v1/SessionService/Sessions",
    "/redfish/v1/SessionService/Sessions/",
    "/redfish/v1/SessionService/Sessions/Members",
    "/redfish/v1/SessionService/Sessions/Members/",
    "/login",
];

/// Authentication hooks the connection calls.
pub trait Authenticator: Send + Sync + 'static {
    /// Whether protected paths require a session at all.
    fn enabled(&self) -> bool;

    /// Find the session the request belongs to, if any.
    fn authenticate(
        &self,
        ip: Option<IpAddr>,
        method: &Method,
        headers: &HeaderMap,
        mtls_session: Option<&Arc<UserSession>>,
    ) -> Option<Arc<UserSession>>;

    /// Paths that may be reached without a session.
    fn is_on_allowlist(&self, path: &str, method: &Method) -> bool;

    /// Map a strictly verified client certificate to a session.
    fn verify_mtls_user(
        &self,
        _ip: Option<IpAddr>,
        _end_entity: &CertificateDer<'_>,
    ) -> Option<Arc<UserSession>> {
        None
    }

    /// Response for a request that needed a session and had none.
    fn unauthorized(&self, path: &str, x_requested_with: &str, accept: &str) -> Response {
        send_unauthorized(path, x_requested_with, accept)
    }

    /// Give a named but unauthorized user's request to the lockout policy.
    fn handle_account_locked(
        &self,
        _username: &str,
        _req: Request,
        res: Response,
    ) -> BoxFuture<'static, Response> {
        Box::pin(async move { res })
    }
}

type CertificateMapper = dyn Fn(&CertificateDer<'_>) -> Option<String> + Send + Sync;

/// Token and cookie authentication against a [`SessionStore`].
pub struct SessionAuthenticator {
    sessions: Arc<dyn SessionStore>,
    enabled: bool,
    extra_allowlist: HashSet<String>,
    mtls_mapper: Option<Box<CertificateMapper>>,
}

impl SessionAuthenticator {
    pub fn new(sessions: Arc<dyn SessionStore>, enabled: bool) -> Self {
        Self {
            sessions,
            enabled,
            extra_allowlist: HashSet::new(),
            mtls_mapper: None,
        }
    }

    /// Additional paths reachable without a session for `GET`.
    pub fn with_allowlist<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_allowlist.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Install the rule that turns a client certificate into a user name.
    pub fn with_mtls_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&CertificateDer<'_>) -> Option<String> + Send + Sync + 'static,
    {
        self.mtls_mapper = Some(Box::new(mapper));
        self
    }

    fn from_token(&self, headers: &HeaderMap) -> Option<Arc<UserSession>> {
        let token = headers.get("x-auth-token")?.to_str().ok()?;
        self.sessions.get_by_token(token)
    }

    fn from_cookie(&self, method: &Method, headers: &HeaderMap) -> Option<Arc<UserSession>> {
        let token = session_cookie(headers)?;
        let session = self.sessions.get_by_token(token)?;

        // Cookies ride along automatically; mutating requests must echo the CSRF token.
        if method != Method::GET && method != Method::HEAD {
            let csrf = headers.get("x-xsrf-token")?.to_str().ok()?;
            if csrf.is_empty() || csrf != session.csrf_token {
                tracing::debug!(session = %session.unique_id, "CSRF token mismatch");
                return None;
            }
        }
        Some(session)
    }
}

impl Authenticator for SessionAuthenticator {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn authenticate(
        &self,
        _ip: Option<IpAddr>,
        method: &Method,
        headers: &HeaderMap,
        mtls_session: Option<&Arc<UserSession>>,
    ) -> Option<Arc<UserSession>> {
        if let Some(session) = mtls_session {
            return Some(Arc::clone(session));
        }
        self.from_token(headers)
            .or_else(|| self.from_cookie(method, headers))
    }

    fn is_on_allowlist(&self, path: &str, method: &Method) -> bool {
        if method == Method::GET {
            DEFAULT_GET_ALLOWLIST.iter().any(|p| *p == path) || self.extra_allowlist.contains(path)
        } else if method == Method::POST {
            DEFAULT_POST_ALLOWLIST.iter().any(|p| *p == path)
        } else {
            false
        }
    }

    fn verify_mtls_user(
        &self,
        ip: Option<IpAddr>,
        end_entity: &CertificateDer<'_>,
    ) -> Option<Arc<UserSession>> {
        let username = (self.mtls_mapper.as_ref()?)(end_entity)?;
        let session = Arc::new(UserSession::new(username, SessionOrigin::MutualTls, ip));
        self.sessions.insert(Arc::clone(&session));
        tracing::info!(user = %session.username, session = %session.unique_id, "Client certificate bound to session");
        Some(session)
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == "SESSION")
        .map(|(_, value)| value)
}

/// Subject common name of a DER certificate, used as the default mTLS user name.
pub fn common_name(cert: &CertificateDer<'_>) -> Option<String> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    let name = parsed.subject().iter_common_name().next()?.as_str().ok()?;
    if name.is_empty() {
        return None;
    }
    Some(name.to_string())
}

/// User name from `Authorization: Basic`, if the credentials decode.
pub fn basic_auth_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, _password) = decoded.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some(user.to_string())
}
