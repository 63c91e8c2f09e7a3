//! Authenticated sessions and the in-memory session store.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

/// How a session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOrigin {
    /// Created through the session service and presented as a token or cookie.
    Token,
    /// Derived from a verified client certificate during the TLS handshake.
    MutualTls,
    /// Built for a single request from credentials carried in the request.
    Basic,
}

/// Server-side record identifying an authenticated caller.
#[derive(Debug)]
pub struct UserSession {
    /// Short identifier used in logs and the session collection.
    pub unique_id: String,
    /// Secret presented by the client (`X-Auth-Token` or `SESSION` cookie).
    pub session_token: String,
    /// Anti-CSRF token required alongside cookie authentication.
    pub csrf_token: String,
    pub username: String,
    pub client_ip: Option<IpAddr>,
    pub origin: SessionOrigin,
}

impl UserSession {
    /// Create a session with freshly generated identifiers.
    pub fn new(username: impl Into<String>, origin: SessionOrigin, client_ip: Option<IpAddr>) -> Self {
        let unique = Uuid::new_v4().simple().to_string();
        Self {
            unique_id: unique[..10].to_string(),
            session_token: Uuid::new_v4().simple().to_string(),
            csrf_token: Uuid::new_v4().simple().to_string(),
            username: username.into(),
            client_ip,
            origin,
        }
    }
}

/// Owner of all live sessions.
///
/// Connections only create and remove entries keyed by their own sessions.
pub trait SessionStore: Send + Sync + 'static {
    /// Register a session so later requests can present its token.
    fn insert(&self, session: Arc<UserSession>);

    /// Look up a session by the token the client presented.
    fn get_by_token(&self, token: &str) -> Option<Arc<UserSession>>;

    /// Remove a session. Removing an unknown session is a no-op.
    fn remove_session(&self, session: &UserSession);

    /// Number of live sessions.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A thread-safe session store keyed by session token.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    inner: DashMap<String, Arc<UserSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn insert(&self, session: Arc<UserSession>) {
        tracing::debug!(session_id = %session.unique_id, user = %session.username, "Session created");
        self.inner.insert(session.session_token.clone(), session);
    }

    fn get_by_token(&self, token: &str) -> Option<Arc<UserSession>> {
        self.inner.get(token).map(|r| Arc::clone(r.value()))
    }

    fn remove_session(&self, session: &UserSession) {
        if self.inner.remove(&session.session_token).is_some() {
            tracing::debug!(session_id = %session.unique_id, "Session removed");
        }
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
