//! Per-connection HTTP/1.1 state machine.
//!
//! # Data Flow
//! ```text
//! start ─ over ceiling? ─────────────────────────────────────▶ dropped
//!   │
//!   ├─ TLS: handshake ─ client cert strictly valid? → mTLS session
//!   │        └─ ALPN h2 ─────────────────────────────────────▶ HTTP/2 hand-off
//!   ▼
//! ReadingHeaders ─ authenticate ─ unauthenticated and > 4 KiB declared ─▶ Closed
//!   ▼
//! ReadingBody (deadline cancelled once authenticated)
//!   ▼
//! Dispatching ─ no session on protected path → unauthorized / lockout
//!   │         ─ WebSocket / SSE / attachment ───────────────▶ upgrade hand-off
//!   ▼
//! Writing ─ keep-alive → Resetting → ReadingHeaders
//!         ─ otherwise  → Closed
//! ```
//!
//! # Design Decisions
//! - One task per connection drives every phase in order, so at most one
//!   read or write is outstanding on the socket
//! - The deadline guards each wait; firing always closes the connection
//! - Every failure is logged and ends this connection only

use bytes::BytesMut;
use http::header;
use http::{Method, StatusCode, Version};
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ServerConfig;
use crate::handler::{RequestHandler, UpgradeOutcome};
use crate::http::date::DateCache;
use crate::http::deadline::Deadline;
use crate::http::http2::Http2Handoff;
use crate::http::parser::{ParseError, RequestParser};
use crate::http::request::Request;
use crate::http::response::{complete_response_fields, serialize, status_response, Response};
use crate::http::upgrade;
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
use crate::net::tls::{TlsContext, ALPN_H2};
use crate::net::transport::{BoxedTransport, Transport};
use crate::observability::metrics;
use crate::security::auth::{basic_auth_user, Authenticator};
use crate::security::limits::{body_limit_bytes, LOGGED_OUT_BODY_LIMIT};
use crate::security::session::{SessionStore, UserSession};

const READ_CHUNK: usize = 4096;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Limits every connection is created with.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Body limit for authenticated callers, in bytes.
    pub body_limit: u64,
    /// Deadline for each handshake, read and write phase.
    pub response_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            body_limit: body_limit_bytes(config.limits.body_limit_mb),
            response_timeout: Duration::from_secs(config.timeouts.response_secs),
        }
    }
}

/// Collaborators shared by every connection of a server.
#[derive(Clone)]
pub struct ConnectionContext {
    pub handler: Arc<dyn RequestHandler>,
    pub auth: Arc<dyn Authenticator>,
    pub sessions: Arc<dyn SessionStore>,
    /// HTTP/2 server; `None` disables the ALPN hand-off.
    pub http2: Option<Arc<dyn Http2Handoff>>,
    pub settings: Arc<ConnectionSettings>,
    pub tracker: ConnectionTracker,
    pub date: DateCache,
}

enum Phase {
    ReadHeaders,
    ReadBody,
    Handle,
    Write(Response),
    Reset,
    Close,
    /// The stream was handed off or abandoned; no further I/O.
    Finished,
}

enum Read {
    Data,
    Eof,
    Failed(io::Error),
    TimedOut,
}

pub struct Connection<S: Transport> {
    id: ConnectionId,
    stream: Option<S>,
    tls: Option<Arc<TlsContext>>,
    ctx: ConnectionContext,
    buffer: BytesMut,
    parser: Option<RequestParser>,
    session: Option<Arc<UserSession>>,
    mtls_session: Option<Arc<UserSession>>,
    ip: Option<IpAddr>,
    keep_alive: bool,
    head_only: bool,
    deadline: Deadline,
    closed: bool,
    _guard: ConnectionGuard,
}

impl<S: Transport> Connection<S> {
    /// Wrap an accepted stream. Counts toward the global connection total
    /// until dropped. `tls` is the context current at accept time.
    pub fn new(stream: S, tls: Option<Arc<TlsContext>>, ctx: &ConnectionContext) -> Self {
        let guard = ctx.tracker.track();
        Self {
            id: guard.id(),
            stream: Some(stream),
            tls,
            ctx: ctx.clone(),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            parser: Some(RequestParser::new(ctx.settings.body_limit)),
            session: None,
            mtls_session: None,
            ip: None,
            keep_alive: false,
            head_only: false,
            deadline: Deadline::new(ctx.settings.response_timeout),
            closed: false,
            _guard: guard,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drive the connection until it closes or is handed off.
    pub async fn start(mut self) {
        if self.ctx.tracker.over_limit() {
            tracing::error!(
                connection_id = %self.id,
                active = self.ctx.tracker.active_count(),
                max = self.ctx.tracker.max_connections(),
                "Max connection count exceeded"
            );
            metrics::record_connection_rejected();
            return;
        }

        self.resolve_ip();
        self.start_deadline();

        let mut phase = Phase::ReadHeaders;
        if let Some(tls) = self.tls.clone() {
            if !self.handshake(&tls).await {
                return;
            }
            phase = self.after_handshake().await;
        }
        self.run(phase).await;
    }

    async fn run(&mut self, mut phase: Phase) {
        loop {
            phase = match phase {
                Phase::ReadHeaders => self.read_headers().await,
                Phase::ReadBody => self.read_body().await,
                Phase::Handle => self.handle().await,
                Phase::Write(res) => self.write(res).await,
                Phase::Reset => self.reset(),
                Phase::Close => {
                    self.close().await;
                    return;
                }
                Phase::Finished => return,
            };
        }
    }

    /// TLS handshake under the deadline. A failure drops the socket silently.
    async fn handshake(&mut self, tls: &Arc<TlsContext>) -> bool {
        let Some(stream) = self.stream.take() else {
            return false;
        };
        match self.deadline.guard(stream.handshake(Arc::clone(tls))).await {
            Ok(Ok(stream)) => self.stream = Some(stream),
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %self.id, error = %e, "TLS handshake failed");
                return false;
            }
            Err(_) => {
                self.timed_out();
                return false;
            }
        }
        self.bind_client_certificate(tls);
        true
    }

    /// The handshake let any client through; only a chain that passes strict
    /// verification and maps to a user yields a session.
    fn bind_client_certificate(&mut self, tls: &TlsContext) {
        if !tls.mutual_tls() || !self.ctx.auth.enabled() {
            return;
        }
        let Some(chain) = self.stream.as_ref().and_then(|s| s.peer_certificates()) else {
            return;
        };
        if !tls.verify_client(chain) {
            tracing::debug!(connection_id = %self.id, "Client certificate not trusted");
            return;
        }
        if let Some(end_entity) = chain.first() {
            self.mtls_session = self.ctx.auth.verify_mtls_user(self.ip, end_entity);
        }
    }

    async fn after_handshake(&mut self) -> Phase {
        let Some(http2) = self.ctx.http2.clone() else {
            return Phase::ReadHeaders;
        };
        let negotiated = self.stream.as_ref().and_then(|s| s.alpn_protocol());
        if negotiated != Some(ALPN_H2) {
            return Phase::ReadHeaders;
        }
        let Some(stream) = self.stream.take() else {
            return Phase::Finished;
        };

        tracing::debug!(connection_id = %self.id, "ALPN selected h2");
        self.deadline.cancel();
        http2
            .serve(
                Box::new(stream),
                Arc::clone(&self.ctx.handler),
                self.ctx.date.clone(),
                self.mtls_session.clone(),
            )
            .await;
        Phase::Finished
    }

    async fn read_headers(&mut self) -> Phase {
        self.start_deadline();
        let body_limit = self.ctx.settings.body_limit;

        loop {
            let parser = self
                .parser
                .get_or_insert_with(|| RequestParser::new(body_limit));
            match parser.parse_head(&mut self.buffer) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => return self.protocol_error(e),
            }

            match self.read_some().await {
                Read::Data => {}
                Read::Eof => {
                    self.deadline.cancel();
                    if self.buffer.is_empty() {
                        tracing::warn!(connection_id = %self.id, "Peer closed connection");
                    } else {
                        tracing::error!(connection_id = %self.id, "Peer closed connection mid-request");
                    }
                    return Phase::Close;
                }
                Read::Failed(e) => {
                    self.deadline.cancel();
                    tracing::error!(connection_id = %self.id, error = %e, "Error while reading headers");
                    return Phase::Close;
                }
                Read::TimedOut => {
                    self.timed_out();
                    return Phase::Close;
                }
            }
        }

        self.resolve_ip();
        self.authenticate_head()
    }

    /// Bind a session from the headers and settle the body limit.
    fn authenticate_head(&mut self) -> Phase {
        let auth = Arc::clone(&self.ctx.auth);
        let Some(parser) = self.parser.as_mut() else {
            return Phase::Close;
        };

        if auth.enabled() {
            if let Some(head) = parser.head() {
                self.session =
                    auth.authenticate(self.ip, &head.method, &head.headers, self.mtls_session.as_ref());
            }
            if self.session.is_none() {
                if let Some(length) = parser
                    .content_length()
                    .filter(|n| *n > LOGGED_OUT_BODY_LIMIT)
                {
                    tracing::debug!(
                        connection_id = %self.id,
                        content_length = length,
                        "Content length greater than limit"
                    );
                    return Phase::Close;
                }
                parser.set_body_limit(LOGGED_OUT_BODY_LIMIT);
            }
        }

        if let Err(e) = parser.check_declared_length() {
            return self.protocol_error(e);
        }
        if parser.is_done() {
            Phase::Handle
        } else {
            Phase::ReadBody
        }
    }

    async fn read_body(&mut self) -> Phase {
        // Authenticated callers may stream slowly; everyone else gets a fresh deadline per read.
        if self.session.is_some() {
            self.deadline.cancel();
        }

        loop {
            let Some(parser) = self.parser.as_mut() else {
                return Phase::Close;
            };
            if let Err(e) = parser.parse_body(&mut self.buffer) {
                return self.protocol_error(e);
            }
            if parser.is_done() {
                self.deadline.cancel();
                return Phase::Handle;
            }

            self.start_deadline();
            match self.read_some().await {
                Read::Data => {}
                Read::Eof => {
                    tracing::error!(connection_id = %self.id, "Peer closed connection mid-body");
                    return Phase::Close;
                }
                Read::Failed(e) => {
                    tracing::error!(connection_id = %self.id, error = %e, "Error while reading body");
                    return Phase::Close;
                }
                Read::TimedOut => {
                    self.timed_out();
                    return Phase::Close;
                }
            }
        }
    }

    async fn handle(&mut self) -> Phase {
        let Some(message) = self.parser.take().and_then(RequestParser::release) else {
            return Phase::Close;
        };
        let mut req = match Request::from_message(message) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!(connection_id = %self.id, error = %e, "Request decode failed");
                self.keep_alive = false;
                return Phase::Write(status_response(StatusCode::BAD_REQUEST));
            }
        };

        self.keep_alive = req.keep_alive();
        self.head_only = req.method() == Method::HEAD;

        if req.version() == Version::HTTP_11 && !req.headers().contains_key(header::HOST) {
            tracing::debug!(connection_id = %self.id, "HTTP/1.1 request without Host");
            return Phase::Write(status_response(StatusCode::BAD_REQUEST));
        }

        self.resolve_ip();
        req.ip_address = self.ip;
        req.session = self.session.clone();

        tracing::info!(
            connection_id = %self.id,
            method = %req.method(),
            version = ?req.version(),
            url = %req.target(),
            ip = ?self.ip,
            "Request"
        );

        let auth = Arc::clone(&self.ctx.auth);
        if auth.enabled()
            && req.session.is_none()
            && !auth.is_on_allowlist(req.path(), req.method())
        {
            let res = auth.unauthorized(
                req.path(),
                req.header_value("x-requested-with"),
                req.header_value(header::ACCEPT),
            );
            return match basic_auth_user(req.headers()) {
                Some(user) => Phase::Write(auth.handle_account_locked(&user, req, res).await),
                None => Phase::Write(res),
            };
        }

        if let Some(kind) = upgrade::detect(&req) {
            tracing::debug!(connection_id = %self.id, ?kind, "Upgrading connection");
            self.deadline.cancel();
            let Some(stream) = self.stream.take() else {
                return Phase::Finished;
            };
            return match self.ctx.handler.handle_upgrade(req, Box::new(stream)).await {
                UpgradeOutcome::Upgraded => Phase::Finished,
                UpgradeOutcome::Rejected { response, stream } => {
                    self.send_rejection(stream, response).await;
                    Phase::Finished
                }
            };
        }

        Phase::Write(self.ctx.handler.handle(req).await)
    }

    async fn write(&mut self, mut res: Response) -> Phase {
        complete_response_fields(&mut res, self.keep_alive, &self.ctx.date.get());
        let status = res.status();
        let wire = serialize(&res, self.head_only);
        drop(res);

        self.start_deadline();
        let Some(stream) = self.stream.as_mut() else {
            return Phase::Finished;
        };
        let result = self.deadline.guard(write_all_retrying(stream, &wire)).await;
        self.deadline.cancel();
        metrics::record_request(status.as_u16());

        match result {
            Ok(Ok(())) => {
                tracing::debug!(
                    connection_id = %self.id,
                    status = status.as_u16(),
                    bytes = wire.len(),
                    "Response written"
                );
                if self.keep_alive {
                    Phase::Reset
                } else {
                    Phase::Close
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %self.id, error = %e, "Write failed, abandoning connection");
                Phase::Finished
            }
            Err(_) => {
                self.timed_out();
                Phase::Close
            }
        }
    }

    /// Write the error an upgrade handler gave back, then shut the stream.
    async fn send_rejection(&mut self, mut stream: BoxedTransport, mut res: Response) {
        complete_response_fields(&mut res, false, &self.ctx.date.get());
        let wire = serialize(&res, self.head_only);
        metrics::record_request(res.status().as_u16());

        self.start_deadline();
        match self.deadline.guard(write_all_retrying(&mut stream, &wire)).await {
            Ok(Ok(())) => {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await;
            }
            Ok(Err(e)) => {
                tracing::debug!(connection_id = %self.id, error = %e, "Failed to send upgrade rejection");
            }
            Err(_) => self.timed_out(),
        }
        self.deadline.cancel();
    }

    /// Prepare for the next request on a kept-alive connection. Bytes the
    /// client already pipelined stay buffered.
    fn reset(&mut self) -> Phase {
        self.parser = Some(RequestParser::new(self.ctx.settings.body_limit));
        self.session = None;
        self.keep_alive = false;
        self.head_only = false;
        Phase::ReadHeaders
    }

    /// Shut the transport down. Safe to call more than once.
    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.deadline.cancel();

        if let Some(mut stream) = self.stream.take() {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, stream.shutdown()).await;
            if stream.is_tls() {
                self.release_mtls_session();
            }
        }
        tracing::debug!(connection_id = %self.id, "Connection closed");
    }

    fn release_mtls_session(&mut self) {
        if let Some(session) = self.mtls_session.take() {
            tracing::debug!(connection_id = %self.id, session = %session.unique_id, "Removing TLS session");
            self.ctx.sessions.remove_session(&session);
        }
    }

    async fn read_some(&mut self) -> Read {
        let Some(stream) = self.stream.as_mut() else {
            return Read::Eof;
        };
        self.buffer.reserve(READ_CHUNK);
        match self.deadline.guard(stream.read_buf(&mut self.buffer)).await {
            Ok(Ok(0)) => Read::Eof,
            Ok(Ok(_)) => Read::Data,
            Ok(Err(e)) => Read::Failed(e),
            Err(_) => Read::TimedOut,
        }
    }

    /// Arm the deadline unless the caller is authenticated.
    fn start_deadline(&mut self) {
        self.deadline.cancel();
        if self.session.is_none() {
            self.deadline.start();
        }
    }

    fn timed_out(&mut self) {
        self.deadline.cancel();
        tracing::warn!(connection_id = %self.id, "Connection timed out, closing");
        metrics::record_timeout();
    }

    fn resolve_ip(&mut self) {
        match self.stream.as_ref().map(|s| s.peer_addr()) {
            Some(Ok(addr)) => self.ip = Some(addr.ip()),
            Some(Err(e)) => tracing::debug!(connection_id = %self.id, error = %e, "Unable to get client IP"),
            None => {}
        }
    }

    fn protocol_error(&mut self, e: ParseError) -> Phase {
        let status = match e {
            ParseError::HeaderTooLarge(_) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ParseError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        tracing::debug!(connection_id = %self.id, error = %e, status = status.as_u16(), "Rejecting request");
        self.parser = None;
        self.keep_alive = false;
        self.head_only = false;
        Phase::Write(status_response(status))
    }
}

impl<S: Transport> Drop for Connection<S> {
    fn drop(&mut self) {
        // Abandoned and handed-off connections never reach close().
        self.release_mtls_session();
    }
}

/// Write everything, retrying writes the transport reports as transient.
async fn write_all_retrying<W>(stream: &mut W, mut data: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    while !data.is_empty() {
        match stream.write(data).await {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
    stream.flush().await
}
