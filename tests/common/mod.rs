//! Shared utilities for integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use bmcweb_core::handler::{RequestHandler, UpgradeOutcome};
use bmcweb_core::http::request::Request;
use bmcweb_core::http::response::{status_response, Response};
use bmcweb_core::http::{ConnectionContext, ConnectionSettings, DateCache, Http2Handoff};
use bmcweb_core::net::connection::ConnectionTracker;
use bmcweb_core::net::tls::TlsContext;
use bmcweb_core::net::transport::{BoxedTransport, Transport};
use bmcweb_core::security::auth::{common_name, Authenticator};
use bmcweb_core::security::session::{MemorySessionStore, SessionOrigin, SessionStore, UserSession};

pub const GOOD_TOKEN: &str = "good-token";
pub const LOCKED_STATUS: StatusCode = StatusCode::FORBIDDEN;

pub fn fixture() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/server.pem")
}

/// One end of an in-memory socket that can pretend to be TLS.
pub struct MockStream {
    inner: DuplexStream,
    peer: SocketAddr,
    alpn: Option<Vec<u8>>,
    tls: bool,
    certificates: Option<Vec<CertificateDer<'static>>>,
}

impl MockStream {
    pub fn pair() -> (MockStream, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let stream = MockStream {
            inner: server,
            peer: "10.0.0.7:40000".parse().unwrap(),
            alpn: None,
            tls: false,
            certificates: None,
        };
        (stream, client)
    }

    /// Behave like a TLS stream that negotiated `protocol`.
    pub fn with_alpn(mut self, protocol: &[u8]) -> Self {
        self.alpn = Some(protocol.to_vec());
        self.tls = true;
        self
    }

    /// Present `chain` as the client certificate chain.
    pub fn with_certificates(mut self, chain: Vec<CertificateDer<'static>>) -> Self {
        self.certificates = Some(chain);
        self
    }
}

impl Transport for MockStream {
    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        self.certificates.as_deref()
    }

    fn is_tls(&self) -> bool {
        self.tls
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Records what reached the handler and answers `200 ok`.
#[derive(Default)]
pub struct MockHandler {
    pub calls: AtomicUsize,
    pub upgrades: AtomicUsize,
    pub reject_upgrades: bool,
    pub bodies: Mutex<Vec<Bytes>>,
    pub users: Mutex<Vec<Option<String>>>,
}

impl MockHandler {
    pub fn rejecting_upgrades() -> Self {
        Self {
            reject_upgrades: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn upgrades(&self) -> usize {
        self.upgrades.load(Ordering::SeqCst)
    }
}

impl RequestHandler for MockHandler {
    fn handle(&self, req: Request) -> BoxFuture<'static, Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(req.body().clone());
        self.users
            .lock()
            .unwrap()
            .push(req.session.as_ref().map(|s| s.username.clone()));
        Box::pin(async move {
            http::Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Bytes::from_static(b"ok"))
                .unwrap()
        })
    }

    fn handle_upgrade(&self, _req: Request, mut stream: BoxedTransport) -> BoxFuture<'static, UpgradeOutcome> {
        self.upgrades.fetch_add(1, Ordering::SeqCst);
        let reject = self.reject_upgrades;
        Box::pin(async move {
            if reject {
                return UpgradeOutcome::Rejected {
                    response: status_response(StatusCode::SERVICE_UNAVAILABLE),
                    stream,
                };
            }
            stream.write_all(b"upgraded").await.unwrap();
            stream.shutdown().await.unwrap();
            UpgradeOutcome::Upgraded
        })
    }
}

/// Accepts `X-Auth-Token: good-token`; `/redfish/v1` and `POST /login` are open.
/// Client certificates map to their subject common name.
pub struct MockAuth {
    pub sessions: Arc<MemorySessionStore>,
    pub locked: AtomicUsize,
}

impl MockAuth {
    pub fn new() -> Self {
        let sessions = Arc::new(MemorySessionStore::new());
        let mut session = UserSession::new("admin", SessionOrigin::Token, None);
        session.session_token = GOOD_TOKEN.to_string();
        sessions.insert(Arc::new(session));
        Self {
            sessions,
            locked: AtomicUsize::new(0),
        }
    }
}

impl Authenticator for MockAuth {
    fn enabled(&self) -> bool {
        true
    }

    fn authenticate(
        &self,
        _ip: Option<IpAddr>,
        _method: &Method,
        headers: &HeaderMap,
        mtls_session: Option<&Arc<UserSession>>,
    ) -> Option<Arc<UserSession>> {
        if let Some(session) = mtls_session {
            return Some(Arc::clone(session));
        }
        let token = headers.get("x-auth-token")?.to_str().ok()?;
        self.sessions.get_by_token(token)
    }

    fn verify_mtls_user(&self, ip: Option<IpAddr>, end_entity: &CertificateDer<'_>) -> Option<Arc<UserSession>> {
        let session = Arc::new(UserSession::new(common_name(end_entity)?, SessionOrigin::MutualTls, ip));
        self.sessions.insert(Arc::clone(&session));
        Some(session)
    }

    fn is_on_allowlist(&self, path: &str, method: &Method) -> bool {
        (path == "/redfish/v1" && method == Method::GET) || (path == "/login" && method == Method::POST)
    }

    fn handle_account_locked(&self, _username: &str, _req: Request, _res: Response) -> BoxFuture<'static, Response> {
        self.locked.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { status_response(LOCKED_STATUS) })
    }
}

/// What a stream handed to [`MockHttp2`] carried.
#[derive(Debug)]
pub struct Handoff {
    pub preface: Vec<u8>,
    pub user: Option<String>,
}

/// Records the first bytes and the bound user of every stream handed to it.
pub struct MockHttp2 {
    received: mpsc::UnboundedSender<Handoff>,
}

impl MockHttp2 {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Handoff>) {
        let (received, rx) = mpsc::unbounded_channel();
        (Self { received }, rx)
    }
}

impl Http2Handoff for MockHttp2 {
    fn serve(
        &self,
        mut stream: BoxedTransport,
        _handler: Arc<dyn RequestHandler>,
        _date: DateCache,
        mtls_session: Option<Arc<UserSession>>,
    ) -> BoxFuture<'static, ()> {
        let received = self.received.clone();
        Box::pin(async move {
            let mut preface = vec![0u8; 64];
            let n = stream.read(&mut preface).await.unwrap_or(0);
            preface.truncate(n);
            let user = mtls_session.map(|s| s.username.clone());
            let _ = received.send(Handoff { preface, user });
        })
    }
}

pub struct TestContext {
    pub ctx: ConnectionContext,
    pub handler: Arc<MockHandler>,
    pub auth: Arc<MockAuth>,
}

pub fn context(handler: MockHandler) -> TestContext {
    context_with(handler, 30 * 1024 * 1024, Duration::from_secs(60), 200)
}

pub fn context_with(
    handler: MockHandler,
    body_limit: u64,
    response_timeout: Duration,
    max_connections: usize,
) -> TestContext {
    let handler = Arc::new(handler);
    let auth = Arc::new(MockAuth::new());
    let sessions: Arc<dyn SessionStore> = auth.sessions.clone();
    let ctx = ConnectionContext {
        handler: handler.clone(),
        auth: auth.clone(),
        sessions,
        http2: None,
        settings: Arc::new(ConnectionSettings {
            body_limit,
            response_timeout,
        }),
        tracker: ConnectionTracker::new(max_connections),
        date: DateCache::new(),
    };
    TestContext { ctx, handler, auth }
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read one response; the body length comes from `Content-Length`.
/// Returns `None` if the peer closed before a full head arrived.
///
/// The head is read a byte at a time so nothing past this response is
/// consumed; a pipelined response stays in the stream for the next call.
pub async fn read_response<R: AsyncRead + Unpin>(stream: &mut R, head_only: bool) -> Option<RawResponse> {
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        if stream.read(&mut byte).await.ok()? == 0 {
            return None;
        }
        buf.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&buf).into_owned();
    let mut lines = head.split("\r\n");
    let status = lines.next()?.split(' ').nth(1)?.parse().ok()?;
    let headers: Vec<(String, String)> = lines
        .filter(|l| !l.is_empty())
        .filter_map(|l| {
            let (k, v) = l.split_once(':')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let mut res = RawResponse {
        status,
        headers,
        body: Vec::new(),
    };
    let length: usize = if head_only {
        0
    } else {
        res.header("content-length").and_then(|v| v.parse().ok()).unwrap_or(0)
    };
    res.body.resize(length, 0);
    let mut filled = 0;
    while filled < length {
        let n = stream.read(&mut res.body[filled..]).await.ok()?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    res.body.truncate(filled);
    Some(res)
}

/// Read until the peer closes; returns everything received.
pub async fn read_to_close<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).await;
    out
}

/// Accepts any server certificate. Signatures are still checked.
#[derive(Debug)]
pub struct AcceptAnyServerCert(Arc<rustls::crypto::CryptoProvider>);

impl AcceptAnyServerCert {
    pub fn new() -> Self {
        Self(Arc::new(rustls::crypto::ring::default_provider()))
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// TLS connector offering `alpn` and trusting any server certificate.
pub fn tls_connector(alpn: &[&[u8]]) -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

pub fn localhost() -> ServerName<'static> {
    ServerName::try_from("localhost").unwrap()
}

/// Certificates from the test PEM, leaf first.
pub fn fixture_chain() -> Vec<CertificateDer<'static>> {
    let pem = std::fs::read(fixture()).unwrap();
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .unwrap()
}

/// Client verifier that trusts exactly one leaf certificate.
#[derive(Debug)]
pub struct TrustOnly {
    trusted: CertificateDer<'static>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::server::danger::ClientCertVerifier for TrustOnly {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.trusted.as_ref() {
            Ok(rustls::server::danger::ClientCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Server context with mutual TLS whose trust store holds only the fixture leaf.
pub fn mutual_tls_context() -> Arc<TlsContext> {
    let pem = std::fs::read(fixture()).unwrap();
    let key = rustls_pemfile::private_key(&mut pem.as_slice()).unwrap().unwrap();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(fixture_chain(), key)
        .unwrap();
    let verifier = TrustOnly {
        trusted: fixture_chain().remove(0),
        provider,
    };
    Arc::new(TlsContext::new(config, Some(Arc::new(verifier))))
}
