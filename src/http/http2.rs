//! HTTP/2 hand-off.
//!
//! When ALPN selects `h2` the HTTP/1.1 state machine gives the stream away
//! and never touches it again. [`HyperHttp2`] serves it with hyper's HTTP/2
//! server, buffering each request and dispatching it to the same
//! [`RequestHandler`] behind the same authentication gate.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{self, HeaderValue};
use http::StatusCode;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use crate::handler::RequestHandler;
use crate::http::date::DateCache;
use crate::http::request::Request;
use crate::http::response::{status_response, Response};
use crate::net::transport::{BoxedTransport, Transport};
use crate::security::auth::Authenticator;
use crate::security::session::UserSession;

/// Takes exclusive ownership of a stream that negotiated HTTP/2.
pub trait Http2Handoff: Send + Sync + 'static {
    /// Serve the stream until the peer goes away. `mtls_session` is the
    /// identity bound from the client certificate during the handshake.
    fn serve(
        &self,
        stream: BoxedTransport,
        handler: Arc<dyn RequestHandler>,
        date: DateCache,
        mtls_session: Option<Arc<UserSession>>,
    ) -> BoxFuture<'static, ()>;
}

pub struct HyperHttp2 {
    auth: Arc<dyn Authenticator>,
    body_limit: usize,
}

impl HyperHttp2 {
    pub fn new(auth: Arc<dyn Authenticator>, body_limit: usize) -> Self {
        Self { auth, body_limit }
    }
}

impl Http2Handoff for HyperHttp2 {
    fn serve(
        &self,
        stream: BoxedTransport,
        handler: Arc<dyn RequestHandler>,
        date: DateCache,
        mtls_session: Option<Arc<UserSession>>,
    ) -> BoxFuture<'static, ()> {
        let auth = Arc::clone(&self.auth);
        let limit = self.body_limit;

        Box::pin(async move {
            let ip = stream.peer_addr().ok().map(|a| a.ip());
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let handler = Arc::clone(&handler);
                let auth = Arc::clone(&auth);
                let date = date.clone();
                let mtls_session = mtls_session.clone();
                async move {
                    let res = dispatch(req, ip, mtls_session, handler.as_ref(), auth.as_ref(), limit).await;
                    Ok::<_, Infallible>(into_hyper(res, &date))
                }
            });

            if let Err(e) = http2::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!(error = %e, "HTTP/2 connection ended with error");
            }
        })
    }
}

async fn dispatch(
    req: hyper::Request<Incoming>,
    ip: Option<IpAddr>,
    mtls_session: Option<Arc<UserSession>>,
    handler: &dyn RequestHandler,
    auth: &dyn Authenticator,
    limit: usize,
) -> Response {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(error = %e, "HTTP/2 request body rejected");
            return status_response(StatusCode::PAYLOAD_TOO_LARGE);
        }
    };

    let mut request = Request::from_http(http::Request::from_parts(parts, body));
    request.ip_address = ip;
    tracing::info!(
        method = %request.method(),
        url = %request.target(),
        ip = ?ip,
        "Request: HTTP/2"
    );

    if auth.enabled() {
        request.session = auth.authenticate(ip, request.method(), request.headers(), mtls_session.as_ref());
        if request.session.is_none() && !auth.is_on_allowlist(request.path(), request.method()) {
            return auth.unauthorized(
                request.path(),
                request.header_value("x-requested-with"),
                request.header_value(header::ACCEPT),
            );
        }
    }

    handler.handle(request).await
}

fn into_hyper(res: Response, date: &DateCache) -> hyper::Response<Full<Bytes>> {
    let (mut parts, body) = res.into_parts();
    if let Ok(value) = HeaderValue::from_str(&date.get()) {
        parts.headers.insert(header::DATE, value);
    }
    // Connection-specific fields are illegal in HTTP/2.
    parts.headers.remove(header::CONNECTION);
    hyper::Response::from_parts(parts, Full::new(body))
}
