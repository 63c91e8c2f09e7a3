//! Byte stream abstraction shared by plaintext and TLS connections.
//!
//! The connection state machine only needs to read, write, learn the peer
//! address and, for TLS, inspect what the handshake negotiated. [`Transport`]
//! captures exactly that so tests can drive a connection over an in-memory
//! pipe while the server uses [`Adaptor`] over real sockets.

use futures_util::future::BoxFuture;
use rustls::pki_types::CertificateDer;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

use crate::net::tls::TlsContext;

/// A connected, bidirectional byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Protocol chosen by ALPN, if a TLS handshake negotiated one.
    fn alpn_protocol(&self) -> Option<&[u8]> {
        None
    }

    /// Certificate chain the client presented during the handshake.
    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        None
    }

    fn is_tls(&self) -> bool {
        false
    }

    /// Run the server side of a TLS handshake. Streams that are already
    /// secured (or never will be) return themselves.
    fn handshake(self, _ctx: Arc<TlsContext>) -> BoxFuture<'static, io::Result<Self>>
    where
        Self: Sized,
    {
        Box::pin(async move { Ok(self) })
    }
}

/// Type-erased transport passed to upgrade and HTTP/2 handlers.
pub type BoxedTransport = Box<dyn Transport>;

impl Transport for BoxedTransport {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        (**self).alpn_protocol()
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        (**self).peer_certificates()
    }

    fn is_tls(&self) -> bool {
        (**self).is_tls()
    }
}

/// A TCP socket, either raw or wrapped in a server TLS session.
pub enum Adaptor {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Adaptor {
    fn tcp(&self) -> &TcpStream {
        match self {
            Adaptor::Plain(tcp) => tcp,
            Adaptor::Tls(tls) => tls.get_ref().0,
        }
    }
}

impl Transport for Adaptor {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Adaptor::Plain(_) => None,
            Adaptor::Tls(tls) => tls.get_ref().1.alpn_protocol(),
        }
    }

    fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
        match self {
            Adaptor::Plain(_) => None,
            Adaptor::Tls(tls) => tls.get_ref().1.peer_certificates(),
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, Adaptor::Tls(_))
    }

    fn handshake(self, ctx: Arc<TlsContext>) -> BoxFuture<'static, io::Result<Self>> {
        Box::pin(async move {
            match self {
                Adaptor::Plain(tcp) => {
                    let tls = ctx.acceptor().accept(tcp).await?;
                    Ok(Adaptor::Tls(Box::new(tls)))
                }
                secured @ Adaptor::Tls(_) => Ok(secured),
            }
        })
    }
}

impl AsyncRead for Adaptor {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Adaptor::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Adaptor::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Adaptor {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Adaptor::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Adaptor::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Adaptor::Plain(s) => Pin::new(s).poll_flush(cx),
            Adaptor::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Adaptor::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Adaptor::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
