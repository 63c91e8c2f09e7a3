//! TCP listener.
//!
//! # Responsibilities
//! - Bind to the configured address, or adopt a socket passed by the service manager
//! - Accept incoming TCP connections
//!
//! Admission control lives in the connection, not here: the listener never
//! waits for capacity, so accept keeps draining the kernel backlog.

use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};

/// First descriptor passed under the systemd socket activation protocol.
const LISTEN_FDS_START: i32 = 3;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),

    #[error("invalid bind address {address}: {source}")]
    Address {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
}

pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(address: &str) -> Result<Self, ListenerError> {
        let addr: SocketAddr = address.parse().map_err(|source| ListenerError::Address {
            address: address.to_string(),
            source,
        })?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(address = %local_addr, "Listener bound");
        Ok(Self { inner: listener })
    }

    pub fn from_std(listener: std::net::TcpListener) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true).map_err(ListenerError::Bind)?;
        let inner = TcpListener::from_std(listener).map_err(ListenerError::Bind)?;
        Ok(Self { inner })
    }

    /// Adopt the listening socket handed over by the service manager, if any.
    #[cfg(unix)]
    pub fn inherited() -> Result<Option<Self>, ListenerError> {
        use std::os::unix::io::FromRawFd;

        let count = std::env::var("LISTEN_FDS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if count == 0 {
            return Ok(None);
        }
        let for_us = std::env::var("LISTEN_PID")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .map_or(true, |pid| pid == std::process::id());
        if !for_us {
            return Ok(None);
        }

        // SAFETY: LISTEN_FDS says descriptor 3 is an open listening socket
        // passed to this process and nothing else has claimed it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(LISTEN_FDS_START) };
        let listener = Self::from_std(std_listener)?;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(address = %addr, "Using inherited listening socket");
        }
        Ok(Some(listener))
    }

    #[cfg(not(unix))]
    pub fn inherited() -> Result<Option<Self>, ListenerError> {
        Ok(None)
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), ListenerError> {
        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(peer_addr = %addr, "Connection accepted");
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }
}
