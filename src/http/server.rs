//! Listening server.
//!
//! # Responsibilities
//! - Accept sockets and start one [`Connection`] task per socket
//! - Load the TLS certificate and publish it for new connections
//! - Reload the certificate when its directory is rewritten or on SIGHUP
//! - Stop on SIGINT/SIGTERM or [`Shutdown::trigger`], then drain
//!
//! # Design Decisions
//! - The accept loop never ends on an accept error, only on stop
//! - A connection captures the certificate context current at accept time;
//!   reloads only affect later connections
//! - Certificate loading failures keep the previous context

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::fs::{EventBatch, EventMask, FileWatcher};
use crate::http::connection::{Connection, ConnectionContext};
use crate::lifecycle::{ServerSignal, Shutdown, Signals};
use crate::net::listener::{Listener, ListenerError};
use crate::net::tls::{CertificateProvider, CertificateStore};
use crate::net::transport::Adaptor;
use crate::observability::metrics;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("listener has no local address: {0}")]
    LocalAddress(#[source] std::io::Error),
}

struct CertificateSource {
    provider: Arc<dyn CertificateProvider>,
    path: PathBuf,
}

pub struct HttpServer {
    listener: Listener,
    ctx: ConnectionContext,
    certificates: CertificateStore,
    tls: Option<CertificateSource>,
    shutdown: Shutdown,
    drain_timeout: Duration,
}

impl HttpServer {
    /// A plaintext server. Call [`HttpServer::with_tls`] to terminate TLS.
    pub fn new(listener: Listener, ctx: ConnectionContext) -> Self {
        Self {
            listener,
            ctx,
            certificates: CertificateStore::new(),
            tls: None,
            shutdown: Shutdown::new(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Serve TLS with the certificate at `cert_path`, watching its directory.
    pub fn with_tls(mut self, provider: Arc<dyn CertificateProvider>, cert_path: PathBuf) -> Self {
        self.tls = Some(CertificateSource {
            provider,
            path: cert_path,
        });
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Handle that stops [`HttpServer::run`] when triggered.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn certificate_store(&self) -> CertificateStore {
        self.certificates.clone()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until stopped, then wait for them to drain.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.listener.local_addr().map_err(ServerError::LocalAddress)?;
        let mut signals = Signals::new().map_err(ServerError::Signals)?;
        // Subscribe before anything can trigger.
        let mut stop = self.shutdown.subscribe();

        self.load_certificate();
        let (_watcher, mut events) = match self.watch_certificate_change() {
            Some((watcher, events)) => (Some(watcher), Some(events)),
            None => (None, None),
        };
        self.ctx.date.update();

        tracing::info!(
            address = %addr,
            tls = self.tls.is_some(),
            max_connections = self.ctx.tracker.max_connections(),
            "bmcweb server is running"
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => self.do_accept(accepted),
                signal = signals.recv() => match signal {
                    ServerSignal::Reload => {
                        tracing::info!("Received reload signal");
                        self.load_certificate();
                    }
                    ServerSignal::Stop => break,
                },
                batch = next_batch(&mut events) => match batch {
                    Some(batch) => self.on_certificate_events(batch),
                    None => {
                        tracing::error!("Certificate watch stopped");
                        events = None;
                    }
                },
                _ = stop.recv() => break,
            }
        }

        tracing::info!("Stopping, no longer accepting connections");
        let HttpServer {
            listener,
            ctx,
            drain_timeout,
            ..
        } = self;
        drop(listener);

        let remaining = ctx.tracker.active_count();
        if remaining > 0 {
            tracing::info!(active = remaining, "Waiting for connections to drain");
        }
        if !ctx.tracker.wait_for_drain(drain_timeout).await {
            tracing::warn!(
                active = ctx.tracker.active_count(),
                "Drain timeout reached, abandoning connections"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn do_accept(&self, accepted: Result<(TcpStream, SocketAddr), ListenerError>) {
        let (tcp, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Accept failed");
                return;
            }
        };

        let tls = match self.tls {
            Some(_) => match self.certificates.current() {
                Some(ctx) => Some(ctx),
                None => {
                    tracing::error!(peer_addr = %peer, "No certificate loaded, dropping connection");
                    return;
                }
            },
            None => None,
        };

        let connection = Connection::new(Adaptor::Plain(tcp), tls, &self.ctx);
        tracing::debug!(connection_id = %connection.id(), peer_addr = %peer, "Accepted connection");
        tokio::spawn(connection.start());
    }

    /// Build a context from the certificate file and publish it.
    fn load_certificate(&self) {
        let Some(source) = &self.tls else {
            return;
        };
        match source
            .provider
            .ensure_key_present_encrypted_and_valid(&source.path)
        {
            Ok(ctx) => {
                self.certificates.replace(ctx);
                metrics::record_certificate_reload(true);
                tracing::info!(path = %source.path.display(), "Certificate loaded");
            }
            Err(e) => {
                metrics::record_certificate_reload(false);
                tracing::error!(path = %source.path.display(), error = %e, "Failed to load certificate");
            }
        }
    }

    fn watch_certificate_change(&self) -> Option<(FileWatcher, UnboundedReceiver<EventBatch>)> {
        let source = self.tls.as_ref()?;
        let directory = source.path.parent()?;

        let mut watcher = match FileWatcher::new() {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create certificate watcher");
                return None;
            }
        };
        if let Err(e) = watcher.add_path(directory, EventMask::CLOSE_WRITE | EventMask::MOVED_TO) {
            tracing::error!(
                directory = %directory.display(),
                error = %e,
                "Failed to watch certificate directory"
            );
            return None;
        }
        let events = watcher.watch()?;
        tracing::debug!(directory = %directory.display(), "Watching certificate directory");
        Some((watcher, events))
    }

    fn on_certificate_events(&self, batch: EventBatch) {
        let Some(source) = &self.tls else {
            return;
        };

        let mut reload = false;
        for event in batch {
            let path = event.path();
            if !source.provider.file_has_credentials(&path) {
                continue;
            }
            tracing::info!(path = %path.display(), "Written file has credentials");
            match source.provider.ensure_credentials_encrypted(&path) {
                Ok(()) => reload = true,
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Failed to secure credentials")
                }
            }
        }

        if reload {
            self.load_certificate();
        }
    }
}

/// Next watcher batch, or pending forever when nothing is watched.
async fn next_batch(events: &mut Option<UnboundedReceiver<EventBatch>>) -> Option<EventBatch> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
