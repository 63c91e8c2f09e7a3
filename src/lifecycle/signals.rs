//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to server events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP reloads certificates, it never stops the server
//! - Handlers stay installed; `recv` can be called again after each signal

use tokio::signal::unix::{signal, Signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSignal {
    /// Reload the TLS certificate (SIGHUP).
    Reload,
    /// Stop accepting and shut down (SIGINT, SIGTERM).
    Stop,
}

pub struct Signals {
    hangup: Signal,
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal.
    pub async fn recv(&mut self) -> ServerSignal {
        tokio::select! {
            _ = self.hangup.recv() => {
                tracing::info!("Received SIGHUP");
                ServerSignal::Reload
            }
            _ = self.interrupt.recv() => {
                tracing::info!("Received SIGINT");
                ServerSignal::Stop
            }
            _ = self.terminate.recv() => {
                tracing::info!("Received SIGTERM");
                ServerSignal::Stop
            }
        }
    }
}
