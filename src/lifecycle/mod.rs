//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGHUP         → reload certificate, keep accepting
//!     SIGTERM/SIGINT → stop
//!
//! Shutdown (shutdown.rs):
//!     stop or trigger() → stop accepting → drain connections → exit
//! ```
//!
//! # Design Decisions
//! - Existing connections finish on the context they started with
//! - Shutdown has timeout: remaining connections are abandoned after it

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::{ServerSignal, Signals};
