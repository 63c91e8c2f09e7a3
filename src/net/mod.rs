//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind or inherited socket, accept)
//!     → connection.rs (global count, admission check)
//!     → tls.rs (context captured at accept, optional handshake)
//!     → transport.rs (plain or TLS stream behind one trait)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - No semaphore at accept; the ceiling is checked when a connection starts
//! - TLS contexts are swapped wholesale on reload
//! - TLS is optional and handled transparently by the transport

pub mod connection;
pub mod listener;
pub mod tls;
pub mod transport;
