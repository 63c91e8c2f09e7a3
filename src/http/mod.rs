//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! accepted socket
//!     → server.rs (certificate context captured, connection task spawned)
//!     → connection.rs (handshake, ALPN, phase loop)
//!         → parser.rs (head ≤ 8 KiB, body ≤ limit, chunked or sized)
//!         → request.rs (typed request, session, client IP)
//!         → upgrade.rs (WebSocket / SSE / attachment detection)
//!         → RequestHandler (external)
//!         → response.rs (keep-alive, date, content length, serialize)
//!     → http2.rs (when ALPN picked h2; the socket never comes back)
//! ```

pub mod connection;
pub mod date;
pub mod deadline;
pub mod http2;
pub mod parser;
pub mod request;
pub mod response;
pub mod server;
pub mod upgrade;

pub use connection::{Connection, ConnectionContext, ConnectionSettings};
pub use date::DateCache;
pub use http2::{Http2Handoff, HyperHttp2};
pub use request::Request;
pub use response::Response;
pub use server::{HttpServer, ServerError};
