//! Request handler seam.
//!
//! # Data Flow
//! ```text
//! Connection (request fully read and authorized)
//!     → RequestHandler::handle          → Response → Connection writes it
//!     → RequestHandler::handle_upgrade  → stream owned by the handler
//!                                       ↳ Rejected: response + stream back
//! ```
//!
//! # Design Decisions
//! - Handlers see a complete, buffered request; streaming happens only on upgrade
//! - An upgrade hands the transport over for good; the connection only
//!   writes again if the handler gives the stream back with an error

pub mod router;

use futures_util::future::BoxFuture;
use http::StatusCode;

use crate::http::request::Request;
use crate::http::response::{status_response, Response};
use crate::net::transport::BoxedTransport;

/// Result of offering a connection to the upgrade path.
pub enum UpgradeOutcome {
    /// The handler owns the stream now.
    Upgraded,
    /// The upgrade failed before it completed; send `response` and close.
    Rejected {
        response: Response,
        stream: BoxedTransport,
    },
}

impl std::fmt::Debug for UpgradeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeOutcome::Upgraded => f.write_str("Upgraded"),
            UpgradeOutcome::Rejected { response, .. } => f
                .debug_struct("Rejected")
                .field("status", &response.status())
                .finish(),
        }
    }
}

pub trait RequestHandler: Send + Sync + 'static {
    fn handle(&self, req: Request) -> BoxFuture<'static, Response>;

    /// Take over the connection for a WebSocket, event stream or attachment.
    fn handle_upgrade(
        &self,
        req: Request,
        stream: BoxedTransport,
    ) -> BoxFuture<'static, UpgradeOutcome> {
        tracing::debug!(url = %req.target(), "No upgrade route");
        Box::pin(async move {
            UpgradeOutcome::Rejected {
                response: status_response(StatusCode::NOT_FOUND),
                stream,
            }
        })
    }
}
