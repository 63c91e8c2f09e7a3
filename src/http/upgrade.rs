//! Detection of requests that take over the connection.

use crate::http::request::{accepts_media_type, Request};

/// Prefix aggregated satellite resources carry; their attachments are proxied, not streamed.
const AGGREGATION_PREFIX: &str = "5B247A_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeKind {
    WebSocket,
    EventStream,
    /// Streaming download of a diagnostic dump or fault log.
    Attachment,
}

/// Classify a request that should be handed to the upgrade path.
pub fn detect(req: &Request) -> Option<UpgradeKind> {
    if req.is_upgrade() && req.header_value(http::header::UPGRADE).eq_ignore_ascii_case("websocket") {
        return Some(UpgradeKind::WebSocket);
    }
    if accepts_media_type(req.header_value(http::header::ACCEPT), "text/event-stream") {
        return Some(UpgradeKind::EventStream);
    }

    let target = req.target();
    let is_dump = target.contains("Dump") || target.contains("FaultLog");
    if is_dump && target.contains("attachment") && !target.contains(AGGREGATION_PREFIX) {
        return Some(UpgradeKind::Attachment);
    }
    None
}
