//! Request and connection limits.
//!
//! # Responsibilities
//! - Bound the header section of every request
//! - Bound request bodies (reduced for callers without a session)
//! - Bound the number of live connections across the process
//!
//! # Design Decisions
//! - Limits are fixed at build time; only the authenticated body maximum is
//!   taken from configuration
//! - Limits are checked before the body is read (early rejection)

/// Maximum size of the request line plus header fields.
pub const HTTP_HEADER_LIMIT: usize = 8192;

/// Body ceiling applied to callers that failed to authenticate.
pub const LOGGED_OUT_BODY_LIMIT: u64 = 4096;

/// Process-wide ceiling on concurrently open connections.
pub const MAX_CONNECTIONS: usize = 200;

/// Default authenticated body maximum, in MiB.
pub const DEFAULT_BODY_LIMIT_MB: u64 = 30;

/// Convert a body limit expressed in MiB into bytes.
pub fn body_limit_bytes(megabytes: u64) -> u64 {
    megabytes.saturating_mul(1024 * 1024)
}
