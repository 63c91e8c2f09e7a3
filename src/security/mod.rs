//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Headers parsed:
//!     → auth.rs (mTLS / token / cookie → optional session)
//!     → limits.rs (body limit: configured when authenticated, 4 KiB otherwise)
//! Request complete:
//!     → auth.rs (allowlist check)
//!     → unauthorized.rs (401 or login redirect)
//!     → auth.rs (Basic user → account lockout hook)
//! Connection closed:
//!     → session.rs (drop the mTLS-derived session)
//! ```
//!
//! # Design Decisions
//! - Fail closed: a protected path without a session never reaches the handler
//! - Sizes are checked before the body is read
//! - No trust in client input

pub mod auth;
pub mod limits;
pub mod session;
pub mod unauthorized;
