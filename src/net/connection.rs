//! Process-wide connection accounting.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Keep an exact count of live connections
//! - Let shutdown wait until every connection is gone
//!
//! # Design Decisions
//! - The count moves only through [`ConnectionGuard`] construction and drop,
//!   so early returns and panics cannot leak or double count
//! - Admission is checked against the count, not reserved: a burst of
//!   accepts may briefly observe the same value

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::observability::metrics;

/// Relaxed ordering is enough; IDs only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts live connections against a ceiling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    count: Arc<watch::Sender<usize>>,
    max_connections: usize,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
            max_connections,
        }
    }

    /// Record a new connection. The returned guard releases it on drop.
    pub fn track(&self) -> ConnectionGuard {
        let mut total = 0;
        self.count.send_modify(|n| {
            *n += 1;
            total = *n;
        });
        metrics::record_active_connections(total);
        ConnectionGuard {
            count: Arc::clone(&self.count),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Whether the live count has gone past the ceiling.
    pub fn over_limit(&self) -> bool {
        self.active_count() > self.max_connections
    }

    /// Wait until no connections remain. Returns `false` on timeout.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok();
        drained
    }
}

/// One live connection's share of the count.
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<watch::Sender<usize>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut total = 0;
        self.count.send_modify(|n| {
            *n = n.saturating_sub(1);
            total = *n;
        });
        metrics::record_active_connections(total);
        tracing::debug!(connection_id = %self.id, total, "Connection released");
    }
}
