//! Per-connection deadline timer.
//!
//! One deadline guards whichever I/O operation the connection is waiting on.
//! Arming sets an expiry instant; cancelling clears it. An operation run
//! through [`Deadline::guard`] either completes first (the wait is dropped,
//! which is the cancellation path) or the deadline fires and the caller gets
//! [`Elapsed`], which always means the connection must close.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// The guarded operation did not finish before the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed;

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

#[derive(Debug)]
pub struct Deadline {
    timeout: Duration,
    expires_at: Option<Instant>,
}

impl Deadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expires_at: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// (Re)arm the deadline a full timeout from now.
    pub fn start(&mut self) {
        self.expires_at = Some(Instant::now() + self.timeout);
    }

    pub fn cancel(&mut self) {
        self.expires_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.expires_at.is_some()
    }

    /// Run `fut` under the deadline. An unarmed deadline never fires.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        match self.expires_at {
            Some(at) => tokio::time::timeout_at(at, fut).await.map_err(|_| Elapsed),
            None => Ok(fut.await),
        }
    }
}
