//! Shared `Date` header cache.
//!
//! Formatting the current time for every response is wasted work when the
//! value only changes once a second and clients tolerate staleness; the cache
//! regenerates the string at most once per refresh interval and hands out a
//! shared reference to it.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

const REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CachedDate {
    value: Arc<str>,
    refreshed: Instant,
}

impl CachedDate {
    fn now() -> Self {
        Self {
            value: httpdate::fmt_http_date(SystemTime::now()).into(),
            refreshed: Instant::now(),
        }
    }
}

/// Cheaply clonable handle to the process-wide date string.
#[derive(Debug, Clone)]
pub struct DateCache {
    inner: Arc<ArcSwap<CachedDate>>,
    refresh: Duration,
}

impl DateCache {
    pub fn new() -> Self {
        Self::with_refresh_interval(REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(refresh: Duration) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(CachedDate::now())),
            refresh,
        }
    }

    /// Current date string, recomputed if the cached one is older than the interval.
    pub fn get(&self) -> Arc<str> {
        let cached = self.inner.load();
        if cached.refreshed.elapsed() < self.refresh {
            return Arc::clone(&cached.value);
        }
        self.update()
    }

    /// Force a recompute and publish the new value.
    pub fn update(&self) -> Arc<str> {
        let fresh = Arc::new(CachedDate::now());
        let value = Arc::clone(&fresh.value);
        self.inner.store(fresh);
        value
    }
}

impl Default for DateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produces_http_date() {
        let cache = DateCache::new();
        let value = cache.get();
        assert!(value.ends_with(" GMT"));
        assert!(httpdate::parse_http_date(&value).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shares_value_within_interval() {
        let cache = DateCache::new();
        let first = cache.get();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(Arc::ptr_eq(&first, &cache.get()));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!Arc::ptr_eq(&first, &cache.get()));
    }

    #[test]
    fn clones_share_the_cache() {
        let cache = DateCache::new();
        let clone = cache.clone();
        let updated = cache.update();
        assert!(Arc::ptr_eq(&updated, &clone.get()));
    }
}
