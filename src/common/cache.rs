//! Single-value TTL cache
//!
//! Holds the last computed value of an expensive read (reconciliation
//! verdict, transparency report) until its time-to-live runs out.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Five minutes, the refresh window of the public aggregates
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

struct Entry<T> {
    value: T,
    stored_at: Instant,
}

/// A value cached with a fixed time-to-live
pub struct TtlCache<T> {
    ttl: Duration,
    entry: RwLock<Option<Entry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    /// Cached value if still fresh
    pub async fn get(&self) -> Option<T> {
        let entry = self.entry.read().await;
        entry
            .as_ref()
            .filter(|e| e.stored_at.elapsed() < self.ttl)
            .map(|e| e.value.clone())
    }

    pub async fn put(&self, value: T) {
        *self.entry.write().await = Some(Entry {
            value,
            stored_at: Instant::now(),
        });
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}
