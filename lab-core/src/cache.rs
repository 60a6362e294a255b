//! Time-stamped single-value cache.
//!
//! Controller sessions (hypervisor tickets, vCenter session ids) and slow
//! lookups (datastore ids) are held in a `TimedCache` owned by the adapter
//! that needs them, never in process-wide statics.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

pub struct TimedCache<T> {
    ttl: Duration,
    entry: Mutex<Option<CacheEntry<T>>>,
}

impl<T: Clone> TimedCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: Mutex::new(None),
        }
    }

    /// Return the cached value, or run `refresh` when the entry is missing or
    /// older than the TTL.
    ///
    /// The lock is held across `refresh`, so concurrent callers wait for a
    /// single refresh instead of each logging in again. A failed refresh
    /// leaves the cache empty.
    pub async fn get_or_refresh<F, Fut, E>(&self, refresh: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = self.entry.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.value.clone());
            }
            tracing::debug!("cached value expired, refreshing");
        }

        *guard = None;
        let value = refresh().await?;
        *guard = Some(CacheEntry {
            value: value.clone(),
            fetched_at: Instant::now(),
        });

        Ok(value)
    }

    /// Like [`get_or_refresh`](Self::get_or_refresh) but lets the caller veto
    /// a still-fresh value (e.g. a session the controller no longer accepts).
    pub async fn get_validated<V, VFut, F, Fut, E>(&self, validate: V, refresh: F) -> Result<T, E>
    where
        V: FnOnce(T) -> VFut,
        VFut: Future<Output = bool>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut guard = self.entry.lock().await;

        if let Some(entry) = guard.as_ref() {
            if entry.fetched_at.elapsed() < self.ttl && validate(entry.value.clone()).await {
                return Ok(entry.value.clone());
            }
        }

        *guard = None;
        let value = refresh().await?;
        *guard = Some(CacheEntry {
            value: value.clone(),
            fetched_at: Instant::now(),
        });

        Ok(value)
    }

    pub async fn invalidate(&self) {
        *self.entry.lock().await = None;
    }
}
