//! Expiring key/value cache for ownership lookups
//!
//! Entries carry their own TTL and are checked at read time, so a stale
//! value is never returned even if the background sweep has not run yet.
//! Deletion is owned by [`ExpiringCache::sweep`]; readers only take the
//! read lock and never remove anything.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use bucket_telemetry::ownership::cache::ExpiringCache;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cache: ExpiringCache<String, String> = ExpiringCache::new();
//! cache.put("photos".to_string(), "acct-1".to_string(), Duration::from_secs(300)).await;
//! assert_eq!(cache.get("photos").await.as_deref(), Some("acct-1"));
//!
//! let sweeper = cache.start_sweeper(Duration::from_secs(60));
//! sweeper.shutdown().await;
//! # }
//! ```

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Snapshot of cache counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a live value
    pub hits: u64,
    /// Reads that found nothing or an expired entry
    pub misses: u64,
    /// Completed sweep passes
    pub sweeps: u64,
    /// Entries removed by sweeps
    pub expired: u64,
    /// Entries currently stored, expired or not
    pub entries: u64,
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    /// A zero TTL never expires
    fn is_expired(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.created_at) > self.ttl
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sweeps: AtomicU64,
    expired: AtomicU64,
}

/// Thread-safe cache with per-entry TTL
///
/// Cloning is cheap and every clone shares the same storage.
pub struct ExpiringCache<K, V> {
    entries: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    counters: Arc<Counters>,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<K, V> Default for ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Store `value` under `key`, replacing any previous entry
    pub async fn put(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry::new(value, ttl);
        self.entries.write().await.insert(key, entry);
    }

    /// Value for `key` if present and not expired
    pub async fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        let entries = self.entries.read().await;

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Remove expired entries, returning how many were removed
    ///
    /// Expired keys are collected under the read lock, then deleted under the
    /// write lock. Each key is re-checked before deletion so an entry that was
    /// replaced in between survives.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();

        let candidates: Vec<K> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect()
        };

        let mut removed = 0;
        if !candidates.is_empty() {
            let now = Instant::now();
            let mut entries = self.entries.write().await;
            for key in candidates {
                if entries.get(&key).is_some_and(|entry| entry.is_expired(now)) {
                    entries.remove(&key);
                    removed += 1;
                }
            }
        }

        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        self.counters
            .expired
            .fetch_add(removed as u64, Ordering::Relaxed);

        if removed > 0 {
            debug!(removed = removed, "Swept expired cache entries");
        }
        removed
    }

    /// Spawn the periodic sweep task
    ///
    /// The returned [`Sweeper`] owns the task. Call [`Sweeper::shutdown`] to
    /// stop it cleanly; dropping the handle aborts it. Intervals below one
    /// millisecond are raised to one millisecond.
    pub fn start_sweeper(&self, interval: Duration) -> Sweeper {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let cache = self.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        trace!("Cache sweeper received stop signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        cache.sweep().await;
                    }
                }
            }
        });

        debug!(interval_secs = interval.as_secs_f64(), "Cache sweeper started");

        Sweeper {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Number of stored entries, including expired ones not yet swept
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sweeps: self.counters.sweeps.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            entries: self.len().await as u64,
        }
    }
}

/// Handle to a running sweep task
#[derive(Debug)]
pub struct Sweeper {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Stop the sweep task and wait for it to exit
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(error = %e, "Cache sweeper exited abnormally");
                }
            }
        }
        debug!("Cache sweeper stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ExpiringCache<String, String> {
        ExpiringCache::new()
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache();
        cache
            .put("photos".into(), "acct-1".into(), Duration::from_secs(60))
            .await;

        assert_eq!(cache.get("photos").await.as_deref(), Some("acct-1"));
        assert_eq!(cache.get("missing").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_put_replaces_previous_entry() {
        let cache = cache();
        cache
            .put("photos".into(), "acct-1".into(), Duration::from_secs(60))
            .await;
        cache
            .put("photos".into(), "acct-2".into(), Duration::from_secs(60))
            .await;

        assert_eq!(cache.get("photos").await.as_deref(), Some("acct-2"));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_put_is_idempotent() {
        let cache = cache();
        for _ in 0..3 {
            cache
                .put("photos".into(), "acct-1".into(), Duration::from_secs(60))
                .await;
        }

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("photos").await.as_deref(), Some("acct-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_not_returned_before_sweep() {
        let cache = cache();
        cache
            .put("photos".into(), "acct-1".into(), Duration::from_secs(10))
            .await;

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cache.get("photos").await, None);
        // Reads never delete
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_valid_at_exact_ttl() {
        let cache = cache();
        cache
            .put("photos".into(), "acct-1".into(), Duration::from_secs(10))
            .await;

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("photos").await.as_deref(), Some("acct-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let cache = cache();
        cache.put("photos".into(), "acct-1".into(), Duration::ZERO).await;

        tokio::time::advance(Duration::from_secs(86_400)).await;

        assert_eq!(cache.sweep().await, 0);
        assert_eq!(cache.get("photos").await.as_deref(), Some("acct-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let cache = cache();
        cache
            .put("short".into(), "a".into(), Duration::from_secs(5))
            .await;
        cache
            .put("long".into(), "b".into(), Duration::from_secs(500))
            .await;

        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(cache.sweep().await, 1);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("long").await.as_deref(), Some("b"));

        let stats = cache.stats().await;
        assert_eq!(stats.sweeps, 1);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_entry_survives_sweep() {
        let cache = cache();
        cache
            .put("photos".into(), "old".into(), Duration::from_secs(5))
            .await;
        tokio::time::advance(Duration::from_secs(6)).await;

        cache
            .put("photos".into(), "new".into(), Duration::from_secs(60))
            .await;

        assert_eq!(cache.sweep().await, 0);
        assert_eq!(cache.get("photos").await.as_deref(), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = cache();
        cache
            .put("photos".into(), "acct-1".into(), Duration::from_secs(5))
            .await;

        let sweeper = cache.start_sweeper(Duration::from_secs(10));
        assert!(sweeper.is_running());

        // Let the ticker fire once after expiry
        tokio::time::sleep(Duration::from_secs(11)).await;
        tokio::task::yield_now().await;

        assert_eq!(cache.len().await, 0);
        assert!(cache.stats().await.sweeps >= 1);

        sweeper.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_sweep_interval_is_clamped() {
        let cache = cache();
        cache
            .put("photos".into(), "acct-1".into(), Duration::from_millis(5))
            .await;

        let sweeper = cache.start_sweeper(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;

        assert!(sweeper.is_running());
        assert_eq!(cache.len().await, 0);
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_shutdown_stops_task() {
        let cache = cache();
        let sweeper = cache.start_sweeper(Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(35)).await;
        sweeper.shutdown().await;

        let sweeps = cache.stats().await.sweeps;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.stats().await.sweeps, sweeps);
    }

    #[tokio::test]
    async fn test_dropping_sweeper_aborts_task() {
        let cache = cache();
        let sweeper = cache.start_sweeper(Duration::from_millis(10));
        drop(sweeper);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let sweeps = cache.stats().await.sweeps;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.stats().await.sweeps, sweeps);
    }

    #[tokio::test]
    async fn test_clones_share_storage() {
        let cache = cache();
        let other = cache.clone();

        other
            .put("photos".into(), "acct-1".into(), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("photos").await.as_deref(), Some("acct-1"));
    }
}
