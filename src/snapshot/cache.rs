//! TTL snapshot cache shared by the reconciliation loop and lookups.
//!
//! Readers get an `Arc<Snapshot>`; a reload swaps the pointer under a
//! write lock, so nobody ever sees a half-built snapshot. Reloads are
//! serialised through a separate mutex so a burst of expired reads
//! triggers one load, not one per caller. After a failed reload, plain
//! reads serve the last good snapshot for one TTL before trying again;
//! only forced reads bypass that backoff.

use super::{Snapshot, SnapshotError, SnapshotSource};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// How the returned snapshot relates to the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Just loaded from the source.
    Fresh,
    /// Served from cache, younger than the TTL.
    Cached,
    /// Reload failed; this is the last good snapshot.
    Stale,
    /// Reload failed and nothing was ever loaded; the snapshot is empty.
    Unavailable,
}

struct Entry {
    snapshot: Arc<Snapshot>,
    fetched_at: Instant,
}

pub struct SnapshotCache {
    source: Arc<dyn SnapshotSource>,
    ttl: Duration,
    load_timeout: Duration,
    current: RwLock<Option<Entry>>,
    /// Held while reloading; carries the time of the last failed attempt.
    reload: Mutex<Option<Instant>>,
}

impl SnapshotCache {
    pub fn new(source: Arc<dyn SnapshotSource>, ttl: Duration, load_timeout: Duration) -> Self {
        Self {
            source,
            ttl,
            load_timeout,
            current: RwLock::new(None),
            reload: Mutex::new(None),
        }
    }

    /// Read the snapshot. Never fails: on source trouble the last good
    /// snapshot (or an empty one) comes back instead.
    pub async fn get(&self, force_fresh: bool) -> Arc<Snapshot> {
        self.read(force_fresh).await.0
    }

    /// Like `get`, but also reports whether the data is fresh.
    pub async fn read(&self, force_fresh: bool) -> (Arc<Snapshot>, Freshness) {
        if !force_fresh {
            if let Some(snap) = self.cached_within_ttl().await {
                return (snap, Freshness::Cached);
            }
        }

        let mut last_failure = self.reload.lock().await;

        // Someone else may have reloaded, or failed to, while we waited.
        if !force_fresh {
            if let Some(snap) = self.cached_within_ttl().await {
                return (snap, Freshness::Cached);
            }
            if last_failure.is_some_and(|at| at.elapsed() < self.ttl) {
                return self.last_good().await;
            }
        }

        match self.load().await {
            Ok(snapshot) => {
                *last_failure = None;
                let snapshot = Arc::new(snapshot);
                *self.current.write().await = Some(Entry {
                    snapshot: snapshot.clone(),
                    fetched_at: Instant::now(),
                });
                debug!(
                    validators = snapshot.len(),
                    epoch = snapshot.current_epoch(),
                    "snapshot cache refreshed"
                );
                (snapshot, Freshness::Fresh)
            }
            Err(e) => {
                *last_failure = Some(Instant::now());
                let current = self.current.read().await;
                match current.as_ref() {
                    Some(entry) => {
                        warn!(
                            source = %self.source.describe(),
                            error = %e,
                            age_secs = entry.fetched_at.elapsed().as_secs(),
                            "snapshot reload failed, serving last good snapshot"
                        );
                        (entry.snapshot.clone(), Freshness::Stale)
                    }
                    None => {
                        warn!(
                            source = %self.source.describe(),
                            error = %e,
                            "snapshot reload failed and no snapshot cached yet"
                        );
                        (Arc::new(Snapshot::default()), Freshness::Unavailable)
                    }
                }
            }
        }
    }

    async fn last_good(&self) -> (Arc<Snapshot>, Freshness) {
        match self.current.read().await.as_ref() {
            Some(entry) => (entry.snapshot.clone(), Freshness::Stale),
            None => (Arc::new(Snapshot::default()), Freshness::Unavailable),
        }
    }

    async fn cached_within_ttl(&self) -> Option<Arc<Snapshot>> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.snapshot.clone())
    }

    async fn load(&self) -> Result<Snapshot, SnapshotError> {
        match tokio::time::timeout(self.load_timeout, self.source.load()).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Timeout(self.load_timeout.as_millis() as u64)),
        }
    }

    /// Drop the cached snapshot. Used on shutdown.
    pub async fn clear(&self) {
        if self.current.write().await.take().is_some() {
            info!("snapshot cache cleared");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::snapshot::tests::record;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory source whose content and failure mode tests can flip.
    pub(crate) struct StaticSource {
        pub snapshot: std::sync::Mutex<Snapshot>,
        pub failing: AtomicBool,
        pub loads: AtomicUsize,
    }

    impl StaticSource {
        pub(crate) fn new(snapshot: Snapshot) -> Arc<Self> {
            Arc::new(Self {
                snapshot: std::sync::Mutex::new(snapshot),
                failing: AtomicBool::new(false),
                loads: AtomicUsize::new(0),
            })
        }

        pub(crate) fn set(&self, snapshot: Snapshot) {
            *self.snapshot.lock().unwrap() = snapshot;
        }
    }

    #[async_trait]
    impl SnapshotSource for StaticSource {
        async fn load(&self) -> Result<Snapshot, SnapshotError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(SnapshotError::NotFound("static".to_string()));
            }
            Ok(self.snapshot.lock().unwrap().clone())
        }

        fn describe(&self) -> String {
            "static".to_string()
        }
    }

    /// Source that never answers.
    #[derive(Default)]
    struct HangingSource {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl SnapshotSource for HangingSource {
        async fn load(&self) -> Result<Snapshot, SnapshotError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Snapshot::default())
        }

        fn describe(&self) -> String {
            "hanging".to_string()
        }
    }

    fn one_validator() -> Snapshot {
        Snapshot::new(vec![record("V1", Some("One"))], 100)
    }

    #[tokio::test]
    async fn test_within_ttl_does_not_touch_source() {
        let source = StaticSource::new(one_validator());
        let cache = SnapshotCache::new(source.clone(), Duration::from_secs(30), Duration::from_secs(1));

        let (_, first) = cache.read(false).await;
        let (snap, second) = cache.read(false).await;

        assert_eq!(first, Freshness::Fresh);
        assert_eq!(second, Freshness::Cached);
        assert_eq!(snap.len(), 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_force_fresh_always_reloads() {
        let source = StaticSource::new(one_validator());
        let cache = SnapshotCache::new(source.clone(), Duration::from_secs(30), Duration::from_secs(1));

        cache.get(false).await;
        let (_, freshness) = cache.read(true).await;

        assert_eq!(freshness, Freshness::Fresh);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_serves_last_good() {
        let source = StaticSource::new(one_validator());
        let cache = SnapshotCache::new(source.clone(), Duration::ZERO, Duration::from_secs(1));

        cache.get(true).await;
        source.failing.store(true, Ordering::SeqCst);

        let (snap, freshness) = cache.read(true).await;
        assert_eq!(freshness, Freshness::Stale);
        assert_eq!(snap.len(), 1);

        let snap = cache.get(false).await;
        assert_eq!(snap.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_first_load_is_empty() {
        let source = StaticSource::new(one_validator());
        source.failing.store(true, Ordering::SeqCst);
        let cache = SnapshotCache::new(source, Duration::from_secs(30), Duration::from_secs(1));

        let (snap, freshness) = cache.read(false).await;
        assert_eq!(freshness, Freshness::Unavailable);
        assert!(snap.is_empty());
    }

    #[tokio::test]
    async fn test_expired_ttl_reloads_new_content() {
        let source = StaticSource::new(one_validator());
        let cache = SnapshotCache::new(source.clone(), Duration::ZERO, Duration::from_secs(1));

        assert_eq!(cache.get(false).await.len(), 1);
        source.set(Snapshot::new(
            vec![record("V1", Some("One")), record("V2", Some("Two"))],
            200,
        ));
        assert_eq!(cache.get(false).await.len(), 2);
    }

    #[tokio::test]
    async fn test_waiters_share_one_failed_reload() {
        let source = Arc::new(HangingSource::default());
        let cache = Arc::new(SnapshotCache::new(
            source.clone(),
            Duration::from_millis(100),
            Duration::from_millis(200),
        ));

        let started = std::time::Instant::now();
        let readers: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.read(false).await.1 })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), Freshness::Unavailable);
        }

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(1));

        // Once the backoff has passed, the next read tries again.
        tokio::time::sleep(Duration::from_millis(150)).await;
        cache.read(false).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_backs_off_but_forced_read_retries() {
        let source = StaticSource::new(one_validator());
        let cache = SnapshotCache::new(source.clone(), Duration::from_millis(100), Duration::from_secs(1));

        cache.get(true).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        source.failing.store(true, Ordering::SeqCst);
        assert_eq!(cache.read(true).await.1, Freshness::Stale);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);

        // Entry expired, but the last attempt failed too recently to retry.
        tokio::time::sleep(Duration::from_millis(60)).await;
        let (snap, freshness) = cache.read(false).await;
        assert_eq!(freshness, Freshness::Stale);
        assert_eq!(snap.len(), 1);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);

        cache.read(true).await;
        assert_eq!(source.loads.load(Ordering::SeqCst), 3);
    }
}
