//! Fetch coordination with in-flight deduplication.
//!
//! At most one backend fetch runs per key at any time. Concurrent callers
//! for the same key await the same shared future and all settle with its
//! result. Each fetch runs on its own task, so callers that give up never
//! cancel it: the task marks the entry pending, retries transient failures,
//! writes the outcome into the store, and removes itself from the in-flight
//! table. The table is keyed by store epoch, so a caller after a
//! [`CacheStore::clear`] never joins a fetch from before it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use stoop_core::{FetchConfig, QueryKey, SyncError, SyncResult};
use tracing::{debug, warn};

use super::freshness::CacheRead;
use super::store::{CacheStore, FetchSettlement, FetchToken};
use super::traits::QueryFetcher;
use crate::retry::with_retry;

type SharedFetch = Shared<BoxFuture<'static, SyncResult<Value>>>;
type InFlight = HashMap<(u64, QueryKey), SharedFetch>;

struct Inner {
    store: Arc<CacheStore>,
    config: FetchConfig,
    in_flight: Mutex<InFlight>,
    started: AtomicU64,
}

impl Inner {
    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Coordinates reads against the cache store and the backend.
///
/// Cheap to clone; clones share the in-flight table.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<Inner>,
}

impl FetchCoordinator {
    pub fn new(store: Arc<CacheStore>, config: FetchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                in_flight: Mutex::new(HashMap::new()),
                started: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &FetchConfig {
        &self.inner.config
    }

    /// Number of backend fetches started since creation.
    pub fn fetches_started(&self) -> u64 {
        self.inner.started.load(Ordering::Relaxed)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight().len()
    }

    /// Whether a fetch started since the last clear is running for `key`.
    pub fn is_fetching(&self, key: &QueryKey) -> bool {
        let epoch = self.inner.store.epoch();
        self.inner.in_flight().contains_key(&(epoch, key.clone()))
    }

    /// Return data for `key`, fetching only when needed.
    ///
    /// - fresh data is returned as a cache hit
    /// - stale data is returned immediately and revalidated in the background
    /// - no data means the caller waits for a (possibly shared) fetch
    pub async fn ensure(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> SyncResult<CacheRead<Value>> {
        let stale_time = self.inner.store.config().stale_time();
        self.ensure_with_stale_time(key, fetcher, stale_time).await
    }

    /// [`FetchCoordinator::ensure`] with a per-call stale time.
    pub async fn ensure_with_stale_time(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
        stale_time: Duration,
    ) -> SyncResult<CacheRead<Value>> {
        let store = &self.inner.store;
        store.register_fetcher(key, Arc::clone(&fetcher));

        if let Some(entry) = store.get(key) {
            let now = store.now();
            if let Some(data) = entry.data.clone() {
                if entry.is_fresh(now) {
                    return Ok(CacheRead::from_cache(data, entry.fetched_at, false));
                }
                debug!(key = %key, "Serving stale data while revalidating");
                self.spawn_fetch(key.clone(), fetcher, stale_time);
                return Ok(CacheRead::from_cache(data, entry.fetched_at, true));
            }
        }

        let value = self.shared_fetch(key, fetcher, stale_time).await?;
        let fetched_at = store
            .peek(key)
            .map(|entry| entry.fetched_at)
            .unwrap_or_else(|| store.now());
        Ok(CacheRead::from_network(value, fetched_at))
    }

    /// Fetch `key` regardless of freshness, joining any fetch already in
    /// flight for it.
    pub async fn fetch(&self, key: &QueryKey, fetcher: Arc<dyn QueryFetcher>) -> SyncResult<Value> {
        self.inner.store.register_fetcher(key, Arc::clone(&fetcher));
        let stale_time = self.inner.store.config().stale_time();
        self.shared_fetch(key, fetcher, stale_time).await
    }

    /// Start a background fetch for `key` if none is running.
    pub fn prefetch(&self, key: &QueryKey, fetcher: Arc<dyn QueryFetcher>) {
        self.inner.store.register_fetcher(key, Arc::clone(&fetcher));
        let stale_time = self.inner.store.config().stale_time();
        self.spawn_fetch(key.clone(), fetcher, stale_time);
    }

    /// Mark entries matched by `filter` stale and refetch the subscribed
    /// ones in the background. Returns the number of refetches started.
    pub fn invalidate(&self, filter: &QueryKey) -> usize {
        let targets = self.inner.store.invalidate(filter);
        let stale_time = self.inner.store.config().stale_time();
        let count = targets.len();
        for target in targets {
            self.spawn_fetch(target.key, target.fetcher, stale_time);
        }
        count
    }

    fn shared_fetch(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
        stale_time: Duration,
    ) -> SharedFetch {
        let mut in_flight = self.inner.in_flight();
        let epoch = self.inner.store.epoch();
        if let Some(existing) = in_flight.get(&(epoch, key.clone())) {
            debug!(key = %key, "Joining in-flight fetch");
            return existing.clone();
        }

        let token = self.inner.store.begin_fetch(key);
        let run = run_fetch(Arc::clone(&self.inner), key.clone(), fetcher, stale_time, token);
        let fetch = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(run);
                let label = key.to_string();
                async move {
                    task.await.unwrap_or_else(|e| {
                        warn!(key = %label, error = %e, "Fetch task ended abnormally");
                        Err(SyncError::transient(format!("fetch task failed: {e}")))
                    })
                }
                .boxed()
                .shared()
            }
            Err(_) => run.boxed().shared(),
        };
        in_flight.insert((token.epoch(), key.clone()), fetch.clone());
        fetch
    }

    fn spawn_fetch(&self, key: QueryKey, fetcher: Arc<dyn QueryFetcher>, stale_time: Duration) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(key = %key, "No async runtime available, skipping background fetch");
            return;
        }
        // The fetch runs on its own task; nobody needs to wait for it.
        drop(self.shared_fetch(&key, fetcher, stale_time));
    }
}

async fn run_fetch(
    inner: Arc<Inner>,
    key: QueryKey,
    fetcher: Arc<dyn QueryFetcher>,
    stale_time: Duration,
    token: FetchToken,
) -> SyncResult<Value> {
    inner.started.fetch_add(1, Ordering::Relaxed);

    let label = key.to_string();
    let outcome = with_retry(
        &inner.config.retry,
        inner.config.request_timeout(),
        "fetch",
        &label,
        || fetcher.fetch(&key),
    )
    .await;

    let outcome = match inner.store.settle_fetch(&key, &outcome, stale_time, token) {
        FetchSettlement::Applied => outcome,
        FetchSettlement::Superseded(current) => {
            debug!(key = %key, "Pushed changes arrived during fetch, keeping them");
            outcome.map(|_| current)
        }
        FetchSettlement::Discarded => {
            debug!(key = %key, "Discarding fetch result for cleared cache");
            outcome
        }
    };
    inner.in_flight().remove(&(token.epoch(), key));
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::traits::fetcher_fn;
    use futures_util::future::join_all;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use stoop_core::{query_key, CacheConfig, Clock, ManualClock, QueryStatus, RetryConfig};

    fn coordinator() -> (FetchCoordinator, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(CacheStore::new(
            CacheConfig::default(),
            Arc::new(clock.clone()),
        ));
        let config = FetchConfig {
            request_timeout_ms: 1_000,
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 10,
                max_backoff_ms: 100,
                backoff_multiplier: 2.0,
            },
        };
        (FetchCoordinator::new(store, config), clock)
    }

    fn counting_fetcher(calls: Arc<AtomicU32>, delay: Duration) -> Arc<dyn QueryFetcher> {
        fetcher_fn(move |_key| {
            let calls = Arc::clone(&calls);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(delay).await;
                Ok(json!({"fetch": n}))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensures_share_one_fetch() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::from_millis(50));
        let key = query_key!["directory"];

        let reads = join_all((0..10).map(|_| coordinator.ensure(&key, Arc::clone(&fetcher)))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for read in reads {
            let read = read.unwrap();
            assert!(read.was_cache_miss());
            assert_eq!(read.into_value(), json!({"fetch": 1}));
        }
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_entry_is_served_from_cache() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::ZERO);
        let key = query_key!["directory"];

        coordinator.ensure(&key, Arc::clone(&fetcher)).await.unwrap();
        let second = coordinator.ensure(&key, Arc::clone(&fetcher)).await.unwrap();

        assert!(second.was_cache_hit());
        assert!(!second.was_stale());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entry_served_and_revalidated() {
        let (coordinator, clock) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::from_millis(5));
        let key = query_key!["directory"];

        coordinator.ensure(&key, Arc::clone(&fetcher)).await.unwrap();
        clock.advance(Duration::from_secs(31));

        let stale = coordinator.ensure(&key, Arc::clone(&fetcher)).await.unwrap();
        assert!(stale.was_cache_hit());
        assert!(stale.was_stale());
        assert_eq!(stale.into_value(), json!({"fetch": 1}));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let entry = coordinator.store().peek(&key).unwrap();
        assert_eq!(entry.data, Some(json!({"fetch": 2})));
        assert!(entry.is_fresh(clock.now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_retries_and_records_error() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = fetcher_fn(move |_key| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::transient("offline")) }
        });
        let key = query_key!["directory"];

        let result = coordinator.ensure(&key, fetcher).await;
        assert!(matches!(result, Err(SyncError::TransientNetwork { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let entry = coordinator.store().peek(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.is_consistent());
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_fails_without_retry() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = fetcher_fn(move |key: QueryKey| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(SyncError::not_found(key.to_string())) }
        });

        let result = coordinator.ensure(&query_key!["listing", "L1"], fetcher).await;
        assert_eq!(result.unwrap_err(), SyncError::not_found("listing/L1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_refetches_only_subscribed_entries() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::ZERO);
        let watched = query_key!["marketplace", "list"];
        let unwatched = query_key!["marketplace", "user", "U1"];

        coordinator.ensure(&watched, Arc::clone(&fetcher)).await.unwrap();
        coordinator.ensure(&unwatched, Arc::clone(&fetcher)).await.unwrap();
        let _subscription = coordinator.store().subscribe(&watched);

        assert_eq!(coordinator.invalidate(&query_key!["marketplace"]), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleared_store_ignores_late_response() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::from_millis(100));
        let key = query_key!["directory"];

        let store = Arc::clone(coordinator.store());
        let (read, _) = tokio::join!(coordinator.ensure(&key, fetcher), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store.clear();
        });

        assert!(read.is_ok());
        assert!(!coordinator.store().contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_after_clear_starts_its_own_fetch() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::from_millis(100));
        let key = query_key!["messages"];
        let store = Arc::clone(coordinator.store());

        let previous_session = {
            let coordinator = coordinator.clone();
            let fetcher = Arc::clone(&fetcher);
            let key = key.clone();
            tokio::spawn(async move { coordinator.ensure(&key, fetcher).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.clear();

        let read = coordinator.ensure(&key, fetcher).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(read.into_value(), json!({"fetch": 2}));
        assert!(previous_session.await.unwrap().is_ok());
        assert_eq!(store.peek(&key).unwrap().data, Some(json!({"fetch": 2})));
        assert_eq!(coordinator.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_ensure_still_settles_entry() {
        let (coordinator, _) = coordinator();
        let calls = Arc::new(AtomicU32::new(0));
        let fetcher = counting_fetcher(Arc::clone(&calls), Duration::from_millis(100));
        let key = query_key!["directory"];

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), coordinator.ensure(&key, fetcher)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.in_flight_count(), 0);
        let entry = coordinator.store().peek(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.data, Some(json!({"fetch": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pushed_insert_survives_slower_revalidation() {
        let (coordinator, clock) = coordinator();
        let key = query_key!["marketplace", "list"];
        let fetcher = fetcher_fn(|_key| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!([{"id": "a"}]))
        });
        coordinator.store().set(&key, json!([{"id": "a"}]));
        clock.advance(Duration::from_secs(31));

        let stale = coordinator.ensure(&key, fetcher).await.unwrap();
        assert!(stale.was_stale());
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.store().modify(&key, true, |current| {
            crate::cache::apply_change(
                current,
                stoop_core::ChangeOperation::Insert,
                &json!({"id": "b"}),
                "id",
                stoop_core::InsertPlacement::Back,
            )
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let entry = coordinator.store().peek(&key).unwrap();
        assert_eq!(entry.data, Some(json!([{"id": "a"}, {"id": "b"}])));
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(!entry.is_fresh(clock.now()));
        assert!(!coordinator.is_fetching(&key));
    }
}
