//! Persistence bridge between the in-memory cache and durable storage.
//!
//! Eligible entries are serialized into one [`CacheSnapshot`] blob stored
//! under a single storage key. On restore the whole blob is discarded if
//! its buster string differs from the configured one, if it is older than
//! the configured max age, or if it cannot be parsed.

mod file;
mod lmdb;

pub use file::FileStorage;
pub use lmdb::LmdbStorage;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stoop_core::{
    elapsed_between, CacheEntry, PersistenceConfig, PersistenceError, QueryKey, QueryStatus,
    SharedClock, Timestamp,
};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::CacheStore;

/// Key-value storage that survives restarts.
#[async_trait]
pub trait DurableStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError>;
    async fn set(&self, key: &str, value: String) -> Result<(), PersistenceError>;
    async fn remove(&self, key: &str) -> Result<(), PersistenceError>;
}

/// Volatile storage, for tests and for platforms without a writable disk.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableStorage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), PersistenceError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.values.write().await.remove(key);
        Ok(())
    }
}

/// One persisted cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    pub key: QueryKey,
    pub data: Value,
    pub fetched_at: Timestamp,
}

/// Everything written to durable storage in one blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub buster: String,
    pub persisted_at: Timestamp,
    pub entries: Vec<PersistedEntry>,
}

/// What [`PersistenceBridge::restore`] found.
#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// Nothing persisted yet.
    Missing,
    /// Entries were hydrated into the store.
    Restored { entries: usize },
    /// Blob written by an incompatible version; discarded.
    BusterMismatch { found: String },
    /// Blob older than the max age; discarded.
    Expired { age: Duration },
    /// Blob could not be parsed; discarded.
    Corrupt { reason: String },
}

type EligibilityFn = Arc<dyn Fn(&CacheEntry) -> bool + Send + Sync>;

/// Persists and restores the cache.
pub struct PersistenceBridge {
    storage: Arc<dyn DurableStorage>,
    config: PersistenceConfig,
    clock: SharedClock,
    eligible: EligibilityFn,
}

impl fmt::Debug for PersistenceBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceBridge")
            .field("config", &self.config)
            .finish()
    }
}

impl PersistenceBridge {
    /// Bridge that persists every successfully fetched entry.
    pub fn new(storage: Arc<dyn DurableStorage>, config: PersistenceConfig, clock: SharedClock) -> Self {
        Self {
            storage,
            config,
            clock,
            eligible: Arc::new(|entry: &CacheEntry| {
                entry.status == QueryStatus::Success && entry.data.is_some()
            }),
        }
    }

    /// Replace the predicate that selects which entries are persisted.
    /// Entries without data are never persisted.
    pub fn with_eligibility<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CacheEntry) -> bool + Send + Sync + 'static,
    {
        self.eligible = Arc::new(predicate);
        self
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    /// Build the snapshot for the current store contents.
    pub fn snapshot(&self, store: &CacheStore) -> CacheSnapshot {
        let mut entries: Vec<PersistedEntry> = store
            .entries()
            .into_iter()
            .filter(|entry| (self.eligible)(entry))
            .filter_map(|entry| {
                let data = entry.data?;
                Some(PersistedEntry {
                    key: entry.key,
                    data,
                    fetched_at: entry.fetched_at,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        CacheSnapshot {
            buster: self.config.buster.clone(),
            persisted_at: self.clock.now(),
            entries,
        }
    }

    /// Write `snapshot` to durable storage. An empty snapshot removes the
    /// stored blob instead.
    pub async fn write(&self, snapshot: &CacheSnapshot) -> Result<(), PersistenceError> {
        if snapshot.entries.is_empty() {
            return self.discard().await;
        }
        let blob = serde_json::to_string(snapshot)?;
        self.storage.set(&self.config.storage_key, blob).await
    }

    /// Snapshot the store and write it. Returns the number of entries written.
    pub async fn persist(&self, store: &CacheStore) -> Result<usize, PersistenceError> {
        let snapshot = self.snapshot(store);
        self.write(&snapshot).await?;
        debug!(entries = snapshot.entries.len(), "Persisted cache snapshot");
        Ok(snapshot.entries.len())
    }

    /// Load the persisted snapshot into `store`.
    pub async fn restore(&self, store: &CacheStore) -> Result<RestoreOutcome, PersistenceError> {
        let Some(blob) = self.storage.get(&self.config.storage_key).await? else {
            return Ok(RestoreOutcome::Missing);
        };

        let snapshot = match serde_json::from_str::<CacheSnapshot>(&blob) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable cache snapshot");
                self.discard().await?;
                return Ok(RestoreOutcome::Corrupt {
                    reason: e.to_string(),
                });
            }
        };

        if snapshot.buster != self.config.buster {
            info!(
                found = %snapshot.buster,
                expected = %self.config.buster,
                "Discarding cache snapshot from another version"
            );
            self.discard().await?;
            return Ok(RestoreOutcome::BusterMismatch {
                found: snapshot.buster,
            });
        }

        let age = elapsed_between(snapshot.persisted_at, self.clock.now());
        if age > self.config.max_age() {
            info!(age_secs = age.as_secs(), "Discarding expired cache snapshot");
            self.discard().await?;
            return Ok(RestoreOutcome::Expired { age });
        }

        let mut restored = 0usize;
        for entry in snapshot.entries {
            if store.hydrate(&entry.key, entry.data, entry.fetched_at) {
                restored += 1;
            }
        }
        info!(entries = restored, "Restored cache snapshot");
        Ok(RestoreOutcome::Restored { entries: restored })
    }

    /// Remove the persisted snapshot.
    pub async fn discard(&self) -> Result<(), PersistenceError> {
        self.storage.remove(&self.config.storage_key).await
    }
}

/// Persist the store every `persist_interval` while its contents change, and
/// once more on shutdown.
pub fn spawn_persister(
    bridge: Arc<PersistenceBridge>,
    store: Arc<CacheStore>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(bridge.config().persist_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_written: Option<Vec<PersistedEntry>> = None;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    persist_if_changed(&bridge, &store, &mut last_written).await;
                }
            }
        }

        persist_if_changed(&bridge, &store, &mut last_written).await;
        debug!("Cache persister stopped");
    })
}

async fn persist_if_changed(
    bridge: &PersistenceBridge,
    store: &CacheStore,
    last_written: &mut Option<Vec<PersistedEntry>>,
) {
    let snapshot = bridge.snapshot(store);
    if last_written.as_ref() == Some(&snapshot.entries) {
        return;
    }
    match bridge.write(&snapshot).await {
        Ok(()) => {
            debug!(entries = snapshot.entries.len(), "Persisted cache snapshot");
            *last_written = Some(snapshot.entries);
        }
        Err(e) => {
            warn!(error = %e, "Failed to persist cache snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stoop_core::{query_key, CacheConfig, ManualClock};

    fn setup() -> (Arc<CacheStore>, PersistenceBridge, Arc<MemoryStorage>, ManualClock) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(CacheStore::new(
            CacheConfig::default(),
            Arc::new(clock.clone()),
        ));
        let storage = Arc::new(MemoryStorage::new());
        let bridge = PersistenceBridge::new(
            Arc::clone(&storage) as Arc<dyn DurableStorage>,
            PersistenceConfig::default(),
            Arc::new(clock.clone()),
        );
        (store, bridge, storage, clock)
    }

    fn fresh_store(clock: &ManualClock) -> CacheStore {
        CacheStore::new(CacheConfig::default(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_persist_and_restore_round_trip() {
        let (store, bridge, _, clock) = setup();
        store.set(&query_key!["directory"], json!([{"id": "U1"}]));
        store.set_error(&query_key!["broken"], stoop_core::SyncError::transient("x"));

        assert_eq!(bridge.persist(&store).await.unwrap(), 1);

        let restored = fresh_store(&clock);
        let outcome = bridge.restore(&restored).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Restored { entries: 1 });
        assert_eq!(
            restored.peek(&query_key!["directory"]).unwrap().data,
            Some(json!([{"id": "U1"}]))
        );
        assert!(!restored.contains(&query_key!["broken"]));
    }

    #[tokio::test]
    async fn test_restore_missing() {
        let (store, bridge, _, _) = setup();
        assert_eq!(bridge.restore(&store).await.unwrap(), RestoreOutcome::Missing);
    }

    #[tokio::test]
    async fn test_buster_mismatch_discards_everything() {
        let (store, bridge, storage, clock) = setup();
        store.set(&query_key!["directory"], json!([]));
        bridge.persist(&store).await.unwrap();

        let mut config = PersistenceConfig::default();
        config.buster = "v2".to_string();
        let upgraded = PersistenceBridge::new(
            Arc::clone(&storage) as Arc<dyn DurableStorage>,
            config,
            Arc::new(clock.clone()),
        );
        let restored = fresh_store(&clock);
        let outcome = upgraded.restore(&restored).await.unwrap();

        assert_eq!(
            outcome,
            RestoreOutcome::BusterMismatch {
                found: "v1".to_string()
            }
        );
        assert!(restored.is_empty());
        assert!(storage.get("stoop-query-cache").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_snapshot_is_discarded() {
        let (store, bridge, storage, clock) = setup();
        store.set(&query_key!["directory"], json!([]));
        bridge.persist(&store).await.unwrap();

        clock.advance(Duration::from_secs(25 * 60 * 60));
        let restored = fresh_store(&clock);
        let outcome = bridge.restore(&restored).await.unwrap();

        assert!(matches!(outcome, RestoreOutcome::Expired { .. }));
        assert!(restored.is_empty());
        assert!(storage.get("stoop-query-cache").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_discarded() {
        let (store, bridge, storage, _) = setup();
        storage
            .set("stoop-query-cache", "{not json".to_string())
            .await
            .unwrap();

        let outcome = bridge.restore(&store).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::Corrupt { .. }));
        assert!(storage.get("stoop-query-cache").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_eligibility() {
        let (store, bridge, _, _) = setup();
        let directory = query_key!["directory"];
        let bridge = bridge.with_eligibility(move |entry| directory.matches(&entry.key));
        store.set(&query_key!["directory", "U1"], json!({"id": "U1"}));
        store.set(&query_key!["directory"], json!([{"id": "U1"}]));
        store.set(&query_key!["messages"], json!([]));

        let snapshot = bridge.snapshot(&store);
        let mut keys: Vec<_> = snapshot.entries.iter().map(|e| e.key.to_string()).collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                query_key!["directory"].to_string(),
                query_key!["directory", "U1"].to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_store_removes_snapshot() {
        let (store, bridge, storage, _) = setup();
        store.set(&query_key!["directory"], json!([]));
        bridge.persist(&store).await.unwrap();
        store.clear();

        assert_eq!(bridge.persist(&store).await.unwrap(), 0);
        assert!(storage.get("stoop-query-cache").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persister_writes_on_shutdown() {
        let (store, bridge, storage, _) = setup();
        let bridge = Arc::new(bridge);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_persister(Arc::clone(&bridge), Arc::clone(&store), shutdown_rx);

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.set(&query_key!["directory"], json!(["late"]));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let blob = storage.get("stoop-query-cache").await.unwrap().unwrap();
        let snapshot: CacheSnapshot = serde_json::from_str(&blob).unwrap();
        assert_eq!(snapshot.entries.len(), 1);
    }
}
