//! Optimistic mutations with rollback.
//!
//! A mutation edits the cache immediately, sends the write to the backend,
//! and then either folds the authoritative row back into the cache or
//! restores every touched entry to its exact pre-mutation state.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use stoop_core::{
    ChangeOperation, InsertPlacement, MutationConfig, MutationRequest, QueryKey, RemoteSource,
    SyncResult,
};
use tracing::{debug, info, warn};

use super::collection::{apply_change, identity_of, remove_row, upsert_row};
use super::fetch::FetchCoordinator;
use super::store::{CacheStore, Modification};
use crate::retry::with_retry;

type PatchFn = Arc<dyn Fn(Option<&Value>) -> Modification + Send + Sync>;

/// An optimistic edit of one cache entry.
#[derive(Clone)]
pub struct OptimisticPatch {
    key: QueryKey,
    patch: PatchFn,
}

impl OptimisticPatch {
    /// Arbitrary edit of the entry's current data.
    pub fn custom<F>(key: QueryKey, patch: F) -> Self
    where
        F: Fn(Option<&Value>) -> Modification + Send + Sync + 'static,
    {
        Self {
            key,
            patch: Arc::new(patch),
        }
    }

    /// Insert or merge `row` into a cached collection or single row.
    pub fn upsert(
        key: QueryKey,
        row: Value,
        identity_field: impl Into<String>,
        placement: InsertPlacement,
    ) -> Self {
        let field = identity_field.into();
        Self::custom(key, move |current| {
            match current.and_then(|data| upsert_row(data, &row, &field, placement)) {
                Some(updated) => Modification::Replace(updated),
                None => Modification::Keep,
            }
        })
    }

    /// Remove the row with identity `id` from a cached collection.
    pub fn remove(key: QueryKey, id: Value, identity_field: impl Into<String>) -> Self {
        let field = identity_field.into();
        Self::custom(key, move |current| {
            match current.and_then(|data| remove_row(data, &id, &field)) {
                Some(updated) => Modification::Replace(updated),
                None => Modification::Keep,
            }
        })
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    fn apply(&self, current: Option<&Value>) -> Modification {
        (self.patch)(current)
    }
}

impl fmt::Debug for OptimisticPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimisticPatch")
            .field("key", &self.key)
            .finish()
    }
}

/// How the server's response is folded back into the patched entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reconcile {
    /// Apply the returned row as a change of the request's operation kind.
    #[default]
    Auto,
    /// Keep the optimistic data until the next fetch.
    None,
}

/// A write plus its optimistic effects.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub request: MutationRequest,
    pub optimistic: Vec<OptimisticPatch>,
    pub reconcile: Reconcile,
    /// Prefix filters invalidated after the write succeeds.
    pub invalidates: Vec<QueryKey>,
}

impl Mutation {
    pub fn new(request: MutationRequest) -> Self {
        Self {
            request,
            optimistic: Vec::new(),
            reconcile: Reconcile::Auto,
            invalidates: Vec::new(),
        }
    }

    pub fn optimistic(mut self, patch: OptimisticPatch) -> Self {
        self.optimistic.push(patch);
        self
    }

    pub fn invalidates(mut self, filter: QueryKey) -> Self {
        self.invalidates.push(filter);
        self
    }

    pub fn reconcile(mut self, reconcile: Reconcile) -> Self {
        self.reconcile = reconcile;
        self
    }
}

/// Runs [`Mutation`]s against the backend.
pub struct MutationExecutor {
    coordinator: FetchCoordinator,
    remote: Arc<dyn RemoteSource>,
    config: MutationConfig,
    identity_field: String,
    placement: InsertPlacement,
}

impl MutationExecutor {
    pub fn new(
        coordinator: FetchCoordinator,
        remote: Arc<dyn RemoteSource>,
        config: MutationConfig,
    ) -> Self {
        Self {
            coordinator,
            remote,
            config,
            identity_field: "id".to_string(),
            placement: InsertPlacement::Back,
        }
    }

    /// Identity field and insert placement used when reconciling results.
    pub fn with_row_layout(
        mut self,
        identity_field: impl Into<String>,
        placement: InsertPlacement,
    ) -> Self {
        self.identity_field = identity_field.into();
        self.placement = placement;
        self
    }

    fn store(&self) -> &Arc<CacheStore> {
        self.coordinator.store()
    }

    /// Apply optimistic patches, run the write, then reconcile or roll back.
    ///
    /// On failure every patched entry is restored to its pre-mutation
    /// snapshot and the error is returned unchanged. If the store is
    /// cleared while the write is in flight, the cache is left alone either
    /// way.
    pub async fn mutate(&self, mutation: Mutation) -> SyncResult<Value> {
        let store = self.store();
        let resource = mutation.request.resource.clone();
        let epoch = store.epoch();

        let snapshots: Vec<(QueryKey, _)> = mutation
            .optimistic
            .iter()
            .map(|patch| (patch.key.clone(), store.peek(&patch.key)))
            .collect();
        for patch in &mutation.optimistic {
            store.modify(&patch.key, false, |current| patch.apply(current));
        }
        debug!(
            resource = %resource,
            operation = ?mutation.request.operation,
            patched = snapshots.len(),
            "Applied optimistic update"
        );

        let request = &mutation.request;
        let remote = &self.remote;
        let outcome = with_retry(
            &self.config.retry,
            self.config.request_timeout(),
            "mutate",
            &resource,
            || remote.execute(request),
        )
        .await;

        if store.epoch() != epoch {
            info!(
                resource = %resource,
                succeeded = outcome.is_ok(),
                "Cache cleared during mutation, skipping reconcile and rollback"
            );
            return outcome;
        }

        match outcome {
            Ok(row) => {
                if mutation.reconcile == Reconcile::Auto {
                    self.reconcile(&mutation, &row);
                }
                for filter in &mutation.invalidates {
                    self.coordinator.invalidate(filter);
                }
                info!(resource = %resource, "Mutation committed");
                Ok(row)
            }
            Err(err) => {
                for (key, snapshot) in snapshots.into_iter().rev() {
                    store.restore(&key, snapshot);
                }
                warn!(
                    resource = %resource,
                    error = %err,
                    "Mutation failed, optimistic update rolled back"
                );
                Err(err)
            }
        }
    }

    fn reconcile(&self, mutation: &Mutation, row: &Value) {
        let operation = mutation.request.operation;
        // Deletes often return no body; fall back to the request payload for
        // the identity.
        let change = if operation == ChangeOperation::Delete
            && identity_of(row, &self.identity_field).is_none()
        {
            &mutation.request.payload
        } else {
            row
        };
        let store = self.store();
        for patch in &mutation.optimistic {
            store.modify(&patch.key, true, |current| {
                apply_change(current, operation, change, &self.identity_field, self.placement)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use stoop_core::{query_key, CacheConfig, FetchConfig, ManualClock, QueryRequest, RetryConfig, SyncError};
    use std::time::Duration;

    struct ScriptedRemote {
        calls: AtomicU32,
        responses: Mutex<Vec<SyncResult<Value>>>,
        delay: Duration,
    }

    impl ScriptedRemote {
        fn new(mut responses: Vec<SyncResult<Value>>) -> Self {
            responses.reverse();
            Self {
                calls: AtomicU32::new(0),
                responses: Mutex::new(responses),
                delay: Duration::ZERO,
            }
        }

        fn slow(responses: Vec<SyncResult<Value>>, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(responses)
            }
        }
    }

    #[async_trait]
    impl RemoteSource for ScriptedRemote {
        async fn query(&self, _request: &QueryRequest) -> SyncResult<Value> {
            Ok(json!([]))
        }

        async fn execute(&self, _request: &MutationRequest) -> SyncResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(SyncError::transient("no scripted response")))
        }
    }

    fn executor(remote: Arc<ScriptedRemote>) -> (MutationExecutor, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::new(
            CacheConfig::default(),
            Arc::new(ManualClock::starting_now()),
        ));
        let coordinator = FetchCoordinator::new(Arc::clone(&store), FetchConfig::default());
        let config = MutationConfig {
            request_timeout_ms: 1_000,
            retry: RetryConfig {
                max_retries: 2,
                initial_backoff_ms: 10,
                max_backoff_ms: 50,
                backoff_multiplier: 2.0,
            },
        };
        (MutationExecutor::new(coordinator, remote, config), store)
    }

    fn insert_listing(title: &str) -> Mutation {
        let row = json!({"id": "L2", "title": title});
        Mutation::new(MutationRequest::new(
            "listings",
            ChangeOperation::Insert,
            row.clone(),
        ))
        .optimistic(OptimisticPatch::upsert(
            query_key!["marketplace", "list"],
            row,
            "id",
            InsertPlacement::Front,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_mutation_reconciles_server_row() {
        let remote = Arc::new(ScriptedRemote::new(vec![Ok(
            json!({"id": "L2", "title": "Desk", "created_at": "2026-01-01"}),
        )]));
        let (executor, store) = executor(Arc::clone(&remote));
        let key = query_key!["marketplace", "list"];
        store.set(&key, json!([{"id": "L1", "title": "Lamp"}]));

        let row = executor.mutate(insert_listing("Desk")).await.unwrap();

        assert_eq!(row["created_at"], json!("2026-01-01"));
        assert_eq!(
            store.peek(&key).unwrap().data,
            Some(json!([
                {"id": "L2", "title": "Desk", "created_at": "2026-01-01"},
                {"id": "L1", "title": "Lamp"}
            ]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_mutation_restores_snapshot_exactly() {
        let remote = Arc::new(ScriptedRemote::new(vec![Err(SyncError::validation(
            "title",
            "too long",
        ))]));
        let (executor, store) = executor(Arc::clone(&remote));
        let key = query_key!["marketplace", "list"];
        store.set(&key, json!([{"id": "L1", "title": "Lamp"}]));
        let before = store.peek(&key);

        let result = executor.mutate(insert_listing("Desk")).await;

        assert_eq!(result, Err(SyncError::validation("title", "too long")));
        assert_eq!(store.peek(&key), before);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_mutation_failure_retries_twice_then_rolls_back() {
        let remote = Arc::new(ScriptedRemote::new(vec![]));
        let (executor, store) = executor(Arc::clone(&remote));
        let key = query_key!["marketplace", "list"];
        store.set(&key, json!([]));
        let before = store.peek(&key);

        let result = executor.mutate(insert_listing("Desk")).await;

        assert!(matches!(result, Err(SyncError::TransientNetwork { .. })));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.peek(&key), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollback_of_entry_created_optimistically() {
        let remote = Arc::new(ScriptedRemote::new(vec![Err(SyncError::permission_denied(
            "listings", "not owner",
        ))]));
        let (executor, store) = executor(remote);
        let key = query_key!["listing", "L5"];
        let mutation = Mutation::new(MutationRequest::new(
            "listings",
            ChangeOperation::Update,
            json!({"id": "L5"}),
        ))
        .optimistic(OptimisticPatch::custom(key.clone(), |_| {
            Modification::Replace(json!({"id": "L5", "sold": true}))
        }));

        assert!(executor.mutate(mutation).await.is_err());
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_reconciles_with_request_identity() {
        let remote = Arc::new(ScriptedRemote::new(vec![Ok(Value::Null)]));
        let (executor, store) = executor(remote);
        let key = query_key!["marketplace", "list"];
        store.set(&key, json!([{"id": "L1"}, {"id": "L2"}]));

        let mutation = Mutation::new(MutationRequest::new(
            "listings",
            ChangeOperation::Delete,
            json!({"id": "L1"}),
        ))
        .optimistic(OptimisticPatch::remove(key.clone(), json!("L1"), "id"));

        executor.mutate(mutation).await.unwrap();
        assert_eq!(store.peek(&key).unwrap().data, Some(json!([{"id": "L2"}])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_after_clear_does_not_restore_previous_rows() {
        let remote = Arc::new(ScriptedRemote::slow(
            vec![Err(SyncError::validation("title", "too long"))],
            Duration::from_millis(100),
        ));
        let (executor, store) = executor(remote);
        let key = query_key!["marketplace", "list"];
        store.set(&key, json!([{"id": "secret"}]));

        let clearing = Arc::clone(&store);
        let (result, _) = tokio::join!(executor.mutate(insert_listing("Desk")), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clearing.clear();
        });

        assert!(result.is_err());
        assert!(!store.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_clear_does_not_reconcile() {
        let remote = Arc::new(ScriptedRemote::slow(
            vec![Ok(json!({"id": "L2", "title": "Desk"}))],
            Duration::from_millis(100),
        ));
        let (executor, store) = executor(remote);
        let key = query_key!["marketplace", "list"];
        store.set(&key, json!([{"id": "L1"}]));

        let clearing = Arc::clone(&store);
        let (result, _) = tokio::join!(executor.mutate(insert_listing("Desk")), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            clearing.clear();
        });

        assert_eq!(result.unwrap()["id"], json!("L2"));
        assert!(store.is_empty());
    }
}
