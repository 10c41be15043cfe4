//! The sync client.
//!
//! [`SyncClient`] wires the cache store, fetch coordinator, mutation
//! executor, realtime reconciler, presence tracker, evictor and persistence
//! bridge together behind the API the UI talks to. It is cheap to clone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde_json::Value;
use stoop_core::{
    system_clock, AuthState, CacheEntry, CredentialProvider, Identity, PresenceSink, PushChannel,
    QueryKey, QueryRequest, RemoteSource, SharedClock, SyncConfig, SyncResult, UserId,
};
use stoop_realtime::{
    spawn_heartbeat, spawn_sweeper, ConnectionState, PresenceTracker, RealtimeHandle,
    RealtimeReconciler, RealtimeStatus,
};
use stoop_storage::cache::{spawn_maintenance, MaintenanceMetrics, MaintenanceSnapshot};
use stoop_storage::{
    spawn_persister, CacheRead, CacheStats, CacheStore, DurableStorage,
    Evictor, FetchCoordinator, FileStorage, MaintenanceConfig, MemoryProbe, Mutation,
    MutationExecutor, PersistenceBridge, QueryFetcher, RemoteFetcher, RestoreOutcome,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::live::{decode, LiveQuery};
use crate::session::{spawn_session_watcher, SessionTransition};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// BUILDER
// ============================================================================

/// Assembles a [`SyncClient`].
pub struct SyncClientBuilder {
    config: SyncConfig,
    remote: Arc<dyn RemoteSource>,
    push: Option<Arc<dyn PushChannel>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    presence_sink: Option<Arc<dyn PresenceSink>>,
    storage: Option<Arc<dyn DurableStorage>>,
    probe: Option<Arc<dyn MemoryProbe>>,
    clock: SharedClock,
    classes: Vec<QueryKey>,
}

impl SyncClientBuilder {
    pub fn new(remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            config: SyncConfig::default(),
            remote,
            push: None,
            credentials: None,
            presence_sink: None,
            storage: None,
            probe: None,
            clock: system_clock(),
            classes: Vec::new(),
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Server-push channel. Without one the client never goes realtime.
    pub fn push_channel(mut self, channel: Arc<dyn PushChannel>) -> Self {
        self.push = Some(channel);
        self
    }

    /// Credential provider. Without one the client acts as permanently
    /// signed in.
    pub fn credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Where the signed-in user's own heartbeats are announced.
    pub fn presence_sink(mut self, sink: Arc<dyn PresenceSink>) -> Self {
        self.presence_sink = Some(sink);
        self
    }

    /// Durable storage for cache snapshots. Defaults to file storage in
    /// `persistence.directory` when that is set, otherwise no persistence.
    pub fn durable_storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Memory probe for the evictor. Defaults to the cache footprint against
    /// `memory.budget_bytes`.
    pub fn memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Resource class (prefix key) to follow over the push channel.
    pub fn resource_class(mut self, class: QueryKey) -> Self {
        if !self.classes.contains(&class) {
            self.classes.push(class);
        }
        self
    }

    pub fn build(self) -> SyncResult<SyncClient> {
        self.config.validate()?;
        let config = self.config;
        let clock = self.clock;

        let store = Arc::new(CacheStore::new(config.cache.clone(), Arc::clone(&clock)));
        let coordinator = FetchCoordinator::new(Arc::clone(&store), config.fetch.clone());
        let executor = MutationExecutor::new(
            coordinator.clone(),
            Arc::clone(&self.remote),
            config.mutation.clone(),
        )
        .with_row_layout(
            config.realtime.identity_field.clone(),
            config.realtime.insert_placement,
        );
        let presence = Arc::new(PresenceTracker::new(&config.presence, Arc::clone(&clock)));
        let evictor = Arc::new(match self.probe {
            Some(probe) => Evictor::new(Arc::clone(&store), probe, config.memory.clone()),
            None => Evictor::with_footprint_probe(Arc::clone(&store), config.memory.clone()),
        });

        let storage = self.storage.or_else(|| {
            config
                .persistence
                .directory
                .clone()
                .map(|directory| Arc::new(FileStorage::new(directory)) as Arc<dyn DurableStorage>)
        });
        let persistence = storage.map(|storage| {
            Arc::new(PersistenceBridge::new(
                storage,
                config.persistence.clone(),
                Arc::clone(&clock),
            ))
        });

        let (shutdown_tx, _) = watch::channel(false);

        Ok(SyncClient {
            inner: Arc::new(Inner {
                config,
                clock,
                remote: self.remote,
                store,
                coordinator,
                executor,
                presence,
                evictor,
                persistence,
                push: self.push,
                credentials: self.credentials,
                presence_sink: self.presence_sink,
                classes: Mutex::new(self.classes),
                realtime: Mutex::new(None),
                heartbeat: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                maintenance: Mutex::new(None),
                shutdown_tx,
                started: AtomicBool::new(false),
            }),
        })
    }
}

// ============================================================================
// CLIENT
// ============================================================================

struct Heartbeat {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    config: SyncConfig,
    clock: SharedClock,
    remote: Arc<dyn RemoteSource>,
    store: Arc<CacheStore>,
    coordinator: FetchCoordinator,
    executor: MutationExecutor,
    presence: Arc<PresenceTracker>,
    evictor: Arc<Evictor>,
    persistence: Option<Arc<PersistenceBridge>>,
    push: Option<Arc<dyn PushChannel>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    presence_sink: Option<Arc<dyn PresenceSink>>,
    classes: Mutex<Vec<QueryKey>>,
    realtime: Mutex<Option<RealtimeHandle>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    maintenance: Mutex<Option<Arc<MaintenanceMetrics>>>,
    shutdown_tx: watch::Sender<bool>,
    started: AtomicBool,
}

/// Client-side sync core.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

/// Non-owning reference held by background tasks.
#[derive(Clone)]
pub(crate) struct WeakSyncClient {
    inner: Weak<Inner>,
}

impl WeakSyncClient {
    pub(crate) fn upgrade(&self) -> Option<SyncClient> {
        self.inner.upgrade().map(|inner| SyncClient { inner })
    }
}

impl SyncClient {
    pub fn builder(remote: Arc<dyn RemoteSource>) -> SyncClientBuilder {
        SyncClientBuilder::new(remote)
    }

    pub(crate) fn downgrade(&self) -> WeakSyncClient {
        WeakSyncClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn coordinator(&self) -> &FetchCoordinator {
        &self.inner.coordinator
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.inner.presence
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.inner.evictor
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore the persisted cache and start the background tasks.
    ///
    /// Returns what the restore found, or `None` without persistence. Calling
    /// `start` again is a no-op.
    pub async fn start(&self) -> SyncResult<Option<RestoreOutcome>> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("Sync client already started");
            return Ok(None);
        }

        let outcome = match &inner.persistence {
            Some(bridge) => Some(bridge.restore(&inner.store).await?),
            None => None,
        };

        let shutdown_rx = inner.shutdown_tx.subscribe();
        let mut tasks = Vec::new();

        let (maintenance, metrics) = spawn_maintenance(
            Arc::clone(&inner.store),
            Arc::clone(&inner.evictor),
            MaintenanceConfig::from_sections(&inner.config.cache, &inner.config.memory),
            shutdown_rx.clone(),
        );
        tasks.push(maintenance);
        *lock(&inner.maintenance) = Some(metrics);

        tasks.push(spawn_sweeper(
            Arc::clone(&inner.presence),
            inner.config.presence.sweep_interval(),
            shutdown_rx.clone(),
        ));

        if let Some(bridge) = &inner.persistence {
            tasks.push(spawn_persister(
                Arc::clone(bridge),
                Arc::clone(&inner.store),
                shutdown_rx.clone(),
            ));
        }

        match &inner.credentials {
            Some(provider) => {
                let auth_rx = provider.watch();
                let initial = auth_rx.borrow().clone();
                if let AuthState::SignedIn(identity) = &initial {
                    self.sign_in(identity);
                }
                tasks.push(spawn_session_watcher(
                    self.downgrade(),
                    initial,
                    auth_rx,
                    shutdown_rx,
                ));
            }
            None => self.start_realtime(),
        }

        lock(&inner.tasks).extend(tasks);
        tracing::info!(
            restored = ?outcome,
            realtime = inner.push.is_some(),
            persistence = inner.persistence.is_some(),
            "Sync client started"
        );
        Ok(outcome)
    }

    /// Stop every background task. A final snapshot is persisted.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown_tx.send_replace(true);
        self.stop_realtime().await;
        self.stop_heartbeat().await;

        let tasks: Vec<JoinHandle<()>> = lock(&inner.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Sync client stopped");
    }

    // ------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------

    /// Go realtime for `identity` and start announcing its presence.
    pub fn sign_in(&self, identity: &Identity) {
        self.start_realtime();

        let Some(sink) = &self.inner.presence_sink else {
            return;
        };
        let mut heartbeat = lock(&self.inner.heartbeat);
        if heartbeat.is_none() {
            let (stop, stop_rx) = watch::channel(false);
            let task = spawn_heartbeat(
                Arc::clone(sink),
                identity.user_id,
                self.inner.config.presence.heartbeat_interval(),
                Arc::clone(&self.inner.clock),
                stop_rx,
            );
            *heartbeat = Some(Heartbeat { stop, task });
        }
        tracing::info!(user_id = %identity.user_id, "Signed in");
    }

    /// Drop everything tied to the session: stop realtime and heartbeats,
    /// clear the cache and presence map, and discard the persisted snapshot.
    pub async fn sign_out(&self) {
        let inner = &self.inner;
        self.stop_realtime().await;
        self.stop_heartbeat().await;

        let entries = inner.store.clear();
        let users = inner.presence.clear();
        if let Some(bridge) = &inner.persistence {
            if let Err(e) = bridge.discard().await {
                tracing::warn!(error = %e, "Failed to discard persisted cache");
            }
        }
        tracing::info!(entries, users, "Signed out, local state cleared");
    }

    pub(crate) async fn apply_session(&self, transition: SessionTransition) {
        tracing::debug!(?transition, "Applying session transition");
        match transition {
            SessionTransition::Unchanged => {}
            SessionTransition::SignedIn(identity) => self.sign_in(&identity),
            SessionTransition::Refreshed => {
                let refreshed = lock(&self.inner.realtime)
                    .as_ref()
                    .map(RealtimeHandle::credentials_refreshed)
                    .is_some();
                if !refreshed {
                    self.start_realtime();
                }
            }
            SessionTransition::SwitchedUser(identity) => {
                self.sign_out().await;
                self.sign_in(&identity);
            }
            SessionTransition::SignedOut => self.sign_out().await,
        }
    }

    fn start_realtime(&self) {
        let inner = &self.inner;
        let Some(push) = &inner.push else {
            return;
        };
        let mut realtime = lock(&inner.realtime);
        match realtime.as_ref() {
            Some(handle) if handle.is_running() => handle.credentials_refreshed(),
            _ => {
                let mut reconciler = RealtimeReconciler::new(
                    Arc::clone(&inner.store),
                    Arc::clone(push),
                    inner.config.realtime.clone(),
                )
                .with_presence(Arc::clone(&inner.presence));
                for class in lock(&inner.classes).iter() {
                    reconciler = reconciler.subscribe_class(class.clone());
                }
                *realtime = Some(reconciler.spawn());
            }
        }
    }

    async fn stop_realtime(&self) {
        let handle = lock(&self.inner.realtime).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
        }
    }

    async fn stop_heartbeat(&self) {
        let heartbeat = lock(&self.inner.heartbeat).take();
        if let Some(Heartbeat { stop, task }) = heartbeat {
            stop.send_replace(true);
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Heartbeat task ended abnormally");
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetcher that runs `request` against the remote source.
    pub fn remote_fetcher(&self, request: QueryRequest) -> Arc<dyn QueryFetcher> {
        Arc::new(RemoteFetcher::new(Arc::clone(&self.inner.remote), request))
    }

    /// Read `key` through the cache with freshness details.
    pub async fn ensure(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> SyncResult<CacheRead<Value>> {
        self.inner.coordinator.ensure(key, fetcher).await
    }

    /// Read `key` through the cache.
    pub async fn ensure_data(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> SyncResult<Value> {
        Ok(self.ensure(key, fetcher).await?.into_value())
    }

    /// Read `key` through the cache, fetching with `request` when needed.
    pub async fn ensure_query(&self, key: &QueryKey, request: QueryRequest) -> SyncResult<Value> {
        self.ensure_data(key, self.remote_fetcher(request)).await
    }

    /// Read `key` through the cache and decode it.
    pub async fn ensure_as<T: DeserializeOwned>(
        &self,
        key: &QueryKey,
        fetcher: Arc<dyn QueryFetcher>,
    ) -> SyncResult<T> {
        let value = self.ensure_data(key, fetcher).await?;
        decode(key, value)
    }

    /// Force a network read of `key`.
    pub async fn fetch(&self, key: &QueryKey, fetcher: Arc<dyn QueryFetcher>) -> SyncResult<Value> {
        self.inner.coordinator.fetch(key, fetcher).await
    }

    pub fn prefetch(&self, key: &QueryKey, fetcher: Arc<dyn QueryFetcher>) {
        self.inner.coordinator.prefetch(key, fetcher);
    }

    /// Observe `key` without triggering a fetch.
    pub fn subscribe(&self, key: &QueryKey) -> LiveQuery {
        LiveQuery::new(self.inner.store.subscribe(key))
    }

    /// Observe `key` and fetch it in the background unless it is fresh.
    pub fn watch(&self, key: &QueryKey, fetcher: Arc<dyn QueryFetcher>) -> LiveQuery {
        let live = self.subscribe(key);
        if live.entry().is_fresh(self.inner.store.now()) {
            self.inner.store.register_fetcher(key, fetcher);
        } else {
            self.inner.coordinator.prefetch(key, fetcher);
        }
        live
    }

    /// Current entry for `key` without counting an access.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.inner.store.peek(key)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub async fn mutate(&self, mutation: Mutation) -> SyncResult<Value> {
        self.inner.executor.mutate(mutation).await
    }

    /// Mark entries under `filter` stale and refetch the observed ones.
    pub fn invalidate(&self, filter: &QueryKey) -> usize {
        self.inner.coordinator.invalidate(filter)
    }

    /// Persist a snapshot now. Returns the number of entries written, or
    /// zero without persistence.
    pub async fn persist_now(&self) -> SyncResult<usize> {
        match &self.inner.persistence {
            Some(bridge) => Ok(bridge.persist(&self.inner.store).await?),
            None => Ok(0),
        }
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.inner.presence.is_online(user_id)
    }

    pub fn online_count(&self) -> usize {
        self.inner.presence.online_count()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.inner.presence.online_users()
    }

    // ------------------------------------------------------------------
    // Realtime
    // ------------------------------------------------------------------

    /// `Disconnected` when no reconciler is running.
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.inner.realtime)
            .as_ref()
            .map(RealtimeHandle::state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn realtime_status(&self) -> Option<RealtimeStatus> {
        lock(&self.inner.realtime)
            .as_ref()
            .map(RealtimeHandle::status)
    }

    pub fn watch_realtime(&self) -> Option<watch::Receiver<RealtimeStatus>> {
        lock(&self.inner.realtime)
            .as_ref()
            .map(RealtimeHandle::watch_status)
    }

    /// Follow another resource class over the push channel.
    pub fn subscribe_class(&self, class: QueryKey) -> bool {
        let added = {
            let mut classes = lock(&self.inner.classes);
            if classes.contains(&class) {
                false
            } else {
                classes.push(class.clone());
                true
            }
        };
        if added {
            if let Some(handle) = lock(&self.inner.realtime).as_ref() {
                handle.subscribe_class(class);
            }
        }
        added
    }

    /// Reconnect after the reconnect attempts were exhausted.
    pub fn resume_realtime(&self) {
        if let Some(handle) = lock(&self.inner.realtime).as_ref() {
            handle.resume();
        }
    }

    // ------------------------------------------------------------------
    // Stats
    // ------------------------------------------------------------------

    pub fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    /// Maintenance counters, once started.
    pub fn maintenance(&self) -> Option<MaintenanceSnapshot> {
        lock(&self.inner.maintenance)
            .as_ref()
            .map(|metrics| metrics.snapshot())
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("entries", &self.inner.store.len())
            .field("connection", &self.connection_state())
            .finish()
    }
}
