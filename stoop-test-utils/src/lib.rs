//! Stoop Test Utilities
//!
//! Shared test infrastructure for the stoop workspace:
//! - Mock backend, push channel, presence sink and credential provider
//! - Proptest generators for keys, rows and event sequences
//! - Fixtures for the marketplace scenarios used across crates
//! - Custom assertions for cache entry invariants

pub use stoop_core::{
    AuthState, CacheEntry, ChangeOperation, CredentialProvider, Identity, MutationRequest,
    PresenceEvent, PresenceSink, PushChannel, PushMessage, PushStream, QueryKey, QueryRequest,
    QueryStatus, RealtimeEvent, RemoteSource, SyncConfig, SyncError, SyncResult, Timestamp,
    UserId,
};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn column_matches(row: &Value, column: &str, expected: &str) -> bool {
    match row.get(column) {
        Some(Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}

// ============================================================================
// MOCK BACKEND
// ============================================================================

/// In-memory backend with scripted failures and call counters.
///
/// Each resource is a table of row objects identified by `"id"`. Queries
/// filter rows by equality on every filter column.
#[derive(Debug, Default)]
pub struct MockRemoteSource {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    query_failures: Mutex<VecDeque<SyncError>>,
    execute_failures: Mutex<VecDeque<SyncError>>,
    executed: Mutex<Vec<MutationRequest>>,
    delay: Mutex<Duration>,
    query_calls: AtomicU32,
    execute_calls: AtomicU32,
}

impl MockRemoteSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a table.
    pub fn with_table(self, resource: impl Into<String>, rows: Vec<Value>) -> Self {
        lock(&self.tables).insert(resource.into(), rows);
        self
    }

    pub fn table(&self, resource: &str) -> Vec<Value> {
        lock(&self.tables).get(resource).cloned().unwrap_or_default()
    }

    /// Fail the next query with `error`. Failures queue up in call order.
    pub fn fail_next_query(&self, error: SyncError) {
        lock(&self.query_failures).push_back(error);
    }

    /// Fail the next mutation with `error`. Failures queue up in call order.
    pub fn fail_next_execute(&self, error: SyncError) {
        lock(&self.execute_failures).push_back(error);
    }

    /// Latency added to every call.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn query_calls(&self) -> u32 {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn execute_calls(&self) -> u32 {
        self.execute_calls.load(Ordering::SeqCst)
    }

    /// Mutations that reached the backend and succeeded.
    pub fn executed(&self) -> Vec<MutationRequest> {
        lock(&self.executed).clone()
    }

    async fn simulate_latency(&self) {
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn apply(&self, request: &MutationRequest) -> SyncResult<Value> {
        let mut tables = lock(&self.tables);
        let rows = tables.entry(request.resource.clone()).or_default();
        let id = request
            .payload
            .get("id")
            .cloned()
            .ok_or_else(|| SyncError::validation("id", "payload has no id"))?;
        let position = rows.iter().position(|row| row.get("id") == Some(&id));

        match request.operation {
            ChangeOperation::Insert => {
                if position.is_some() {
                    return Err(SyncError::validation("id", "duplicate id"));
                }
                rows.push(request.payload.clone());
                Ok(request.payload.clone())
            }
            ChangeOperation::Update => {
                let index =
                    position.ok_or_else(|| SyncError::not_found(request.resource.clone()))?;
                if let (Some(row), Some(changes)) =
                    (rows[index].as_object_mut(), request.payload.as_object())
                {
                    for (column, value) in changes {
                        row.insert(column.clone(), value.clone());
                    }
                }
                Ok(rows[index].clone())
            }
            ChangeOperation::Delete => {
                let index =
                    position.ok_or_else(|| SyncError::not_found(request.resource.clone()))?;
                Ok(rows.remove(index))
            }
        }
    }
}

#[async_trait]
impl RemoteSource for MockRemoteSource {
    async fn query(&self, request: &QueryRequest) -> SyncResult<Value> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = lock(&self.query_failures).pop_front() {
            return Err(error);
        }
        let rows: Vec<Value> = self
            .table(&request.resource)
            .into_iter()
            .filter(|row| {
                request
                    .filters
                    .iter()
                    .all(|(column, expected)| column_matches(row, column, expected))
            })
            .collect();
        Ok(Value::Array(rows))
    }

    async fn execute(&self, request: &MutationRequest) -> SyncResult<Value> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(error) = lock(&self.execute_failures).pop_front() {
            return Err(error);
        }
        let row = self.apply(request)?;
        lock(&self.executed).push(request.clone());
        Ok(row)
    }
}

// ============================================================================
// MOCK PUSH CHANNEL
// ============================================================================

type PushSender = mpsc::UnboundedSender<SyncResult<PushMessage>>;

#[derive(Default)]
struct PushState {
    sender: Option<PushSender>,
    connect_failures: VecDeque<SyncError>,
    subscriptions: Vec<Vec<QueryKey>>,
    attempts: u32,
}

/// Push channel driven by the test.
///
/// Every successful `connect` opens a fresh stream; messages pushed through
/// [`MockPushChannel::push`] go to the most recent one.
pub struct MockPushChannel {
    state: Mutex<PushState>,
    connections: watch::Sender<u32>,
}

impl Default for MockPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPushChannel {
    pub fn new() -> Self {
        let (connections, _) = watch::channel(0);
        Self {
            state: Mutex::new(PushState::default()),
            connections,
        }
    }

    /// Fail the next `connect` with `error`.
    pub fn fail_next_connect(&self, error: SyncError) {
        lock(&self.state).connect_failures.push_back(error);
    }

    /// Fail the next `count` connects with the same error.
    pub fn fail_connects(&self, count: u32, error: SyncError) {
        let mut state = lock(&self.state);
        for _ in 0..count {
            state.connect_failures.push_back(error.clone());
        }
    }

    /// Deliver `message` on the open connection. Returns false if none is open.
    pub fn push(&self, message: PushMessage) -> bool {
        match &lock(&self.state).sender {
            Some(sender) => sender.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    pub fn push_event(&self, event: RealtimeEvent) -> bool {
        self.push(PushMessage::Resource(event))
    }

    pub fn push_presence(&self, event: PresenceEvent) -> bool {
        self.push(PushMessage::Presence(event))
    }

    /// Close the open connection cleanly.
    pub fn drop_connection(&self) {
        lock(&self.state).sender = None;
    }

    /// Break the open connection with `error`.
    pub fn break_connection(&self, error: SyncError) {
        if let Some(sender) = lock(&self.state).sender.take() {
            let _ = sender.send(Err(error));
        }
    }

    /// Total `connect` calls, failed ones included.
    pub fn connect_attempts(&self) -> u32 {
        lock(&self.state).attempts
    }

    /// Successful connections so far.
    pub fn connections(&self) -> u32 {
        *self.connections.borrow()
    }

    /// Resource classes requested by each successful connect, in order.
    pub fn subscriptions(&self) -> Vec<Vec<QueryKey>> {
        lock(&self.state).subscriptions.clone()
    }

    /// Wait until at least `count` connections have been opened.
    pub async fn wait_for_connections(&self, count: u32) {
        let mut rx = self.connections.subscribe();
        let _ = rx.wait_for(|opened| *opened >= count).await;
    }
}

#[async_trait]
impl PushChannel for MockPushChannel {
    async fn connect(&self, resource_classes: &[QueryKey]) -> SyncResult<PushStream> {
        let receiver = {
            let mut state = lock(&self.state);
            state.attempts += 1;
            if let Some(error) = state.connect_failures.pop_front() {
                return Err(error);
            }
            let (sender, receiver) = mpsc::unbounded_channel();
            state.sender = Some(sender);
            state.subscriptions.push(resource_classes.to_vec());
            receiver
        };
        self.connections.send_modify(|opened| *opened += 1);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }
}

// ============================================================================
// MOCK PRESENCE SINK AND CREDENTIALS
// ============================================================================

/// Records every announced presence event.
#[derive(Debug, Default)]
pub struct RecordingPresenceSink {
    announced: Mutex<Vec<PresenceEvent>>,
}

impl RecordingPresenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn announced(&self) -> Vec<PresenceEvent> {
        lock(&self.announced).clone()
    }
}

#[async_trait]
impl PresenceSink for RecordingPresenceSink {
    async fn announce(&self, event: PresenceEvent) -> SyncResult<()> {
        lock(&self.announced).push(event);
        Ok(())
    }
}

/// Credential provider whose state is flipped by the test.
pub struct MockCredentialProvider {
    state: watch::Sender<AuthState>,
}

impl Default for MockCredentialProvider {
    fn default() -> Self {
        Self::new(AuthState::SignedOut)
    }
}

impl MockCredentialProvider {
    pub fn new(initial: AuthState) -> Self {
        let (state, _) = watch::channel(initial);
        Self { state }
    }

    pub fn signed_in(identity: Identity) -> Self {
        Self::new(AuthState::SignedIn(identity))
    }

    pub fn sign_in(&self, identity: Identity) {
        self.state.send_replace(AuthState::SignedIn(identity));
    }

    pub fn sign_out(&self) {
        self.state.send_replace(AuthState::SignedOut);
    }
}

impl CredentialProvider for MockCredentialProvider {
    fn current(&self) -> AuthState {
        self.state.borrow().clone()
    }

    fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, rows and push events.

    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;
    use stoop_core::KeySegment;
    use uuid::Uuid;

    /// Generate a single key segment.
    pub fn arb_key_segment() -> impl Strategy<Value = KeySegment> {
        prop_oneof![
            "[a-z]{1,8}".prop_map(KeySegment::Str),
            (-1000i64..1000).prop_map(KeySegment::Int),
            any::<bool>().prop_map(KeySegment::Bool),
        ]
    }

    /// Generate a key of 1 to 4 segments.
    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_key_segment(), 1..5).prop_map(QueryKey::new)
    }

    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        any::<[u8; 16]>().prop_map(|bytes| UserId::new(Uuid::from_bytes(bytes)))
    }

    /// Generate a Timestamp within 2020-2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    /// Generate a listing row with an id drawn from a small pool so that
    /// sequences collide on identity.
    pub fn arb_listing_row() -> impl Strategy<Value = Value> {
        (0u8..6, "[A-Za-z ]{1,12}", 0u32..10_000).prop_map(|(id, title, price)| {
            json!({"id": format!("L{id}"), "title": title, "price": price})
        })
    }

    pub fn arb_change_operation() -> impl Strategy<Value = ChangeOperation> {
        prop_oneof![
            Just(ChangeOperation::Insert),
            Just(ChangeOperation::Update),
            Just(ChangeOperation::Delete),
        ]
    }

    /// Generate a sequence of row changes for one resource class.
    pub fn arb_event_sequence(
        resource_key: QueryKey,
        max_len: usize,
    ) -> impl Strategy<Value = Vec<RealtimeEvent>> {
        prop::collection::vec((arb_change_operation(), arb_listing_row()), 1..=max_len).prop_map(
            move |changes| {
                changes
                    .into_iter()
                    .map(|(operation, row)| RealtimeEvent::new(resource_key.clone(), operation, row))
                    .collect()
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for the marketplace scenarios.

    use super::*;
    use serde_json::json;
    use stoop_core::query_key;

    /// Config with millisecond-scale timings for fast tests.
    pub fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.fetch.request_timeout_ms = 1_000;
        config.fetch.retry.initial_backoff_ms = 10;
        config.fetch.retry.max_backoff_ms = 100;
        config.mutation.request_timeout_ms = 1_000;
        config.mutation.retry.initial_backoff_ms = 10;
        config.mutation.retry.max_backoff_ms = 100;
        config.realtime.reconnect.initial_ms = 10;
        config.realtime.reconnect.max_ms = 100;
        config.realtime.reconnect.jitter_ms = 0;
        config.realtime.reconnect.max_attempts = 3;
        config.persistence.persist_interval_ms = 50;
        config
    }

    /// A marketplace listing row.
    pub fn listing(id: &str, title: &str, seller: UserId) -> Value {
        json!({
            "id": id,
            "title": title,
            "seller_id": seller.to_string(),
            "price": 25,
        })
    }

    /// Key of the public marketplace feed.
    pub fn marketplace_key() -> QueryKey {
        query_key!["marketplace", "list"]
    }

    /// Key of one seller's own listings.
    pub fn user_listings_key(user: UserId) -> QueryKey {
        query_key!["marketplace", "user", user.to_string()]
    }

    /// Resource class covering every marketplace entry.
    pub fn marketplace_class() -> QueryKey {
        query_key!["marketplace"]
    }

    pub fn directory_key() -> QueryKey {
        query_key!["directory"]
    }

    pub fn identity(name: &str) -> Identity {
        let mut identity = Identity::new(UserId::now_v7());
        identity.display_name = Some(name.to_string());
        identity
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for cache entry invariants.

    use super::*;

    /// Assert the status/data/error invariants of an entry.
    #[track_caller]
    pub fn assert_entry_consistent(entry: &CacheEntry) {
        assert!(
            entry.is_consistent(),
            "Inconsistent entry {}: status {:?}, has data {}, has error {}",
            entry.key,
            entry.status,
            entry.data.is_some(),
            entry.error.is_some()
        );
    }

    /// Assert an entry holds exactly `expected`.
    #[track_caller]
    pub fn assert_entry_data(entry: Option<CacheEntry>, expected: &Value) {
        match entry {
            Some(entry) => {
                assert_entry_consistent(&entry);
                assert_eq!(entry.data.as_ref(), Some(expected), "Unexpected data for {}", entry.key);
            }
            None => panic!("Expected an entry holding {expected}, found none"),
        }
    }

    /// Assert an entry is in the success state.
    #[track_caller]
    pub fn assert_success(entry: &CacheEntry) {
        assert_eq!(entry.status, QueryStatus::Success, "Entry {} not successful", entry.key);
    }

    /// Assert a result failed with a retryable error.
    #[track_caller]
    pub fn assert_retryable<T: std::fmt::Debug>(result: &SyncResult<T>) {
        match result {
            Err(e) if e.is_retryable() => {}
            other => panic!("Expected retryable error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
