//! Realtime reconciler.
//!
//! A single task owns the push connection and is the only consumer of its
//! stream, so row changes for a resource are merged into the cache in the
//! order they arrived. Connection state is published on a watch channel:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting { attempt } -> Connected
//!                                   |                 |
//!                                   +-> Disconnected <+  (auth failure, attempts exhausted)
//! ```
//!
//! Missed events are never replayed. When a connection is re-established,
//! every entry under the subscribed resource classes is marked stale so the
//! next read revalidates it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::StreamExt;
use stoop_core::{
    ErrorKind, InsertPlacement, PushChannel, PushMessage, PushStream, QueryKey, RealtimeConfig,
    RealtimeEvent, SyncError,
};
use stoop_storage::cache::{apply_change, CacheStore};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::backoff::Backoff;
use crate::presence::PresenceTracker;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// STATE
// ============================================================================

/// Push connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retrying after a failure; `attempt` counts from 1.
    Reconnecting { attempt: u32 },
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// What the reconciler publishes to observers.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeStatus {
    pub state: ConnectionState,
    /// Most recent failure. Cleared on every successful connect.
    pub last_error: Option<SyncError>,
    /// Successful connections since start.
    pub connections: u64,
    /// Resource events applied since start.
    pub events_applied: u64,
}

impl Default for RealtimeStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            connections: 0,
            events_applied: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Resubscribe,
    Resume,
    CredentialsRefreshed,
    Shutdown,
}

// ============================================================================
// EVENT APPLICATION
// ============================================================================

/// Merge one pushed row change into every cache entry under its resource key.
///
/// Inserts and updates are upserted by identity into collections and merged
/// into a single row with the same identity. Deletes remove the row from
/// collections and delete a matching single-row entry. Returns the number of
/// entries changed.
pub fn apply_event(
    store: &CacheStore,
    event: &RealtimeEvent,
    identity_field: &str,
    placement: InsertPlacement,
) -> usize {
    let mut touched = 0;
    for key in store.keys_matching(&event.resource_key) {
        let changed = store.modify(&key, true, |data| {
            apply_change(data, event.operation, &event.payload, identity_field, placement)
        });
        if changed {
            touched += 1;
        }
    }
    touched
}

// ============================================================================
// RECONCILER
// ============================================================================

/// Builder for the realtime task.
pub struct RealtimeReconciler {
    store: Arc<CacheStore>,
    channel: Arc<dyn PushChannel>,
    presence: Option<Arc<PresenceTracker>>,
    config: RealtimeConfig,
    classes: BTreeSet<QueryKey>,
}

impl RealtimeReconciler {
    pub fn new(store: Arc<CacheStore>, channel: Arc<dyn PushChannel>, config: RealtimeConfig) -> Self {
        Self {
            store,
            channel,
            presence: None,
            config,
            classes: BTreeSet::new(),
        }
    }

    /// Forward presence events from the stream to `tracker`.
    pub fn with_presence(mut self, tracker: Arc<PresenceTracker>) -> Self {
        self.presence = Some(tracker);
        self
    }

    /// Subscribe to a resource class (a prefix key) from the first connect.
    pub fn subscribe_class(mut self, class: QueryKey) -> Self {
        self.classes.insert(class);
        self
    }

    /// Start the connection task on the current runtime.
    pub fn spawn(self) -> RealtimeHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RealtimeStatus::default());
        let classes = Arc::new(Mutex::new(self.classes));

        let worker = Worker {
            store: self.store,
            channel: self.channel,
            presence: self.presence,
            config: self.config,
            classes: Arc::clone(&classes),
            status: status_tx,
            control: control_rx,
            sequence: 0,
        };
        let task = tokio::spawn(worker.run());

        RealtimeHandle {
            control: control_tx,
            status: status_rx,
            classes,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Handle to a running reconciler.
///
/// Dropping the handle stops the task.
pub struct RealtimeHandle {
    control: mpsc::UnboundedSender<Control>,
    status: watch::Receiver<RealtimeStatus>,
    classes: Arc<Mutex<BTreeSet<QueryKey>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeHandle {
    fn send(&self, control: Control) {
        if self.control.send(control).is_err() {
            tracing::debug!(?control, "Realtime task already stopped");
        }
    }

    /// Add a resource class. An open connection is re-established with the
    /// new class set. Returns false if the class was already subscribed.
    pub fn subscribe_class(&self, class: QueryKey) -> bool {
        let added = lock(&self.classes).insert(class);
        if added {
            self.send(Control::Resubscribe);
        }
        added
    }

    /// Drop a resource class. Returns false if it was not subscribed.
    pub fn unsubscribe_class(&self, class: &QueryKey) -> bool {
        let removed = lock(&self.classes).remove(class);
        if removed {
            self.send(Control::Resubscribe);
        }
        removed
    }

    pub fn classes(&self) -> Vec<QueryKey> {
        lock(&self.classes).iter().cloned().collect()
    }

    pub fn status(&self) -> RealtimeStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    pub fn watch_status(&self) -> watch::Receiver<RealtimeStatus> {
        self.status.clone()
    }

    /// Wait until the published status satisfies `predicate`.
    pub async fn wait_for<F>(&self, predicate: F) -> RealtimeStatus
    where
        F: FnMut(&RealtimeStatus) -> bool,
    {
        let mut rx = self.status.clone();
        let result = rx.wait_for(predicate).await.map(|status| status.clone());
        result.unwrap_or_else(|_| rx.borrow().clone())
    }

    /// Leave the disconnected state reached after exhausting reconnect
    /// attempts, or skip the current backoff delay.
    pub fn resume(&self) {
        self.send(Control::Resume);
    }

    /// New credentials are available; reconnect after an auth failure.
    pub fn credentials_refreshed(&self) {
        self.send(Control::CredentialsRefreshed);
    }

    pub fn is_running(&self) -> bool {
        !self.control.is_closed()
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(&self) {
        self.send(Control::Shutdown);
        let task = lock(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Realtime task ended abnormally");
            }
        }
    }
}

// ============================================================================
// CONNECTION TASK
// ============================================================================

enum Step<T> {
    Control(Control),
    Ready(T),
}

enum Disconnect {
    Shutdown,
    Resubscribe,
    Closed,
    Broken(SyncError),
}

struct Worker {
    store: Arc<CacheStore>,
    channel: Arc<dyn PushChannel>,
    presence: Option<Arc<PresenceTracker>>,
    config: RealtimeConfig,
    classes: Arc<Mutex<BTreeSet<QueryKey>>>,
    status: watch::Sender<RealtimeStatus>,
    control: mpsc::UnboundedReceiver<Control>,
    sequence: u64,
}

impl Worker {
    fn classes_snapshot(&self) -> Vec<QueryKey> {
        lock(&self.classes).iter().cloned().collect()
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn set_failed(&self, state: ConnectionState, error: SyncError) {
        self.status.send_modify(|status| {
            status.state = state;
            status.last_error = Some(error);
        });
    }

    fn mark_classes_stale(&self, classes: &[QueryKey]) -> usize {
        classes.iter().map(|class| self.store.mark_stale(class)).sum()
    }

    async fn run(mut self) {
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        let mut has_connected = false;
        let mut reconnecting = false;

        tracing::info!(
            classes = self.classes_snapshot().len(),
            "Realtime reconciler started"
        );

        loop {
            let classes = self.classes_snapshot();
            self.set_state(if reconnecting {
                ConnectionState::Reconnecting {
                    attempt: backoff.failures() + 1,
                }
            } else {
                ConnectionState::Connecting
            });

            let step = tokio::select! {
                control = self.control.recv() => Step::Control(control.unwrap_or(Control::Shutdown)),
                result = self.channel.connect(&classes) => Step::Ready(result),
            };
            let result = match step {
                Step::Control(Control::Shutdown) => break,
                Step::Control(control) => {
                    tracing::debug!(?control, "Restarting realtime connect");
                    continue;
                }
                Step::Ready(result) => result,
            };

            match result {
                Ok(stream) => {
                    backoff.reset();
                    if has_connected {
                        let marked = self.mark_classes_stale(&classes);
                        tracing::info!(marked, "Marked entries stale after reconnect");
                    }
                    has_connected = true;
                    self.status.send_modify(|status| {
                        status.state = ConnectionState::Connected;
                        status.last_error = None;
                        status.connections += 1;
                    });
                    tracing::info!(classes = classes.len(), "Realtime connected");

                    match self.consume(stream).await {
                        Disconnect::Shutdown => break,
                        Disconnect::Resubscribe => {
                            tracing::debug!("Resubscribing with updated resource classes");
                            reconnecting = false;
                        }
                        Disconnect::Closed => {
                            tracing::warn!("Realtime connection closed, reconnecting");
                            reconnecting = true;
                        }
                        Disconnect::Broken(e) if e.kind() == ErrorKind::PermissionDenied => {
                            if !self.park_for_credentials(e).await {
                                break;
                            }
                            reconnecting = false;
                        }
                        Disconnect::Broken(e) => {
                            tracing::warn!(error = %e, "Realtime connection broken, reconnecting");
                            self.status.send_modify(|status| status.last_error = Some(e));
                            reconnecting = true;
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    if !self.park_for_credentials(e).await {
                        break;
                    }
                    backoff.reset();
                    reconnecting = false;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if backoff.is_exhausted() {
                        let attempts = backoff.failures();
                        let marked = self.mark_classes_stale(&classes);
                        tracing::error!(
                            attempts,
                            marked,
                            error = %e,
                            "Realtime reconnect attempts exhausted"
                        );
                        self.set_failed(
                            ConnectionState::Disconnected,
                            SyncError::RealtimeDisconnected { attempts },
                        );
                        if !self
                            .park(|control| {
                                matches!(control, Control::Resume | Control::CredentialsRefreshed)
                            })
                            .await
                        {
                            break;
                        }
                        backoff.reset();
                        reconnecting = false;
                        continue;
                    }

                    tracing::warn!(
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Realtime connect failed, retrying"
                    );
                    self.set_failed(
                        ConnectionState::Reconnecting {
                            attempt: backoff.failures() + 1,
                        },
                        e,
                    );
                    if !self.sleep(delay).await {
                        break;
                    }
                    reconnecting = true;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Realtime reconciler stopped");
    }

    /// Process the stream until it ends or a control message interrupts it.
    async fn consume(&mut self, mut stream: PushStream) -> Disconnect {
        loop {
            let step = tokio::select! {
                control = self.control.recv() => Step::Control(control.unwrap_or(Control::Shutdown)),
                item = stream.next() => Step::Ready(item),
            };
            match step {
                Step::Control(Control::Shutdown) => return Disconnect::Shutdown,
                Step::Control(Control::Resubscribe) => return Disconnect::Resubscribe,
                Step::Control(control) => {
                    tracing::trace!(?control, "Ignoring control while connected");
                }
                Step::Ready(Some(Ok(message))) => self.handle(message),
                Step::Ready(Some(Err(e))) => return Disconnect::Broken(e),
                Step::Ready(None) => return Disconnect::Closed,
            }
        }
    }

    fn handle(&mut self, message: PushMessage) {
        match message {
            PushMessage::Resource(mut event) => {
                self.sequence += 1;
                event.sequence = self.sequence;
                event.received_at = Some(self.store.now());
                let touched = apply_event(
                    &self.store,
                    &event,
                    &self.config.identity_field,
                    self.config.insert_placement,
                );
                tracing::debug!(
                    sequence = event.sequence,
                    key = %event.resource_key,
                    operation = ?event.operation,
                    touched,
                    "Applied realtime event"
                );
                self.status.send_modify(|status| status.events_applied += 1);
            }
            PushMessage::Presence(event) => match &self.presence {
                Some(tracker) => {
                    tracker.apply(&event);
                }
                None => tracing::trace!("Dropping presence event with no tracker attached"),
            },
        }
    }

    async fn park_for_credentials(&mut self, error: SyncError) -> bool {
        tracing::warn!(error = %error, "Realtime authorization failed, waiting for new credentials");
        self.set_failed(ConnectionState::Disconnected, error);
        self.park(|control| matches!(control, Control::CredentialsRefreshed))
            .await
    }

    /// Wait for a control message accepted by `wake`. Returns false on shutdown.
    async fn park<F>(&mut self, wake: F) -> bool
    where
        F: Fn(Control) -> bool,
    {
        loop {
            match self.control.recv().await.unwrap_or(Control::Shutdown) {
                Control::Shutdown => return false,
                control if wake(control) => return true,
                control => tracing::trace!(?control, "Ignoring control while disconnected"),
            }
        }
    }

    /// Backoff sleep that any control message cuts short. Returns false on shutdown.
    async fn sleep(&mut self, delay: Duration) -> bool {
        let step = tokio::select! {
            control = self.control.recv() => Step::Control(control.unwrap_or(Control::Shutdown)),
            _ = tokio::time::sleep(delay) => Step::Ready(()),
        };
        !matches!(step, Step::Control(Control::Shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use stoop_core::{query_key, Clock, ManualClock, QueryStatus};
    use stoop_storage::cache::Modification;
    use stoop_test_utils::generators::arb_event_sequence;

    fn store() -> Arc<CacheStore> {
        Arc::new(CacheStore::new(
            Default::default(),
            Arc::new(ManualClock::starting_now()),
        ))
    }

    fn apply(store: &CacheStore, event: &RealtimeEvent) -> usize {
        apply_event(store, event, "id", InsertPlacement::Back)
    }

    #[test]
    fn test_insert_and_delete_reach_every_matching_collection() {
        let store = store();
        let list = query_key!["marketplace", "list"];
        let mine = query_key!["marketplace", "user", "U1"];
        let other = query_key!["directory"];
        store.set(&list, json!([{"id": "a"}]));
        store.set(&mine, json!([]));
        store.set(&other, json!([{"id": "a"}]));

        let touched = apply(
            &store,
            &RealtimeEvent::insert(query_key!["marketplace"], json!({"id": "b"})),
        );
        assert_eq!(touched, 2);
        assert_eq!(store.peek(&list).unwrap().data, Some(json!([{"id": "a"}, {"id": "b"}])));
        assert_eq!(store.peek(&mine).unwrap().data, Some(json!([{"id": "b"}])));

        apply(
            &store,
            &RealtimeEvent::delete(query_key!["marketplace"], json!({"id": "a"})),
        );
        assert_eq!(store.peek(&list).unwrap().data, Some(json!([{"id": "b"}])));
        assert_eq!(store.peek(&other).unwrap().data, Some(json!([{"id": "a"}])));
    }

    #[test]
    fn test_delete_of_observed_single_row_marks_it_deleted() {
        let store = store();
        let key = query_key!["listing", "a"];
        store.set(&key, json!({"id": "a", "title": "Lamp"}));
        let subscription = store.subscribe(&key);

        apply(&store, &RealtimeEvent::delete(key.clone(), json!({"id": "a"})));

        let entry = subscription.current();
        assert_eq!(entry.data, None);
        assert_eq!(entry.status, QueryStatus::Idle);
        assert!(store.contains(&key));
    }

    #[test]
    fn test_update_merges_single_row_and_touches_fetch_time() {
        let clock = ManualClock::starting_now();
        let store = CacheStore::new(Default::default(), Arc::new(clock.clone()));
        let key = query_key!["listing", "a"];
        store.set(&key, json!({"id": "a", "title": "Lamp", "price": 10}));
        clock.advance(Duration::from_secs(5));

        apply(&store, &RealtimeEvent::update(key.clone(), json!({"id": "a", "price": 8})));

        let entry = store.peek(&key).unwrap();
        assert_eq!(entry.data, Some(json!({"id": "a", "title": "Lamp", "price": 8})));
        assert_eq!(entry.fetched_at, clock.now());
    }

    #[test]
    fn test_application_is_order_sensitive() {
        let key = query_key!["marketplace", "list"];
        let update = RealtimeEvent::update(key.clone(), json!({"id": "a", "title": "Desk"}));
        let delete = RealtimeEvent::delete(key.clone(), json!({"id": "a"}));

        let forward = store();
        forward.set(&key, json!([{"id": "a", "title": "Lamp"}]));
        apply(&forward, &update);
        apply(&forward, &delete);

        let reversed = store();
        reversed.set(&key, json!([{"id": "a", "title": "Lamp"}]));
        apply(&reversed, &delete);
        apply(&reversed, &update);

        assert_eq!(forward.peek(&key).unwrap().data, Some(json!([])));
        assert_eq!(
            reversed.peek(&key).unwrap().data,
            Some(json!([{"id": "a", "title": "Desk"}]))
        );
    }

    proptest! {
        #[test]
        fn prop_store_matches_sequential_fold(
            events in arb_event_sequence(query_key!["marketplace", "list"], 12)
        ) {
            let key = query_key!["marketplace", "list"];
            let store = store();
            store.set(&key, json!([]));

            let mut expected = json!([]);
            for event in &events {
                apply(&store, event);
                if let Modification::Replace(next) = apply_change(
                    Some(&expected),
                    event.operation,
                    &event.payload,
                    "id",
                    InsertPlacement::Back,
                ) {
                    expected = next;
                }
            }

            prop_assert_eq!(store.peek(&key).and_then(|entry| entry.data), Some(expected));
        }
    }

    #[test]
    fn test_connection_state_names() {
        assert_eq!(ConnectionState::Reconnecting { attempt: 2 }.as_str(), "reconnecting");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!RealtimeStatus::default().state.is_connected());
    }
}
