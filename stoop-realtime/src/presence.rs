//! Presence tracking.
//!
//! A user is online while their most recent heartbeat is no older than the
//! online window. Online status is evaluated lazily at query time, so the
//! sweeper only bounds memory; it never changes an answer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use stoop_core::{
    elapsed_between, PresenceConfig, PresenceEvent, PresenceKind, PresenceSink, SharedClock,
    Timestamp, UserId,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Point-in-time view of one user's presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub last_heartbeat_at: Timestamp,
    pub online: bool,
}

/// Latest presence fact known for a user.
///
/// A leave is kept as a tombstone so heartbeats stamped at or before it
/// cannot bring the user back when they arrive late.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seen {
    Heartbeat(Timestamp),
    Left(Timestamp),
}

impl Seen {
    fn at(self) -> Timestamp {
        match self {
            Seen::Heartbeat(at) | Seen::Left(at) => at,
        }
    }

    fn heartbeat(self) -> Option<Timestamp> {
        match self {
            Seen::Heartbeat(at) => Some(at),
            Seen::Left(_) => None,
        }
    }
}

/// Map of user to last heartbeat or leave.
#[derive(Debug)]
pub struct PresenceTracker {
    last_seen: RwLock<HashMap<UserId, Seen>>,
    online_timeout: Duration,
    clock: SharedClock,
    changes: watch::Sender<u64>,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig, clock: SharedClock) -> Self {
        Self::with_timeout(config.online_timeout(), clock)
    }

    pub fn with_timeout(online_timeout: Duration, clock: SharedClock) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            last_seen: RwLock::new(HashMap::new()),
            online_timeout,
            clock,
            changes,
        }
    }

    pub fn online_timeout(&self) -> Duration {
        self.online_timeout
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<UserId, Seen>> {
        self.last_seen
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<UserId, Seen>> {
        self.last_seen
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Receiver bumped on every change to the presence map.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn is_within_window(&self, last: Timestamp, now: Timestamp) -> bool {
        elapsed_between(last, now) <= self.online_timeout
    }

    /// Record a heartbeat observed at `at`.
    ///
    /// A heartbeat stamped at or before the stored heartbeat or leave is
    /// ignored, so out-of-order delivery never moves a user's last-seen time
    /// backwards and never undoes a leave. Returns true if the record changed.
    pub fn record_heartbeat(&self, user_id: UserId, at: Timestamp) -> bool {
        let applied = {
            let mut last_seen = self.write();
            match last_seen.get(&user_id) {
                Some(existing) if existing.at() >= at => false,
                _ => {
                    last_seen.insert(user_id, Seen::Heartbeat(at));
                    true
                }
            }
        };
        if applied {
            self.notify();
        } else {
            tracing::trace!(user_id = %user_id, at = %at, "Ignoring out-of-order heartbeat");
        }
        applied
    }

    /// A join counts as a heartbeat.
    pub fn record_join(&self, user_id: UserId, at: Timestamp) -> bool {
        self.record_heartbeat(user_id, at)
    }

    /// Take the user offline as of `at`.
    ///
    /// A heartbeat stamped after the leave wins and the leave is dropped.
    /// Returns true if a present user was taken offline.
    pub fn record_leave(&self, user_id: UserId, at: Timestamp) -> bool {
        let removed = {
            let mut last_seen = self.write();
            match last_seen.get(&user_id).copied() {
                Some(existing) if existing.at() > at => {
                    tracing::trace!(user_id = %user_id, at = %at, "Ignoring out-of-order leave");
                    return false;
                }
                existing => {
                    last_seen.insert(user_id, Seen::Left(at));
                    existing.and_then(Seen::heartbeat).is_some()
                }
            }
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Dispatch a pushed presence event.
    pub fn apply(&self, event: &PresenceEvent) -> bool {
        match event.kind {
            PresenceKind::Join => self.record_join(event.user_id, event.at),
            PresenceKind::Heartbeat => self.record_heartbeat(event.user_id, event.at),
            PresenceKind::Leave => self.record_leave(event.user_id, event.at),
        }
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        let now = self.clock.now();
        self.last_seen(user_id)
            .is_some_and(|last| self.is_within_window(last, now))
    }

    /// Last heartbeat of a present user. `None` once they have left.
    pub fn last_seen(&self, user_id: UserId) -> Option<Timestamp> {
        self.read().get(&user_id).and_then(|seen| seen.heartbeat())
    }

    pub fn record(&self, user_id: UserId) -> Option<PresenceRecord> {
        let now = self.clock.now();
        self.last_seen(user_id).map(|last| PresenceRecord {
            user_id,
            last_heartbeat_at: last,
            online: self.is_within_window(last, now),
        })
    }

    pub fn online_count(&self) -> usize {
        let now = self.clock.now();
        self.read()
            .values()
            .filter_map(|seen| seen.heartbeat())
            .filter(|last| self.is_within_window(*last, now))
            .count()
    }

    /// Online users, sorted by id.
    pub fn online_users(&self) -> Vec<UserId> {
        let now = self.clock.now();
        let mut users: Vec<UserId> = self
            .read()
            .iter()
            .filter(|(_, seen)| {
                seen.heartbeat()
                    .is_some_and(|last| self.is_within_window(last, now))
            })
            .map(|(user, _)| *user)
            .collect();
        users.sort();
        users
    }

    /// Number of tracked users, online or not. Leaves are not counted.
    pub fn len(&self) -> usize {
        self.read()
            .values()
            .filter(|seen| matches!(seen, Seen::Heartbeat(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop heartbeats and leaves that fell out of the online window.
    ///
    /// Any heartbeat a pruned leave would have rejected is itself outside
    /// the window, so pruning never brings a user back online. Returns the
    /// number of heartbeat records removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let (removed, pruned) = {
            let mut last_seen = self.write();
            let mut removed = 0;
            let mut pruned = 0;
            last_seen.retain(|_, seen| {
                if elapsed_between(seen.at(), now) <= self.online_timeout {
                    return true;
                }
                match seen {
                    Seen::Heartbeat(_) => removed += 1,
                    Seen::Left(_) => pruned += 1,
                }
                false
            });
            (removed, pruned)
        };
        if removed > 0 || pruned > 0 {
            tracing::debug!(removed, pruned, "Swept expired presence records");
        }
        if removed > 0 {
            self.notify();
        }
        removed
    }

    /// Forget everyone, leaves included. Used on sign-out.
    pub fn clear(&self) -> usize {
        let removed = {
            let mut last_seen = self.write();
            let removed = last_seen
                .values()
                .filter(|seen| matches!(seen, Seen::Heartbeat(_)))
                .count();
            last_seen.clear();
            removed
        };
        if removed > 0 {
            self.notify();
        }
        removed
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Periodically prune expired presence records until shutdown is signalled.
pub fn spawn_sweeper(
    tracker: Arc<PresenceTracker>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    tracker.sweep();
                }
            }
        }
        tracing::debug!("Presence sweeper stopped");
    })
}

/// Announce the signed-in user's own presence.
///
/// Sends a join immediately, a heartbeat on every tick, and a leave when
/// shutdown is signalled. Announcement failures are logged and the next
/// tick tries again.
pub fn spawn_heartbeat(
    sink: Arc<dyn PresenceSink>,
    user_id: UserId,
    every: Duration,
    clock: SharedClock,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sink.announce(PresenceEvent::join(user_id, clock.now())).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to announce join");
        }

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately and the join already covers it.
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let event = PresenceEvent::heartbeat(user_id, clock.now());
                    if let Err(e) = sink.announce(event).await {
                        tracing::warn!(user_id = %user_id, error = %e, "Failed to announce heartbeat");
                    }
                }
            }
        }

        if let Err(e) = sink.announce(PresenceEvent::leave(user_id, clock.now())).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to announce leave");
        }
    })
}
