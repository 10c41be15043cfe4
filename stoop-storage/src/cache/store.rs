//! In-memory query cache.
//!
//! The store maps each [`QueryKey`] to one [`CacheEntry`] and a watch channel
//! that publishes every change to that entry. All operations are synchronous
//! and hold the map lock only for the duration of the update, so readers
//! never observe a partially applied change and no lock is ever held across
//! an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use stoop_core::{
    add_duration, approx_size, system_clock, CacheConfig, CacheEntry, QueryKey, QueryStatus,
    SharedClock, SyncError, SyncResult, Timestamp,
};
use tokio::sync::watch;
use tracing::debug;

use super::traits::{CacheStats, QueryFetcher};

/// Outcome of a caller-supplied transformation of an entry's data.
#[derive(Debug, Clone, PartialEq)]
pub enum Modification {
    /// Leave the entry untouched.
    Keep,
    /// Replace the entry's data.
    Replace(Value),
    /// The resource no longer exists.
    Delete,
}

/// Captured by [`CacheStore::begin_fetch`] and handed back to
/// [`CacheStore::settle_fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchToken {
    epoch: u64,
    generation: u64,
    version: u64,
}

impl FetchToken {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// What [`CacheStore::settle_fetch`] did with a fetch outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchSettlement {
    /// The outcome was written as the entry's new state.
    Applied,
    /// Pushed changes reached the entry while the fetch ran. The entry keeps
    /// the newer data (carried here), and is left stale.
    Superseded(Value),
    /// The store was cleared after the fetch started; nothing was written.
    Discarded,
}

/// A subscribed entry whose fetcher should run after an invalidation.
#[derive(Clone)]
pub struct RefetchTarget {
    pub key: QueryKey,
    pub fetcher: Arc<dyn QueryFetcher>,
}

impl std::fmt::Debug for RefetchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefetchTarget").field("key", &self.key).finish()
    }
}

struct Slot {
    entry: CacheEntry,
    notifier: watch::Sender<CacheEntry>,
    fetcher: Option<Arc<dyn QueryFetcher>>,
    generation: u64,
    /// Bumped by every authoritative change pushed into the entry.
    version: u64,
}

impl Slot {
    fn new(entry: CacheEntry, generation: u64) -> Self {
        let (notifier, _) = watch::channel(entry.clone());
        Self {
            entry,
            notifier,
            fetcher: None,
            generation,
            version: 0,
        }
    }

    fn publish(&self) {
        self.notifier.send_replace(self.entry.clone());
    }

    fn set_data(&mut self, data: Value) {
        self.entry.approx_bytes = approx_size(&data);
        self.entry.data = Some(data);
        self.entry.status = QueryStatus::Success;
        self.entry.error = None;
    }

    fn schedule_gc(&mut self, now: Timestamp, gc_time: Duration) {
        if self.entry.subscriber_count == 0 {
            self.entry.gc_at = add_duration(now, gc_time);
        }
    }
}

/// Keyed store of cache entries.
pub struct CacheStore {
    slots: RwLock<HashMap<QueryKey, Slot>>,
    config: CacheConfig,
    clock: SharedClock,
    next_generation: AtomicU64,
    epoch: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    collected: AtomicU64,
}

impl CacheStore {
    pub fn new(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            config,
            clock,
            next_generation: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            collected: AtomicU64::new(0),
        }
    }

    /// Store with default timings and the wall clock.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default(), system_clock())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Incremented by every [`CacheStore::clear`].
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HashMap<QueryKey, Slot>> {
        self.slots.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HashMap<QueryKey, Slot>> {
        self.slots.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_slot(&self, key: QueryKey, now: Timestamp) -> Slot {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut slot = Slot::new(CacheEntry::empty(key, now), generation);
        slot.schedule_gc(now, self.config.gc_time());
        slot
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read an entry as a consumer would: counts a hit or miss and updates
    /// the last-access time used by eviction.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        match slots.get_mut(key) {
            Some(slot) => {
                slot.entry.last_accessed = now;
                if slot.entry.has_data() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                Some(slot.entry.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Read an entry without touching access time or statistics.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.read_slots().get(key).map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.read_slots().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_slots().is_empty()
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.read_slots().keys().cloned().collect()
    }

    /// Keys of all entries matched by the prefix `filter`.
    pub fn keys_matching(&self, filter: &QueryKey) -> Vec<QueryKey> {
        self.read_slots()
            .keys()
            .filter(|key| filter.matches(key))
            .cloned()
            .collect()
    }

    /// Point-in-time copy of every entry.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.read_slots()
            .values()
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Sum of the approximate sizes of all cached data.
    pub fn total_bytes(&self) -> u64 {
        self.read_slots()
            .values()
            .map(|slot| slot.entry.approx_bytes as u64)
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        let (entry_count, memory_bytes) = {
            let slots = self.read_slots();
            let bytes = slots
                .values()
                .map(|slot| slot.entry.approx_bytes as u64)
                .sum::<u64>();
            (slots.len() as u64, bytes)
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            memory_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Store successfully fetched data using the configured stale time.
    pub fn set(&self, key: &QueryKey, data: Value) -> CacheEntry {
        self.set_with_stale_time(key, data, self.config.stale_time())
    }

    /// Store successfully fetched data with an explicit stale time.
    pub fn set_with_stale_time(
        &self,
        key: &QueryKey,
        data: Value,
        stale_time: Duration,
    ) -> CacheEntry {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        slot.set_data(data);
        slot.entry.fetched_at = now;
        slot.entry.stale_at = add_duration(now, stale_time);
        slot.schedule_gc(now, self.config.gc_time());
        slot.publish();
        slot.entry.clone()
    }

    /// Seed an entry from persisted data.
    ///
    /// Skipped when the store already holds data fetched at or after
    /// `fetched_at`. Returns true if the entry was written.
    pub fn hydrate(&self, key: &QueryKey, data: Value, fetched_at: Timestamp) -> bool {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        if let Some(existing) = slots.get(key) {
            if existing.entry.has_data() && existing.entry.fetched_at >= fetched_at {
                return false;
            }
        }
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        slot.set_data(data);
        slot.entry.fetched_at = fetched_at;
        slot.entry.stale_at = add_duration(fetched_at, self.config.stale_time());
        slot.schedule_gc(now, self.config.gc_time());
        slot.publish();
        true
    }

    /// Mark `key` pending and capture what a later
    /// [`CacheStore::settle_fetch`] checks against.
    pub fn begin_fetch(&self, key: &QueryKey) -> FetchToken {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let epoch = self.epoch.load(Ordering::Acquire);
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        slot.entry.status = QueryStatus::Pending;
        slot.publish();
        FetchToken {
            epoch,
            generation: slot.generation,
            version: slot.version,
        }
    }

    /// Record the outcome of a fetch started with `token`.
    ///
    /// Dropped when the store was cleared after the fetch started, so a late
    /// response can never repopulate a signed-out cache. When pushed changes
    /// reached the entry in the meantime the response may predate them: the
    /// pushed data wins and the entry is left stale.
    pub fn settle_fetch(
        &self,
        key: &QueryKey,
        outcome: &SyncResult<Value>,
        stale_time: Duration,
        token: FetchToken,
    ) -> FetchSettlement {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        if self.epoch.load(Ordering::Acquire) != token.epoch {
            return FetchSettlement::Discarded;
        }
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        let superseded = slot.generation != token.generation || slot.version != token.version;
        let settlement = match outcome {
            Ok(data) if superseded => {
                let kept = match slot.entry.data.clone() {
                    Some(current) => {
                        slot.entry.status = QueryStatus::Success;
                        slot.entry.error = None;
                        current
                    }
                    None => {
                        slot.set_data(data.clone());
                        slot.entry.fetched_at = now;
                        data.clone()
                    }
                };
                slot.entry.stale_at = now;
                FetchSettlement::Superseded(kept)
            }
            Ok(data) => {
                slot.set_data(data.clone());
                slot.entry.fetched_at = now;
                slot.entry.stale_at = add_duration(now, stale_time);
                FetchSettlement::Applied
            }
            Err(error) => {
                slot.entry.status = QueryStatus::Error;
                slot.entry.error = Some(error.clone());
                FetchSettlement::Applied
            }
        };
        slot.schedule_gc(now, self.config.gc_time());
        slot.publish();
        settlement
    }

    /// Record a failed fetch. Existing data stays visible.
    pub fn set_error(&self, key: &QueryKey, error: SyncError) {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        slot.entry.status = QueryStatus::Error;
        slot.entry.error = Some(error);
        slot.schedule_gc(now, self.config.gc_time());
        slot.publish();
    }

    /// Apply `f` to the entry's current data atomically.
    ///
    /// `Replace` on a missing entry creates it, already stale so the next
    /// read revalidates. `Delete` behaves like [`CacheStore::mark_deleted`].
    /// With `touch_fetched` the entry's fetch time is set to now, which is
    /// how authoritative pushed changes are recorded. Such a change also
    /// supersedes any fetch in flight for the entry, even when `f` keeps the
    /// data as is. Returns true if the store changed.
    pub fn modify<F>(&self, key: &QueryKey, touch_fetched: bool, f: F) -> bool
    where
        F: FnOnce(Option<&Value>) -> Modification,
    {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        if touch_fetched {
            if let Some(slot) = slots.get_mut(key) {
                slot.version += 1;
            }
        }
        let current = slots.get(key).and_then(|slot| slot.entry.data.as_ref());
        match f(current) {
            Modification::Keep => false,
            Modification::Replace(data) => {
                let created = !slots.contains_key(key);
                let slot = slots
                    .entry(key.clone())
                    .or_insert_with(|| self.new_slot(key.clone(), now));
                slot.set_data(data);
                if created || touch_fetched {
                    slot.entry.fetched_at = now;
                }
                if created {
                    slot.entry.stale_at = now;
                }
                slot.schedule_gc(now, self.config.gc_time());
                slot.publish();
                true
            }
            Modification::Delete => Self::delete_in(&mut slots, key, now),
        }
    }

    /// The resource behind `key` no longer exists.
    ///
    /// Unobserved entries are removed. Observed entries lose their data and
    /// go back to `Idle` so subscribers see the deletion.
    pub fn mark_deleted(&self, key: &QueryKey) -> bool {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        Self::delete_in(&mut slots, key, now)
    }

    fn delete_in(slots: &mut HashMap<QueryKey, Slot>, key: &QueryKey, now: Timestamp) -> bool {
        let observed = match slots.get(key) {
            Some(slot) => slot.entry.subscriber_count > 0,
            None => return false,
        };
        if !observed {
            slots.remove(key);
            return true;
        }
        if let Some(slot) = slots.get_mut(key) {
            slot.version += 1;
            slot.entry.data = None;
            slot.entry.error = None;
            slot.entry.status = QueryStatus::Idle;
            slot.entry.approx_bytes = 0;
            slot.entry.stale_at = now;
            slot.publish();
        }
        true
    }

    /// Put back an entry captured with [`CacheStore::peek`].
    ///
    /// `None` means the entry did not exist when captured. Subscriber counts
    /// are never rolled back since subscriptions may have changed meanwhile.
    pub fn restore(&self, key: &QueryKey, snapshot: Option<CacheEntry>) {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        match snapshot {
            Some(previous) => {
                let slot = slots
                    .entry(key.clone())
                    .or_insert_with(|| self.new_slot(key.clone(), now));
                let subscriber_count = slot.entry.subscriber_count;
                let last_accessed = slot.entry.last_accessed;
                slot.entry = previous;
                slot.entry.subscriber_count = subscriber_count;
                slot.entry.last_accessed = last_accessed;
                slot.publish();
            }
            None => {
                let observed = match slots.get(key) {
                    Some(slot) => slot.entry.subscriber_count > 0,
                    None => return,
                };
                if observed {
                    if let Some(slot) = slots.get_mut(key) {
                        let subscriber_count = slot.entry.subscriber_count;
                        slot.entry = CacheEntry::empty(key.clone(), now);
                        slot.entry.subscriber_count = subscriber_count;
                        slot.publish();
                    }
                } else {
                    slots.remove(key);
                }
            }
        }
    }

    /// Remember which fetcher populates `key`.
    pub fn register_fetcher(&self, key: &QueryKey, fetcher: Arc<dyn QueryFetcher>) {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        slot.fetcher = Some(fetcher);
    }

    /// Mark every entry matched by `filter` stale.
    ///
    /// Returns the subscribed entries that have a registered fetcher; the
    /// caller is expected to refetch them.
    pub fn invalidate(&self, filter: &QueryKey) -> Vec<RefetchTarget> {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let mut targets = Vec::new();
        let mut matched = 0usize;
        for (key, slot) in slots.iter_mut() {
            if !filter.matches(key) {
                continue;
            }
            matched += 1;
            slot.entry.stale_at = now;
            slot.publish();
            if slot.entry.subscriber_count > 0 {
                if let Some(fetcher) = &slot.fetcher {
                    targets.push(RefetchTarget {
                        key: key.clone(),
                        fetcher: Arc::clone(fetcher),
                    });
                }
            }
        }
        debug!(
            filter = %filter,
            matched = matched,
            refetch = targets.len(),
            "Invalidated cache entries"
        );
        targets
    }

    /// Mark every entry matched by `filter` stale without scheduling any
    /// refetch. Returns the number of entries touched.
    pub fn mark_stale(&self, filter: &QueryKey) -> usize {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let mut matched = 0usize;
        for (key, slot) in slots.iter_mut() {
            if filter.matches(key) && slot.entry.stale_at > now {
                slot.entry.stale_at = now;
                slot.publish();
                matched += 1;
            }
        }
        matched
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Observe `key`, creating an idle entry if none exists.
    ///
    /// The entry cannot be garbage collected or evicted until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe(self: &Arc<Self>, key: &QueryKey) -> Subscription {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.new_slot(key.clone(), now));
        slot.entry.subscriber_count += 1;
        slot.entry.last_accessed = now;
        slot.publish();
        Subscription {
            key: key.clone(),
            receiver: slot.notifier.subscribe(),
            store: Arc::downgrade(self),
            generation: slot.generation,
            active: true,
        }
    }

    fn release(&self, key: &QueryKey, generation: u64) {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        if let Some(slot) = slots.get_mut(key) {
            if slot.generation != generation {
                return;
            }
            slot.entry.subscriber_count = slot.entry.subscriber_count.saturating_sub(1);
            slot.schedule_gc(now, self.config.gc_time());
            slot.publish();
        }
    }

    // ------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------

    /// Remove an unobserved entry under memory pressure.
    ///
    /// Refuses entries with subscribers. Returns true if removed.
    pub fn evict(&self, key: &QueryKey) -> bool {
        let mut slots = self.write_slots();
        match slots.get(key) {
            Some(slot) if slot.entry.subscriber_count == 0 => {
                slots.remove(key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    /// Remove every unobserved entry whose GC deadline has passed.
    pub fn collect_garbage(&self) -> Vec<QueryKey> {
        let now = self.clock.now();
        let mut slots = self.write_slots();
        let expired: Vec<QueryKey> = slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_collectable(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            slots.remove(key);
        }
        if !expired.is_empty() {
            self.collected
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!(removed = expired.len(), "Collected expired cache entries");
        }
        expired
    }

    /// Drop every entry. Open subscriptions observe a closed channel.
    pub fn clear(&self) -> usize {
        let mut slots = self.write_slots();
        let count = slots.len();
        slots.clear();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        count
    }
}

/// Handle returned by [`CacheStore::subscribe`].
///
/// Dropping the handle releases the subscription.
pub struct Subscription {
    key: QueryKey,
    receiver: watch::Receiver<CacheEntry>,
    store: Weak<CacheStore>,
    generation: u64,
    active: bool,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest published state of the entry.
    pub fn current(&self) -> CacheEntry {
        self.receiver.borrow().clone()
    }

    pub fn data(&self) -> Option<Value> {
        self.receiver.borrow().data.clone()
    }

    /// Wait for the next change. Returns false once the entry is gone from
    /// the store for good (e.g. after a sign-out clear).
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Independent receiver for the same entry.
    pub fn receiver(&self) -> watch::Receiver<CacheEntry> {
        self.receiver.clone()
    }

    /// Release the subscription now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(store) = self.store.upgrade() {
            store.release(&self.key, self.generation);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("active", &self.active)
            .finish()
    }
}
