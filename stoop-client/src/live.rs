//! Live views of cache entries for UI consumers.

use serde::de::DeserializeOwned;
use serde_json::Value;
use stoop_core::{CacheEntry, QueryKey, QueryStatus, SyncError, SyncResult};
use stoop_storage::Subscription;

pub(crate) fn decode<T: DeserializeOwned>(key: &QueryKey, value: Value) -> SyncResult<T> {
    serde_json::from_value(value).map_err(|e| SyncError::validation(key.to_string(), e.to_string()))
}

/// A subscription to one key.
///
/// Holds the entry alive against garbage collection and eviction until it
/// is dropped or [`LiveQuery::unsubscribe`] is called.
#[derive(Debug)]
pub struct LiveQuery {
    subscription: Subscription,
}

impl LiveQuery {
    pub(crate) fn new(subscription: Subscription) -> Self {
        Self { subscription }
    }

    pub fn key(&self) -> &QueryKey {
        self.subscription.key()
    }

    /// Latest state of the entry.
    pub fn entry(&self) -> CacheEntry {
        self.subscription.current()
    }

    pub fn status(&self) -> QueryStatus {
        self.entry().status
    }

    pub fn data(&self) -> Option<Value> {
        self.subscription.data()
    }

    /// Current data decoded as `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
        self.data()
            .map(|value| decode(self.key(), value))
            .transpose()
    }

    /// Wait for the next change. Returns false when the entry is gone for
    /// good, e.g. after sign-out.
    pub async fn changed(&mut self) -> bool {
        self.subscription.changed().await
    }

    /// Wait until the entry satisfies `predicate`, checking the current
    /// state first. `None` if the entry goes away first.
    pub async fn wait_until<F>(&mut self, mut predicate: F) -> Option<CacheEntry>
    where
        F: FnMut(&CacheEntry) -> bool,
    {
        loop {
            let entry = self.entry();
            if predicate(&entry) {
                return Some(entry);
            }
            if !self.changed().await {
                return None;
            }
        }
    }

    /// Wait for a settled read: data on success, the error on failure.
    pub async fn settled(&mut self) -> Option<SyncResult<Value>> {
        let entry = self
            .wait_until(|entry| {
                matches!(entry.status, QueryStatus::Success | QueryStatus::Error)
            })
            .await?;
        match (entry.status, entry.data, entry.error) {
            (QueryStatus::Error, _, Some(error)) => Some(Err(error)),
            (_, Some(data), _) => Some(Ok(data)),
            _ => None,
        }
    }

    pub fn unsubscribe(self) {
        self.subscription.unsubscribe();
    }
}
