//! Cache entry data model.

use crate::error::SyncError;
use crate::identity::Timestamp;
use crate::key::QueryKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// A point-in-time view of one cached resource.
///
/// Invariants maintained by the cache store:
/// - `status == Success` implies `data.is_some()`
/// - `status == Error` implies `error.is_some()`
/// - an entry with `subscriber_count == 0` may be collected once `now >= gc_at`
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub data: Option<Value>,
    pub status: QueryStatus,
    pub error: Option<SyncError>,
    pub fetched_at: Timestamp,
    pub stale_at: Timestamp,
    pub gc_at: Timestamp,
    pub subscriber_count: u32,
    pub last_accessed: Timestamp,
    /// Approximate serialized size of `data`, used for memory accounting.
    pub approx_bytes: usize,
}

impl CacheEntry {
    /// A fresh idle entry with no data.
    pub fn empty(key: QueryKey, now: Timestamp) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: now,
            stale_at: now,
            gc_at: now,
            subscriber_count: 0,
            last_accessed: now,
            approx_bytes: 0,
        }
    }

    /// True while `now < stale_at` and there is data to serve.
    pub fn is_fresh(&self, now: Timestamp) -> bool {
        self.status == QueryStatus::Success && self.data.is_some() && now < self.stale_at
    }

    pub fn is_stale(&self, now: Timestamp) -> bool {
        !self.is_fresh(now)
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Eligible for normal garbage collection.
    pub fn is_collectable(&self, now: Timestamp) -> bool {
        self.subscriber_count == 0 && now >= self.gc_at
    }

    /// Check the status/data/error invariants.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            QueryStatus::Success => self.data.is_some(),
            QueryStatus::Error => self.error.is_some(),
            QueryStatus::Idle | QueryStatus::Pending => true,
        }
    }
}

/// Approximate in-memory footprint of a JSON document.
pub fn approx_size(value: &Value) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_empty_entry_is_stale_and_consistent() {
        let now = Utc::now();
        let entry = CacheEntry::empty(query_key!["directory"], now);
        assert!(entry.is_stale(now));
        assert!(entry.is_consistent());
        assert!(!entry.has_data());
    }

    #[test]
    fn test_freshness_window() {
        let now = Utc::now();
        let mut entry = CacheEntry::empty(query_key!["directory"], now);
        entry.data = Some(json!([]));
        entry.status = QueryStatus::Success;
        entry.stale_at = now + chrono::Duration::seconds(10);

        assert!(entry.is_fresh(now));
        assert!(entry.is_stale(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_inconsistent_success_without_data() {
        let now = Utc::now();
        let mut entry = CacheEntry::empty(query_key!["x"], now);
        entry.status = QueryStatus::Success;
        assert!(!entry.is_consistent());
    }

    #[test]
    fn test_collectable_requires_no_subscribers() {
        let now = Utc::now();
        let mut entry = CacheEntry::empty(query_key!["x"], now);
        entry.subscriber_count = 1;
        assert!(!entry.is_collectable(now));
        entry.subscriber_count = 0;
        assert!(entry.is_collectable(now));
    }

    #[test]
    fn test_approx_size() {
        assert_eq!(approx_size(&json!({"id": "a"})), r#"{"id":"a"}"#.len());
    }
}
