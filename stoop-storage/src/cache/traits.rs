//! Fetcher seam and cache statistics.
//!
//! A [`QueryFetcher`] knows how to load the data for one query key. The
//! cache store remembers the fetcher that last populated each entry so an
//! invalidation can refetch subscribed entries without the caller having to
//! supply it again.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use stoop_core::{QueryKey, QueryRequest, RemoteSource, SyncResult};

/// Loads the data for a query key.
///
/// Implementations must classify their failures into `SyncError` variants
/// so the coordinator can decide whether to retry.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    /// Fetch the current data for `key` from the backend.
    async fn fetch(&self, key: &QueryKey) -> SyncResult<Value>;
}

/// Adapter that turns an async closure into a [`QueryFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> QueryFetcher for FnFetcher<F>
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
{
    async fn fetch(&self, key: &QueryKey) -> SyncResult<Value> {
        (self.f)(key.clone()).await
    }
}

/// Shorthand for building a shared closure fetcher.
pub fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn QueryFetcher>
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SyncResult<Value>> + Send + 'static,
{
    Arc::new(FnFetcher::new(f))
}

/// Fetcher that runs a fixed [`QueryRequest`] against a [`RemoteSource`].
pub struct RemoteFetcher {
    remote: Arc<dyn RemoteSource>,
    request: QueryRequest,
}

impl RemoteFetcher {
    pub fn new(remote: Arc<dyn RemoteSource>, request: QueryRequest) -> Self {
        Self { remote, request }
    }

    pub fn request(&self) -> &QueryRequest {
        &self.request
    }
}

#[async_trait]
impl QueryFetcher for RemoteFetcher {
    async fn fetch(&self, _key: &QueryKey) -> SyncResult<Value> {
        self.remote.query(&self.request).await
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of reads that found data in the cache.
    pub hits: u64,
    /// Number of reads that found nothing usable.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Approximate memory usage in bytes.
    pub memory_bytes: u64,
    /// Number of entries removed by the memory evictor.
    pub evictions: u64,
    /// Number of entries removed by garbage collection.
    pub collected: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stoop_core::query_key;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn test_fn_fetcher_receives_key() {
        let fetcher = fetcher_fn(|key: QueryKey| async move { Ok(json!({"key": key.to_string()})) });
        let value = fetcher.fetch(&query_key!["users", 7]).await.unwrap();
        assert_eq!(value, json!({"key": "users/7"}));
    }
}
