//! Freshness metadata for cache reads.
//!
//! Every read through the fetch coordinator returns a [`CacheRead<T>`] so
//! callers can see whether they got cached data, whether it was already
//! stale, and when it was fetched.

use std::time::Duration;

use stoop_core::{elapsed_between, Timestamp};

/// Result of a cache read, carrying staleness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRead<T> {
    /// The value served to the caller.
    value: T,
    /// When the value was last fetched from the backend.
    fetched_at: Timestamp,
    /// Whether the value came from the cache rather than a fresh fetch.
    was_cache_hit: bool,
    /// Whether the cached value was past its stale time when served.
    /// A background revalidation has been started for stale hits.
    was_stale: bool,
}

impl<T> CacheRead<T> {
    /// A read served from the cache.
    pub fn from_cache(value: T, fetched_at: Timestamp, was_stale: bool) -> Self {
        Self {
            value,
            fetched_at,
            was_cache_hit: true,
            was_stale,
        }
    }

    /// A read that had to wait for the backend.
    pub fn from_network(value: T, fetched_at: Timestamp) -> Self {
        Self {
            value,
            fetched_at,
            was_cache_hit: false,
            was_stale: false,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    /// Check if the data was fetched at or after the given timestamp.
    pub fn is_fresh_as_of(&self, timestamp: Timestamp) -> bool {
        self.fetched_at >= timestamp
    }

    /// Age of the data relative to `now`.
    pub fn age(&self, now: Timestamp) -> Duration {
        elapsed_between(self.fetched_at, now)
    }

    pub fn fetched_at(&self) -> Timestamp {
        self.fetched_at
    }

    pub fn was_cache_hit(&self) -> bool {
        self.was_cache_hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.was_cache_hit
    }

    /// True if stale data was served while a revalidation runs.
    pub fn was_stale(&self) -> bool {
        self.was_stale
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            fetched_at: self.fetched_at,
            was_cache_hit: self.was_cache_hit,
            was_stale: self.was_stale,
        }
    }

    /// Map the inner value with a fallible conversion.
    pub fn try_map<U, E, F>(self, f: F) -> Result<CacheRead<U>, E>
    where
        F: FnOnce(T) -> Result<U, E>,
    {
        Ok(CacheRead {
            value: f(self.value)?,
            fetched_at: self.fetched_at,
            was_cache_hit: self.was_cache_hit,
            was_stale: self.was_stale,
        })
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
