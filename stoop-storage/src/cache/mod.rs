//! Client-side query cache.
//!
//! The [`CacheStore`] owns every [`stoop_core::CacheEntry`]. The
//! [`FetchCoordinator`] reads through it with in-flight deduplication and
//! retry, the [`MutationExecutor`] applies optimistic edits with rollback,
//! and the [`Evictor`] plus the maintenance task keep it bounded.
//!
//! # Example
//!
//! ```ignore
//! let store = Arc::new(CacheStore::new(config.cache.clone(), system_clock()));
//! let coordinator = FetchCoordinator::new(Arc::clone(&store), config.fetch.clone());
//!
//! let read = coordinator
//!     .ensure(&query_key!["marketplace", "list"], fetcher)
//!     .await?;
//! if read.was_stale() {
//!     // a background revalidation is already running
//! }
//! ```

pub mod collection;
pub mod eviction;
pub mod fetch;
pub mod freshness;
pub mod maintenance;
pub mod mutation;
pub mod store;
pub mod traits;

pub use collection::{apply_change, identity_of, remove_row, upsert_row};
pub use eviction::{
    CacheFootprintProbe, EvictionReport, Evictor, MemoryProbe, MemorySample, PressureLevel,
};
pub use fetch::FetchCoordinator;
pub use freshness::CacheRead;
pub use maintenance::{
    maintenance_task, spawn_maintenance, MaintenanceConfig, MaintenanceMetrics,
    MaintenanceSnapshot,
};
pub use mutation::{Mutation, MutationExecutor, OptimisticPatch, Reconcile};
pub use store::{CacheStore, FetchSettlement, FetchToken, Modification, RefetchTarget, Subscription};
pub use traits::{fetcher_fn, CacheStats, FnFetcher, QueryFetcher, RemoteFetcher};
