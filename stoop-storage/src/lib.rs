//! Stoop Storage - query cache, fetch coordination and persistence
//!
//! - [`cache`]: the in-memory cache store, deduplicated fetching, optimistic
//!   mutations, memory-pressure eviction and periodic maintenance
//! - [`persistence`]: snapshotting the cache to durable storage and
//!   restoring it on startup
//! - [`retry`]: the timeout and retry wrapper shared by reads and writes

pub mod cache;
pub mod persistence;
pub mod retry;

pub use cache::{
    CacheFootprintProbe, CacheRead, CacheStats, CacheStore, EvictionReport, Evictor,
    FetchCoordinator, MaintenanceConfig, MemoryProbe, MemorySample, Modification, Mutation,
    MutationExecutor, OptimisticPatch, PressureLevel, QueryFetcher, Reconcile, RemoteFetcher,
    Subscription,
};
pub use persistence::{
    spawn_persister, CacheSnapshot, DurableStorage, FileStorage, LmdbStorage, MemoryStorage,
    PersistedEntry, PersistenceBridge, RestoreOutcome,
};
pub use retry::with_retry;
