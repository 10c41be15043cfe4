//! Stoop Client - the sync core as the UI sees it
//!
//! [`SyncClient`] serves cached data instantly, revalidates it against the
//! backend, merges server-push changes into the cache, tracks who is online
//! and keeps the cache bounded.
//!
//! ```ignore
//! let client = SyncClient::builder(remote)
//!     .config(SyncConfig::load()?)
//!     .push_channel(push)
//!     .credentials(credentials)
//!     .resource_class(query_key!["marketplace"])
//!     .build()?;
//! client.start().await?;
//!
//! let listings = client
//!     .ensure_query(&query_key!["marketplace", "list"], QueryRequest::new("listings"))
//!     .await?;
//! ```

pub mod client;
pub mod live;
pub mod session;
pub mod telemetry;

pub use client::{SyncClient, SyncClientBuilder};
pub use live::LiveQuery;
pub use session::{classify, SessionTransition};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

pub use stoop_core::{
    query_key, AuthState, CacheEntry, ChangeOperation, Identity, MutationRequest, QueryKey,
    QueryRequest, QueryStatus, SyncConfig, SyncError, SyncResult, UserId,
};
pub use stoop_realtime::{ConnectionState, RealtimeStatus};
pub use stoop_storage::cache::fetcher_fn;
pub use stoop_storage::{
    CacheRead, Mutation, OptimisticPatch, QueryFetcher, Reconcile, RestoreOutcome,
};
