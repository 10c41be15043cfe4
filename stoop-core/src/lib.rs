//! Stoop Core - shared types for the client sync core
//!
//! Keys, cache entry model, push events, error taxonomy, configuration and
//! the seams to the backend. This crate holds data and small pure helpers
//! only; the cache, reconciler and presence logic live in the other crates.

pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod event;
pub mod identity;
pub mod key;
pub mod remote;

pub use clock::{add_duration, elapsed_between, system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    CacheConfig, FetchConfig, InsertPlacement, MemoryConfig, MutationConfig, PersistenceConfig,
    PresenceConfig, RealtimeConfig, ReconnectConfig, RetryConfig, SyncConfig, CONFIG_ENV_VAR,
};
pub use entry::{approx_size, CacheEntry, QueryStatus};
pub use error::{ConfigError, ErrorKind, PersistenceError, SyncError, SyncResult};
pub use event::{ChangeOperation, PresenceEvent, PresenceKind, PushMessage, RealtimeEvent};
pub use identity::{AuthState, Identity, Timestamp, UserId};
pub use key::{KeySegment, QueryKey};
pub use remote::{
    CredentialProvider, MutationRequest, PresenceSink, PushChannel, PushStream, QueryRequest,
    RemoteSource,
};
