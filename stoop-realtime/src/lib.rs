//! Stoop Realtime - server-push reconciliation and presence
//!
//! - [`reconciler`]: the push connection state machine that merges pushed
//!   row changes into the cache in arrival order
//! - [`presence`]: who is online, derived from heartbeat recency
//! - [`backoff`]: reconnect delays with jitter

pub mod backoff;
pub mod presence;
pub mod reconciler;

pub use backoff::Backoff;
pub use presence::{spawn_heartbeat, spawn_sweeper, PresenceRecord, PresenceTracker};
pub use reconciler::{
    apply_event, ConnectionState, RealtimeHandle, RealtimeReconciler, RealtimeStatus,
};
