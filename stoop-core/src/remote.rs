//! Seams to the outside world: the remote data source, the server-push
//! channel, and the credential provider.
//!
//! All three are opaque to the sync core. Implementations classify their
//! failures into [`SyncError`] variants so retry policy can be applied
//! uniformly.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::watch;

use crate::error::SyncResult;
use crate::event::{ChangeOperation, PresenceEvent, PushMessage};
use crate::identity::AuthState;
use crate::key::QueryKey;

/// A read against the backend: resource name plus equality filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub resource: String,
    #[serde(default)]
    pub filters: BTreeMap<String, String>,
}

impl QueryRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            filters: BTreeMap::new(),
        }
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(column.into(), value.into());
        self
    }
}

/// A write against the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    pub resource: String,
    pub operation: ChangeOperation,
    pub payload: Value,
}

impl MutationRequest {
    pub fn new(resource: impl Into<String>, operation: ChangeOperation, payload: Value) -> Self {
        Self {
            resource: resource.into(),
            operation,
            payload,
        }
    }
}

/// Request/response access to the backend.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Run a read. Returns typed rows as JSON.
    async fn query(&self, request: &QueryRequest) -> SyncResult<Value>;

    /// Run a write. Returns the authoritative row as stored by the backend.
    async fn execute(&self, request: &MutationRequest) -> SyncResult<Value>;
}

/// Ordered stream of push messages for one connection.
pub type PushStream = BoxStream<'static, SyncResult<PushMessage>>;

/// Server-push channel.
///
/// `connect` opens a connection subscribed to every given resource class
/// (prefix keys). The stream ends when the connection closes; a stream item
/// error means the connection broke.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self, resource_classes: &[QueryKey]) -> SyncResult<PushStream>;
}

/// Outbound presence announcements for the signed-in user.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn announce(&self, event: PresenceEvent) -> SyncResult<()>;
}

/// Opaque credential provider.
pub trait CredentialProvider: Send + Sync {
    /// Current authentication state.
    fn current(&self) -> AuthState;

    /// Receiver that observes every signed-in/signed-out transition.
    fn watch(&self) -> watch::Receiver<AuthState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_request_filters_are_ordered() {
        let request = QueryRequest::new("listings")
            .filter("seller_id", "U123")
            .filter("category", "furniture");
        let columns: Vec<_> = request.filters.keys().cloned().collect();
        assert_eq!(columns, vec!["category".to_string(), "seller_id".to_string()]);
    }
}
