//! Server-push event types.
//!
//! The backend pushes row changes and presence signals over one channel. Both
//! arrive as [`PushMessage`] values in receipt order.

use crate::identity::{Timestamp, UserId};
use crate::key::QueryKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of row change carried by a [`RealtimeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

/// A row change notification for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// Key of the resource (collection or single row) the change belongs to.
    pub resource_key: QueryKey,
    pub operation: ChangeOperation,
    /// The new row for insert/update; at least the identity field for delete.
    pub payload: Value,
    /// Receipt sequence, stamped by the reconciler. Zero until received.
    #[serde(default)]
    pub sequence: u64,
    #[serde(default)]
    pub received_at: Option<Timestamp>,
}

impl RealtimeEvent {
    pub fn new(resource_key: QueryKey, operation: ChangeOperation, payload: Value) -> Self {
        Self {
            resource_key,
            operation,
            payload,
            sequence: 0,
            received_at: None,
        }
    }

    pub fn insert(resource_key: QueryKey, payload: Value) -> Self {
        Self::new(resource_key, ChangeOperation::Insert, payload)
    }

    pub fn update(resource_key: QueryKey, payload: Value) -> Self {
        Self::new(resource_key, ChangeOperation::Update, payload)
    }

    pub fn delete(resource_key: QueryKey, payload: Value) -> Self {
        Self::new(resource_key, ChangeOperation::Delete, payload)
    }
}

/// Presence signal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    Join,
    Heartbeat,
    Leave,
}

/// A presence signal for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: UserId,
    pub kind: PresenceKind,
    /// Time the signal was emitted by the user's client.
    pub at: Timestamp,
}

impl PresenceEvent {
    pub fn heartbeat(user_id: UserId, at: Timestamp) -> Self {
        Self {
            user_id,
            kind: PresenceKind::Heartbeat,
            at,
        }
    }

    pub fn join(user_id: UserId, at: Timestamp) -> Self {
        Self {
            user_id,
            kind: PresenceKind::Join,
            at,
        }
    }

    pub fn leave(user_id: UserId, at: Timestamp) -> Self {
        Self {
            user_id,
            kind: PresenceKind::Leave,
            at,
        }
    }
}

/// Everything the push channel can deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushMessage {
    /// A row changed.
    Resource(RealtimeEvent),
    /// A user joined, left, or sent a heartbeat.
    Presence(PresenceEvent),
}

impl PushMessage {
    /// Short name used in log fields.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Resource(event) => match event.operation {
                ChangeOperation::Insert => "resource.insert",
                ChangeOperation::Update => "resource.update",
                ChangeOperation::Delete => "resource.delete",
            },
            Self::Presence(event) => match event.kind {
                PresenceKind::Join => "presence.join",
                PresenceKind::Heartbeat => "presence.heartbeat",
                PresenceKind::Leave => "presence.leave",
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_push_message_wire_format() {
        let message = PushMessage::Resource(RealtimeEvent::delete(
            query_key!["marketplace", "list"],
            json!({"id": "a"}),
        ));
        let text = serde_json::to_string(&message).unwrap();
        assert!(text.contains(r#""type":"Resource""#));
        assert!(text.contains(r#""operation":"delete""#));

        let parsed: PushMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_event_type_names() {
        let user = UserId::now_v7();
        let presence = PushMessage::Presence(PresenceEvent::heartbeat(user, Utc::now()));
        assert_eq!(presence.event_type(), "presence.heartbeat");

        let resource = PushMessage::Resource(RealtimeEvent::insert(
            query_key!["messages"],
            json!({"id": 1}),
        ));
        assert_eq!(resource.event_type(), "resource.insert");
    }

    #[test]
    fn test_sequence_defaults_when_missing() {
        let text = r#"{"resource_key":["directory"],"operation":"update","payload":{"id":"x"}}"#;
        let event: RealtimeEvent = serde_json::from_str(text).unwrap();
        assert_eq!(event.sequence, 0);
        assert!(event.received_at.is_none());
    }
}
