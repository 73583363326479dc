// ABOUTME: Immutable snapshot shapes handed to extensions and the persistence port.
// ABOUTME: Restore accepts the same shape, so optional fields default when absent.

use crate::ids::{MemberId, QueueId, ServerId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One slot of a persisted waiting list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingEntry {
    pub actor_id: MemberId,
    pub wait_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub topic_name: String,
    pub parent_group_id: String,
    #[serde(default)]
    pub waiting_list: Vec<WaitingEntry>,
    #[serde(default)]
    pub notify_group: Vec<MemberId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_clear_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_closed_at: Option<DateTime<Utc>>,
    /// Whether any helper was serving the queue when the snapshot was taken
    #[serde(default)]
    pub is_open: bool,
}

impl QueueSnapshot {
    pub fn queue_id(&self) -> QueueId {
        QueueId::new(self.parent_group_id.clone())
    }

    pub fn len(&self) -> usize {
        self.waiting_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting_list.is_empty()
    }

    pub fn contains(&self, actor: &MemberId) -> bool {
        self.waiting_list.iter().any(|w| &w.actor_id == actor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    #[serde(default)]
    pub server_id: ServerId,
    #[serde(default = "Utc::now")]
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub queues: Vec<QueueSnapshot>,
}

/// Persistence port called after every state-changing operation.
///
/// Errors are logged by the caller and never fail the operation that
/// triggered the save.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Persist the full server state
    async fn save_server(&self, snapshot: &ServerSnapshot) -> Result<()>;

    /// Persist a single queue. Defaults to doing nothing so sinks that only
    /// care about full snapshots can skip it.
    async fn save_queue(&self, _server_id: &ServerId, _queue: &QueueSnapshot) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_restore_shape_deserializes() {
        let json = r#"{
            "queues": [{
                "topic_name": "Office Hours",
                "parent_group_id": "cat-1",
                "waiting_list": [{"actor_id": "alice", "wait_start": "2024-01-01T00:00:00Z"}]
            }]
        }"#;
        let snapshot: ServerSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.queues.len(), 1);
        let queue = &snapshot.queues[0];
        assert_eq!(queue.queue_id(), QueueId::new("cat-1"));
        assert!(queue.contains(&MemberId::new("alice")));
        assert!(queue.notify_group.is_empty());
        assert!(queue.auto_clear_timeout_secs.is_none());
        assert!(!queue.is_open);
    }

    #[test]
    fn test_queue_snapshot_skips_empty_optionals() {
        let snapshot = QueueSnapshot {
            topic_name: "t".to_string(),
            parent_group_id: "p".to_string(),
            waiting_list: vec![],
            notify_group: vec![],
            auto_clear_timeout_secs: None,
            last_closed_at: None,
            is_open: false,
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("auto_clear_timeout_secs"));
        assert!(!json.contains("last_closed_at"));
    }
}
