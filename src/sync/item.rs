//! Queue items, status snapshots and notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AbandonReason;

/// Lifecycle of an item while it is in the queue.
///
/// Items leave the queue when they succeed or are abandoned, so those states
/// are reported through [`SyncEvent`] rather than stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ItemState {
  /// Waiting for the next drain pass
  #[default]
  Pending,
  /// Handed to the remote executor
  Sending,
}

/// A pending write operation.
///
/// Persisted as `{ id, action, payload, enqueuedAt, retryCount }`. The state
/// is not persisted: anything reloaded was interrupted and is Pending again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
  pub id: String,
  /// Action tag used to pick the remote executor (e.g. "create-record")
  pub action: String,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  /// Failed attempts so far. Never decreases.
  pub retry_count: u32,
  #[serde(skip)]
  pub state: ItemState,
}

impl QueueItem {
  pub fn new(action: impl Into<String>, payload: Value, enqueued_at: DateTime<Utc>) -> Self {
    Self {
      id: uuid::Uuid::new_v4().to_string(),
      action: action.into(),
      payload,
      enqueued_at,
      retry_count: 0,
      state: ItemState::Pending,
    }
  }
}

/// Queue summary for badges and status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
  pub pending: usize,
  pub last_sync_at: Option<DateTime<Utc>>,
  pub draining: bool,
}

/// Final result of a queued item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
  Synced,
  Abandoned(AbandonReason),
}

/// Notifications for UI feedback. Not needed for correctness.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  Enqueued {
    id: String,
    action: String,
  },
  Synced {
    id: String,
    action: String,
  },
  /// An attempt failed and the item stays queued
  Retrying {
    id: String,
    action: String,
    attempts: u32,
    error: String,
  },
  /// The item was dropped without succeeding
  Abandoned {
    id: String,
    action: String,
    reason: AbandonReason,
  },
  StatusChanged(QueueStatus),
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub synced: usize,
  /// Attempts that failed and left their item queued
  pub failed: usize,
  pub abandoned: usize,
  /// Items still queued after the pass
  pub remaining: usize,
  /// The pass stopped because the monitor reported offline
  pub went_offline: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_item_serializes_with_camel_case_schema() {
    let at = DateTime::<Utc>::default();
    let item = QueueItem::new("create-record", json!({"table": "meals"}), at);

    let value = serde_json::to_value(&item).unwrap();
    let obj = value.as_object().unwrap();
    let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
      keys,
      vec!["action", "enqueuedAt", "id", "payload", "retryCount"]
    );
    assert_eq!(obj["retryCount"], json!(0));
  }

  #[test]
  fn test_reloaded_item_is_pending() {
    let mut item = QueueItem::new("update-record", json!({}), Utc::now());
    item.state = ItemState::Sending;

    let json = serde_json::to_string(&item).unwrap();
    let back: QueueItem = serde_json::from_str(&json).unwrap();
    assert_eq!(back.state, ItemState::Pending);
    assert_eq!(back.id, item.id);
  }

  #[test]
  fn test_ids_are_unique() {
    let now = Utc::now();
    let a = QueueItem::new("create-record", json!({}), now);
    let b = QueueItem::new("create-record", json!({}), now);
    assert_ne!(a.id, b.id);
  }
}
