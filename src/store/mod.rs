//! Durable key-value storage for queue and cache snapshots.
//!
//! Backends only move bytes. The typed helpers in [`PersistentStoreExt`]
//! serialize to JSON and swallow failures after logging them, so a full disk
//! or a quota error never breaks the caller: in-memory state stays
//! authoritative for the session and the last good snapshot stays on disk.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::error::PersistResult;

/// Prefix shared by every key this crate writes.
pub const KEY_PREFIX: &str = "coachsync";

/// Key holding the serialized sync queue.
pub fn queue_key() -> String {
  format!("{KEY_PREFIX}:queue")
}

/// Key holding the snapshot of one cache namespace.
pub fn cache_key(namespace: &str) -> String {
  format!("{KEY_PREFIX}:cache:{namespace}")
}

/// Trait for durable storage backends.
///
/// Implementations must be synchronous and must replace a value atomically:
/// a failed `save` leaves the previous value readable.
pub trait PersistentStore: Send + Sync {
  /// Read the raw bytes stored under `key`.
  fn load(&self, key: &str) -> PersistResult<Option<Vec<u8>>>;

  /// Replace the value stored under `key`.
  fn save(&self, key: &str, value: &[u8]) -> PersistResult<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove(&self, key: &str) -> PersistResult<()>;
}

/// Typed, non-failing access on top of any [`PersistentStore`].
pub trait PersistentStoreExt: PersistentStore {
  /// Load and decode a value. Missing, unreadable and undecodable values all
  /// come back as `None`.
  fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let bytes = match self.load(key) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "failed to read persisted state");
        return None;
      }
    };

    match serde_json::from_slice(&bytes) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key, error = %e, "discarding undecodable persisted state");
        None
      }
    }
  }

  /// Encode and store a value. Returns whether the write landed.
  fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
    let bytes = match serde_json::to_vec(value) {
      Ok(bytes) => bytes,
      Err(e) => {
        warn!(key, error = %e, "failed to serialize state for persistence");
        return false;
      }
    };

    match self.save(key, &bytes) {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "failed to persist state, keeping previous snapshot");
        false
      }
    }
  }

  /// Remove a value, logging failures.
  fn delete(&self, key: &str) -> bool {
    match self.remove(key) {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "failed to remove persisted state");
        false
      }
    }
  }
}

impl<S: PersistentStore + ?Sized> PersistentStoreExt for S {}
