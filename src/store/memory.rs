//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::PersistentStore;
use crate::error::{PersistError, PersistResult};

/// Storage that lives only as long as the process.
///
/// Used for ephemeral sessions and as the test double for [`SqliteStore`].
/// Supports a total-size quota and a switch that makes every write fail, to
/// exercise the quota-exceeded paths without a real disk.
///
/// [`SqliteStore`]: super::SqliteStore
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, Vec<u8>>>,
  max_bytes: Option<usize>,
  fail_writes: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Bound the total size of all stored values.
  pub fn with_max_bytes(max_bytes: usize) -> Self {
    Self {
      max_bytes: Some(max_bytes),
      ..Self::default()
    }
  }

  /// Make subsequent writes fail (or succeed again).
  pub fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub fn len(&self) -> usize {
    self.values.lock().map(|v| v.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl PersistentStore for MemoryStore {
  fn load(&self, key: &str) -> PersistResult<Option<Vec<u8>>> {
    let values = self
      .values
      .lock()
      .map_err(|e| PersistError::Unavailable(format!("lock poisoned: {e}")))?;
    Ok(values.get(key).cloned())
  }

  fn save(&self, key: &str, value: &[u8]) -> PersistResult<()> {
    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(PersistError::Unavailable("writes disabled".to_string()));
    }

    let mut values = self
      .values
      .lock()
      .map_err(|e| PersistError::Unavailable(format!("lock poisoned: {e}")))?;

    if let Some(limit) = self.max_bytes {
      let others: usize = values
        .iter()
        .filter(|(k, _)| k.as_str() != key)
        .map(|(_, v)| v.len())
        .sum();
      let needed = others + value.len();
      if needed > limit {
        return Err(PersistError::QuotaExceeded { needed, limit });
      }
    }

    values.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn remove(&self, key: &str) -> PersistResult<()> {
    let mut values = self
      .values
      .lock()
      .map_err(|e| PersistError::Unavailable(format!("lock poisoned: {e}")))?;
    values.remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_quota_rejects_oversized_write() {
    let store = MemoryStore::with_max_bytes(8);
    store.save("a", b"1234").unwrap();

    let err = store.save("b", b"123456").unwrap_err();
    assert!(matches!(
      err,
      PersistError::QuotaExceeded {
        needed: 10,
        limit: 8
      }
    ));

    // Replacing a key only counts its new size.
    store.save("a", b"12345678").unwrap();
    assert_eq!(store.load("a").unwrap().as_deref(), Some(&b"12345678"[..]));
  }

  #[test]
  fn test_remove_missing_key_is_ok() {
    let store = MemoryStore::new();
    assert!(store.remove("nope").is_ok());
    assert!(store.is_empty());
  }
}
