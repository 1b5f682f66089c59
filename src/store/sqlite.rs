//! SQLite storage backend.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::PersistentStore;
use crate::error::{PersistError, PersistResult};

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-backed persistent store.
///
/// Every value is one row, replaced with a single `INSERT OR REPLACE`, so a
/// failed write never leaves a half-written snapshot behind.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  /// Upper bound on the total bytes held, emulating a storage quota.
  max_bytes: Option<usize>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
      max_bytes: None,
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Bound the total stored bytes.
  pub fn with_max_bytes(mut self, max_bytes: Option<usize>) -> Self {
    self.max_bytes = max_bytes;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("coachsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> PersistResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| PersistError::Unavailable(format!("lock poisoned: {e}")))
  }

  /// List stored keys with the given prefix.
  pub fn keys(&self, prefix: &str) -> PersistResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?1) = ?2 ORDER BY key")?;
    let keys = stmt
      .query_map(params![prefix.len() as i64, prefix], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }
}

impl PersistentStore for SqliteStore {
  fn load(&self, key: &str) -> PersistResult<Option<Vec<u8>>> {
    let conn = self.lock()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn save(&self, key: &str, value: &[u8]) -> PersistResult<()> {
    let conn = self.lock()?;

    if let Some(limit) = self.max_bytes {
      let others: i64 = conn.query_row(
        "SELECT COALESCE(SUM(length(value)), 0) FROM kv_store WHERE key != ?",
        params![key],
        |row| row.get(0),
      )?;
      let needed = others as usize + value.len();
      if needed > limit {
        return Err(PersistError::QuotaExceeded { needed, limit });
      }
    }

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> PersistResult<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::store::PersistentStoreExt;

  #[test]
  fn test_values_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      assert!(store.set("coachsync:queue", &vec!["a", "b"]));
    }

    let store = SqliteStore::open_at(&path).unwrap();
    let value: Option<Vec<String>> = store.get("coachsync:queue");
    assert_eq!(value, Some(vec!["a".to_string(), "b".to_string()]));
  }

  #[test]
  fn test_quota_failure_keeps_previous_value() {
    let store = SqliteStore::open_in_memory().unwrap().with_max_bytes(Some(16));
    assert!(store.set("k", "small"));

    let big = "x".repeat(64);
    assert!(!store.set("k", &big));

    assert_eq!(store.get::<String>("k").as_deref(), Some("small"));
  }

  #[test]
  fn test_keys_by_prefix() {
    let store = SqliteStore::open_in_memory().unwrap();
    store.save("coachsync:cache:foods", b"[]").unwrap();
    store.save("coachsync:cache:plans", b"[]").unwrap();
    store.save("coachsync:queue", b"[]").unwrap();

    let keys = store.keys("coachsync:cache:").unwrap();
    assert_eq!(keys, vec!["coachsync:cache:foods", "coachsync:cache:plans"]);

    store.remove("coachsync:cache:foods").unwrap();
    assert_eq!(store.keys("coachsync:cache:").unwrap().len(), 1);
  }
}
