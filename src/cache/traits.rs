//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Values a [`TtlCache`](super::TtlCache) can hold.
///
/// Values are cloned out to every waiter of a shared fetch and serialized into
/// the persisted snapshot.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A single cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
  /// Fingerprint of the request that produced the value
  pub key: String,
  pub value: T,
  /// When the value was stored
  pub stored_at: DateTime<Utc>,
  /// `stored_at + ttl`; the entry is dead once `now > expires_at`
  pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn is_live(&self, now: DateTime<Utc>) -> bool {
    now <= self.expires_at
  }
}

/// Explicit eviction, object-safe so a mutation can invalidate caches of
/// different value types.
pub trait Invalidate: Send + Sync {
  /// Drop the entry for `key`. Returns whether one existed.
  fn invalidate(&self, key: &str) -> bool;

  /// Drop every entry whose key starts with `prefix`. Returns how many.
  fn invalidate_prefix(&self, prefix: &str) -> usize;
}

/// Counters describing cache behaviour since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Served from a live entry
  pub hits: u64,
  /// Started a new fetch
  pub misses: u64,
  /// Attached to a fetch already in flight
  pub joined: u64,
  /// Entries removed to respect capacity
  pub evictions: u64,
  /// Entries currently held
  pub entries: usize,
  /// Fetches currently in flight
  pub in_flight: usize,
}
