//! TTL cache with in-flight request deduplication.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use super::traits::{CacheEntry, CacheStats, Cacheable, Invalidate};
use crate::clock::{Clock, SystemClock};
use crate::error::FetchError;
use crate::store::{cache_key, PersistentStore, PersistentStoreExt};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

/// A fetch that has started but not settled. At most one exists per key.
struct InFlight<T> {
  generation: u64,
  result: SharedFetch<T>,
  /// Callers currently awaiting `result`
  waiters: usize,
  abort: AbortHandle,
}

struct CacheState<T> {
  entries: HashMap<String, CacheEntry<T>>,
  in_flight: HashMap<String, InFlight<T>>,
}

#[derive(Default)]
struct Counters {
  hits: AtomicU64,
  misses: AtomicU64,
  joined: AtomicU64,
  evictions: AtomicU64,
}

struct CacheInner<T> {
  namespace: String,
  capacity: usize,
  fetch_timeout: Option<Duration>,
  clock: Arc<dyn Clock>,
  store: Option<Arc<dyn PersistentStore>>,
  state: Mutex<CacheState<T>>,
  counters: Counters,
  next_generation: AtomicU64,
}

/// Builder for [`TtlCache`].
pub struct TtlCacheBuilder {
  namespace: String,
  capacity: usize,
  fetch_timeout: Option<Duration>,
  clock: Arc<dyn Clock>,
  store: Option<Arc<dyn PersistentStore>>,
}

impl TtlCacheBuilder {
  pub fn new(namespace: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      capacity: DEFAULT_CAPACITY,
      fetch_timeout: None,
      clock: Arc::new(SystemClock),
      store: None,
    }
  }

  /// Maximum number of entries before the oldest are evicted.
  pub fn capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  /// Upper bound on a single fetch; elapsed fetches fail with
  /// [`FetchError::Timeout`].
  pub fn fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.fetch_timeout = timeout;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Persist live entries under this cache's namespace.
  pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
    self.store = Some(store);
    self
  }

  /// Build the cache, restoring any persisted snapshot.
  pub fn build<T: Cacheable>(self) -> TtlCache<T> {
    let cache = TtlCache {
      inner: Arc::new(CacheInner {
        namespace: self.namespace,
        capacity: self.capacity,
        fetch_timeout: self.fetch_timeout,
        clock: self.clock,
        store: self.store,
        state: Mutex::new(CacheState {
          entries: HashMap::new(),
          in_flight: HashMap::new(),
        }),
        counters: Counters::default(),
        next_generation: AtomicU64::new(0),
      }),
    };
    cache.restore();
    cache
  }
}

/// Cache mapping request fingerprints to values with expiry.
///
/// Lookups go through [`resolve`](Self::resolve):
///
/// 1. A live entry is returned without touching the network
/// 2. A fetch already in flight for the key is joined
/// 3. Otherwise the fetcher runs once and every waiter gets its result
///
/// Failed fetches are never cached. A zero TTL bypasses the cache entirely.
pub struct TtlCache<T> {
  inner: Arc<CacheInner<T>>,
}

impl<T> Clone for TtlCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Default entry limit per namespace.
pub const DEFAULT_CAPACITY: usize = 200;

impl<T: Cacheable> TtlCache<T> {
  /// In-memory cache with default settings.
  pub fn new(namespace: impl Into<String>) -> Self {
    TtlCacheBuilder::new(namespace).build()
  }

  pub fn namespace(&self) -> &str {
    &self.inner.namespace
  }

  /// Return the cached value for `key`, or fetch it.
  pub async fn resolve<F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<T, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<FetchError> + Send + 'static,
  {
    self
      .resolve_until(key, ttl, fetcher, futures::future::pending::<()>())
      .await
  }

  /// Like [`resolve`](Self::resolve), but gives up with
  /// [`FetchError::Cancelled`] as soon as `cancel` completes.
  ///
  /// If this caller was the only one waiting, the underlying fetch is aborted
  /// and forgotten. Other waiters on the same fetch are unaffected.
  pub async fn resolve_until<F, Fut, E, C>(
    &self,
    key: &str,
    ttl: Duration,
    fetcher: F,
    cancel: C,
  ) -> Result<T, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<FetchError> + Send + 'static,
    C: Future<Output = ()>,
  {
    if ttl.is_zero() {
      self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
      let fetch = with_timeout(fetcher(), self.inner.fetch_timeout);
      return tokio::select! {
        result = fetch => result,
        _ = cancel => Err(FetchError::Cancelled),
      };
    }

    let waiter = match self.lookup_or_start(key, ttl, fetcher) {
      Lookup::Hit(value) => return Ok(value),
      Lookup::Wait(waiter) => waiter,
    };

    // The guard inside `waiter` releases our claim on the fetch when this
    // future completes or is dropped.
    let result = waiter.result.clone();
    tokio::select! {
      result = result => result,
      _ = cancel => Err(FetchError::Cancelled),
    }
  }

  fn lookup_or_start<F, Fut, E>(&self, key: &str, ttl: Duration, fetcher: F) -> Lookup<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<FetchError> + Send + 'static,
  {
    let now = self.inner.clock.now();
    let mut state = self.inner.lock_state();

    if let Some(entry) = state.entries.get(key) {
      if entry.is_live(now) {
        self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
        trace!(namespace = %self.inner.namespace, key, "cache hit");
        return Lookup::Hit(entry.value.clone());
      }
      state.entries.remove(key);
      trace!(namespace = %self.inner.namespace, key, "cache entry expired");
    }

    if let Some(in_flight) = state.in_flight.get_mut(key) {
      in_flight.waiters += 1;
      self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
      debug!(namespace = %self.inner.namespace, key, waiters = in_flight.waiters, "joining in-flight fetch");
      return Lookup::Wait(Waiter {
        result: in_flight.result.clone(),
        _guard: WaiterGuard {
          inner: Arc::clone(&self.inner),
          key: key.to_string(),
          generation: in_flight.generation,
        },
      });
    }

    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
    let fetch = with_timeout(fetcher(), self.inner.fetch_timeout);

    // Settlement happens inside the task so the entry is stored exactly once,
    // however many callers are waiting.
    let inner = Arc::clone(&self.inner);
    let task_key = key.to_string();
    let task = tokio::spawn(async move {
      let result = fetch.await;
      inner.settle(&task_key, generation, ttl, &result);
      result
    });
    let abort = task.abort_handle();

    let result: SharedFetch<T> = async move {
      match task.await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(FetchError::Cancelled),
        Err(e) => Err(FetchError::failed(format!("fetch task panicked: {e}"))),
      }
    }
    .boxed()
    .shared();

    state.in_flight.insert(
      key.to_string(),
      InFlight {
        generation,
        result: result.clone(),
        waiters: 1,
        abort,
      },
    );
    debug!(namespace = %self.inner.namespace, key, "starting fetch");

    Lookup::Wait(Waiter {
      result,
      _guard: WaiterGuard {
        inner: Arc::clone(&self.inner),
        key: key.to_string(),
        generation,
      },
    })
  }

  /// Live value for `key`, without fetching.
  pub fn peek(&self, key: &str) -> Option<T> {
    let now = self.inner.clock.now();
    let state = self.inner.lock_state();
    state
      .entries
      .get(key)
      .filter(|e| e.is_live(now))
      .map(|e| e.value.clone())
  }

  /// Drop the entry for `key`.
  pub fn invalidate(&self, key: &str) -> bool {
    let mut state = self.inner.lock_state();
    let removed = state.entries.remove(key).is_some();
    if removed {
      debug!(namespace = %self.inner.namespace, key, "invalidated");
      self.inner.persist(&state);
    }
    removed
  }

  /// Drop every entry whose key starts with `prefix`.
  pub fn invalidate_prefix(&self, prefix: &str) -> usize {
    let mut state = self.inner.lock_state();
    let before = state.entries.len();
    state.entries.retain(|key, _| !key.starts_with(prefix));
    let removed = before - state.entries.len();
    if removed > 0 {
      debug!(namespace = %self.inner.namespace, prefix, removed, "invalidated by prefix");
      self.inner.persist(&state);
    }
    removed
  }

  /// Drop all entries. In-flight fetches are left to finish.
  pub fn clear(&self) {
    let mut state = self.inner.lock_state();
    state.entries.clear();
    self.inner.persist(&state);
  }

  /// Remove expired entries. Returns how many were dropped.
  pub fn purge_expired(&self) -> usize {
    let now = self.inner.clock.now();
    let mut state = self.inner.lock_state();
    let before = state.entries.len();
    state.entries.retain(|_, e| e.is_live(now));
    let removed = before - state.entries.len();
    if removed > 0 {
      self.inner.persist(&state);
    }
    removed
  }

  pub fn len(&self) -> usize {
    self.inner.lock_state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn stats(&self) -> CacheStats {
    let state = self.inner.lock_state();
    let c = &self.inner.counters;
    CacheStats {
      hits: c.hits.load(Ordering::Relaxed),
      misses: c.misses.load(Ordering::Relaxed),
      joined: c.joined.load(Ordering::Relaxed),
      evictions: c.evictions.load(Ordering::Relaxed),
      entries: state.entries.len(),
      in_flight: state.in_flight.len(),
    }
  }

  /// Load the persisted snapshot, skipping entries that already expired.
  fn restore(&self) -> usize {
    let Some(store) = &self.inner.store else {
      return 0;
    };
    let Some(snapshot) = store.get::<Vec<CacheEntry<T>>>(&cache_key(&self.inner.namespace)) else {
      return 0;
    };

    let now = self.inner.clock.now();
    let restored = {
      let mut state = self.inner.lock_state();
      for entry in snapshot.into_iter().filter(|e| e.is_live(now)) {
        state.entries.insert(entry.key.clone(), entry);
      }
      let evicted = evict_oldest(&mut state.entries, self.inner.capacity);
      self.inner.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
      state.entries.len()
    };
    debug!(namespace = %self.inner.namespace, restored, "restored cache snapshot");
    restored
  }
}

impl<T: Cacheable> Invalidate for TtlCache<T> {
  fn invalidate(&self, key: &str) -> bool {
    TtlCache::invalidate(self, key)
  }

  fn invalidate_prefix(&self, prefix: &str) -> usize {
    TtlCache::invalidate_prefix(self, prefix)
  }
}

impl<T: Cacheable> CacheInner<T> {
  fn lock_state(&self) -> MutexGuard<'_, CacheState<T>> {
    // The state is a plain map; a panic elsewhere cannot leave it torn.
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn settle(&self, key: &str, generation: u64, ttl: Duration, result: &Result<T, FetchError>) {
    let mut state = self.lock_state();
    match state.in_flight.get(key) {
      Some(in_flight) if in_flight.generation == generation => {
        state.in_flight.remove(key);
      }
      _ => return,
    }

    let Ok(value) = result else {
      debug!(namespace = %self.namespace, key, "fetch failed, not cached");
      return;
    };

    let stored_at = self.clock.now();
    state.entries.insert(
      key.to_string(),
      CacheEntry {
        key: key.to_string(),
        value: value.clone(),
        stored_at,
        expires_at: expiry(stored_at, ttl),
      },
    );
    let evicted = evict_oldest(&mut state.entries, self.capacity);
    if evicted > 0 {
      self.counters.evictions.fetch_add(evicted, Ordering::Relaxed);
      debug!(namespace = %self.namespace, evicted, "evicted oldest entries");
    }
    self.persist(&state);
  }

  /// Release one waiter's claim. The last waiter to leave before the fetch
  /// settles aborts it.
  fn release(&self, key: &str, generation: u64) {
    let mut state = self.lock_state();
    let Some(in_flight) = state.in_flight.get_mut(key) else {
      return;
    };
    if in_flight.generation != generation {
      return;
    }

    in_flight.waiters = in_flight.waiters.saturating_sub(1);
    if in_flight.waiters == 0 {
      in_flight.abort.abort();
      state.in_flight.remove(key);
      debug!(namespace = %self.namespace, key, "last waiter left, fetch aborted");
    }
  }

  /// Write the snapshot while the caller holds the state lock, so snapshots
  /// land in the order their changes were made.
  fn persist(&self, state: &CacheState<T>) {
    let Some(store) = &self.store else {
      return;
    };
    let mut snapshot: Vec<&CacheEntry<T>> = state.entries.values().collect();
    snapshot.sort_by_key(|e| e.stored_at);
    store.set(&cache_key(&self.namespace), &snapshot);
  }
}

enum Lookup<T: Cacheable> {
  Hit(T),
  Wait(Waiter<T>),
}

struct Waiter<T: Cacheable> {
  result: SharedFetch<T>,
  _guard: WaiterGuard<T>,
}

struct WaiterGuard<T: Cacheable> {
  inner: Arc<CacheInner<T>>,
  key: String,
  generation: u64,
}

impl<T: Cacheable> Drop for WaiterGuard<T> {
  fn drop(&mut self) {
    self.inner.release(&self.key, self.generation);
  }
}

async fn with_timeout<T, E, Fut>(fetch: Fut, timeout: Option<Duration>) -> Result<T, FetchError>
where
  Fut: Future<Output = Result<T, E>>,
  E: Into<FetchError>,
{
  match timeout {
    Some(limit) => match tokio::time::timeout(limit, fetch).await {
      Ok(result) => result.map_err(Into::into),
      Err(_) => Err(FetchError::Timeout(limit)),
    },
    None => fetch.await.map_err(Into::into),
  }
}

fn expiry(stored_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
  // TTLs are whole milliseconds.
  let ttl = chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 2));
  stored_at
    .checked_add_signed(ttl)
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Evict oldest-stored entries until `entries` fits in `capacity`.
fn evict_oldest<T>(entries: &mut HashMap<String, CacheEntry<T>>, capacity: usize) -> u64 {
  let mut evicted = 0;
  while entries.len() > capacity {
    let oldest = entries
      .values()
      .min_by_key(|e| e.stored_at)
      .map(|e| e.key.clone());
    match oldest {
      Some(key) => {
        entries.remove(&key);
        evicted += 1;
      }
      None => break,
    }
  }
  evicted
}
