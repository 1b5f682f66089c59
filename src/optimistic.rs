//! Optimistic writes: update local state now, reconcile with the remote later.
//!
//! The coordinator applies the caller's local change before the write is even
//! queued. When the queued write is synced, the affected cache reads are
//! invalidated. When it is abandoned, the caller's rollback runs.

use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::Invalidate;
use crate::error::AbandonReason;
use crate::sync::{ItemOutcome, SyncQueue};

/// Cached reads made stale by a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
  Key(String),
  Prefix(String),
}

/// A remote write together with the reads it affects.
#[derive(Debug, Clone)]
pub struct Mutation {
  pub action: String,
  pub payload: Value,
  pub invalidates: Vec<Invalidation>,
}

impl Mutation {
  pub fn new(action: impl Into<String>, payload: Value) -> Self {
    Self {
      action: action.into(),
      payload,
      invalidates: Vec::new(),
    }
  }

  pub fn invalidates_key(mut self, key: impl Into<String>) -> Self {
    self.invalidates.push(Invalidation::Key(key.into()));
    self
  }

  pub fn invalidates_prefix(mut self, prefix: impl Into<String>) -> Self {
    self.invalidates.push(Invalidation::Prefix(prefix.into()));
    self
  }
}

/// Final result of an optimistic mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
  /// The remote write succeeded and stale reads were invalidated
  Committed,
  /// The remote write was abandoned and the local change was reverted
  RolledBack(AbandonReason),
  /// The queue went away before reporting; local state is left as is
  Detached,
}

/// Pending outcome of a mutation.
#[derive(Debug)]
pub struct MutationHandle {
  id: String,
  task: JoinHandle<MutationOutcome>,
}

impl MutationHandle {
  /// Id of the queued item carrying the remote write.
  pub fn id(&self) -> &str {
    &self.id
  }

  pub async fn outcome(self) -> MutationOutcome {
    self.task.await.unwrap_or(MutationOutcome::Detached)
  }
}

/// Entry point for user-initiated writes.
#[derive(Clone)]
pub struct OptimisticCoordinator {
  queue: SyncQueue,
  caches: Vec<Arc<dyn Invalidate>>,
}

impl OptimisticCoordinator {
  pub fn new(queue: SyncQueue) -> Self {
    Self {
      queue,
      caches: Vec::new(),
    }
  }

  /// Register a cache whose reads are invalidated after successful writes.
  pub fn with_cache(mut self, cache: Arc<dyn Invalidate>) -> Self {
    self.caches.push(cache);
    self
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  /// Apply `local_update`, queue the remote write, and reconcile once the
  /// queue reports the item's outcome.
  ///
  /// Must be called from within a tokio runtime.
  pub fn mutate<U, R>(&self, local_update: U, mutation: Mutation, local_rollback: R) -> MutationHandle
  where
    U: FnOnce(),
    R: FnOnce() + Send + 'static,
  {
    local_update();

    let Mutation {
      action,
      payload,
      invalidates,
    } = mutation;
    let (id, outcome) = self.queue.enqueue_tracked(action.clone(), payload);
    debug!(%id, %action, "optimistic mutation queued");

    let caches = self.caches.clone();
    let item_id = id.clone();
    let task = tokio::spawn(async move {
      match outcome.await {
        Ok(ItemOutcome::Synced) => {
          for cache in &caches {
            for invalidation in &invalidates {
              match invalidation {
                Invalidation::Key(key) => {
                  cache.invalidate(key);
                }
                Invalidation::Prefix(prefix) => {
                  cache.invalidate_prefix(prefix);
                }
              }
            }
          }
          MutationOutcome::Committed
        }
        Ok(ItemOutcome::Abandoned(reason)) => {
          warn!(id = %item_id, %action, %reason, "write abandoned, rolling back local change");
          local_rollback();
          MutationOutcome::RolledBack(reason)
        }
        Err(_) => MutationOutcome::Detached,
      }
    });

    MutationHandle { id, task }
  }
}

impl std::fmt::Debug for OptimisticCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("OptimisticCoordinator")
      .field("queue", &self.queue)
      .field("caches", &self.caches.len())
      .finish()
  }
}

/// Shared local state with snapshot rollback.
///
/// Rolling back restores the value captured just before the mutation, so a
/// later change made while the write was pending is lost as well.
#[derive(Debug, Default)]
pub struct Optimistic<S> {
  state: Arc<Mutex<S>>,
}

impl<S> Clone for Optimistic<S> {
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
    }
  }
}

impl<S: Clone + Send + 'static> Optimistic<S> {
  pub fn new(initial: S) -> Self {
    Self {
      state: Arc::new(Mutex::new(initial)),
    }
  }

  pub fn get(&self) -> S {
    self.lock().clone()
  }

  pub fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
    f(&*self.lock())
  }

  /// Apply `update` to the state and queue `mutation`; an abandoned write
  /// restores the pre-mutation snapshot.
  pub fn mutate_state(
    &self,
    coordinator: &OptimisticCoordinator,
    mutation: Mutation,
    update: impl FnOnce(&mut S),
  ) -> MutationHandle {
    let snapshot = self.get();
    let state = Arc::clone(&self.state);
    coordinator.mutate(
      || update(&mut *self.lock()),
      mutation,
      move || {
        *state.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
      },
    )
  }

  fn lock(&self) -> MutexGuard<'_, S> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TtlCache;
  use crate::connectivity::ConnectivityMonitor;
  use crate::error::RemoteError;
  use crate::sync::{actions, ActionRegistry, SyncEvent};
  use serde_json::json;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::time::Duration;

  fn queue_with(fail: Arc<AtomicBool>) -> SyncQueue {
    let registry = ActionRegistry::new().with(actions::UPDATE_RECORD, move |_payload: Value| {
      let failing = fail.load(Ordering::SeqCst);
      async move {
        if failing {
          Err(RemoteError::Status {
            status: 500,
            body: "boom".to_string(),
          })
        } else {
          Ok::<(), RemoteError>(())
        }
      }
    });
    SyncQueue::builder(registry)
      .connectivity(ConnectivityMonitor::with_initial(false))
      .build()
  }

  #[tokio::test]
  async fn test_abandoned_write_rolls_back_local_state() {
    let queue = queue_with(Arc::new(AtomicBool::new(true)));
    let mut events = queue.subscribe();
    let coordinator = OptimisticCoordinator::new(queue.clone());
    let weight = Optimistic::new(82.0_f64);

    let handle = weight.mutate_state(
      &coordinator,
      Mutation::new(actions::UPDATE_RECORD, json!({"id": "w1", "weight": 80.5})),
      |w| *w = 80.5,
    );
    assert_eq!(weight.get(), 80.5);

    queue.connectivity().set_online(true);
    for _ in 0..3 {
      queue.drain().await;
    }

    let outcome = handle.outcome().await;
    assert!(matches!(
      outcome,
      MutationOutcome::RolledBack(AbandonReason::Exhausted { attempts: 3, .. })
    ));
    assert_eq!(weight.get(), 82.0);

    let mut abandoned = 0;
    while let Ok(event) = events.try_recv() {
      if matches!(event, SyncEvent::Abandoned { .. }) {
        abandoned += 1;
      }
    }
    assert_eq!(abandoned, 1);
  }

  #[tokio::test]
  async fn test_local_update_runs_before_enqueue() {
    let queue = queue_with(Arc::new(AtomicBool::new(false)));
    let coordinator = OptimisticCoordinator::new(queue.clone());
    let seen_len = Arc::new(Mutex::new(None));

    let probe = queue.clone();
    let seen = Arc::clone(&seen_len);
    let _handle = coordinator.mutate(
      move || *seen.lock().unwrap() = Some(probe.len()),
      Mutation::new(actions::UPDATE_RECORD, json!({})),
      || {},
    );

    assert_eq!(*seen_len.lock().unwrap(), Some(0));
    assert_eq!(queue.len(), 1);
  }

  #[tokio::test]
  async fn test_synced_write_invalidates_cached_reads() {
    let queue = queue_with(Arc::new(AtomicBool::new(false)));
    let plans: TtlCache<String> = TtlCache::new("plan");
    let ttl = Duration::from_secs(600);
    plans
      .resolve("plan:c1:w1", ttl, || async { Ok::<_, RemoteError>("old".to_string()) })
      .await
      .unwrap();
    plans
      .resolve("plan:c1:w2", ttl, || async { Ok::<_, RemoteError>("old".to_string()) })
      .await
      .unwrap();
    plans
      .resolve("plan:c2:w1", ttl, || async { Ok::<_, RemoteError>("other".to_string()) })
      .await
      .unwrap();

    let coordinator = OptimisticCoordinator::new(queue.clone()).with_cache(Arc::new(plans.clone()));
    let rolled_back = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&rolled_back);
    let handle = coordinator.mutate(
      || {},
      Mutation::new(actions::UPDATE_RECORD, json!({"client": "c1"})).invalidates_prefix("plan:c1:"),
      move || flag.store(true, Ordering::SeqCst),
    );

    queue.connectivity().set_online(true);
    queue.drain().await;

    assert_eq!(handle.outcome().await, MutationOutcome::Committed);
    assert!(!rolled_back.load(Ordering::SeqCst));
    assert_eq!(plans.peek("plan:c1:w1"), None);
    assert_eq!(plans.peek("plan:c1:w2"), None);
    assert_eq!(plans.peek("plan:c2:w1"), Some("other".to_string()));
  }
}
