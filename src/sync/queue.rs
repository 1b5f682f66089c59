//! Persisted FIFO queue of remote writes with bounded retries.
//!
//! Every item moves through `Pending -> Sending -> (Synced | Pending | Abandoned)`.
//! A single drain loop drives the transitions:
//!
//! - Items are sent strictly in enqueue order
//! - A failed attempt bumps `retry_count` and ends the pass, so later writes to
//!   the same resource never overtake an earlier one
//! - Reaching `max_retries` failures, or an action with no executor, abandons
//!   the item
//!
//! The queue is written to the [`PersistentStore`] on every change, before
//! `enqueue` returns.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::executor::ActionRegistry;
use super::item::{DrainReport, ItemOutcome, ItemState, QueueItem, QueueStatus, SyncEvent};
use crate::clock::{Clock, SystemClock};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{AbandonReason, RemoteError};
use crate::store::{queue_key, MemoryStore, PersistentStore, PersistentStoreExt};

/// Tuning for the sync queue.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// Failed attempts after which an item is abandoned.
  pub max_retries: u32,
  /// Delay between an enqueue and the drain it triggers.
  pub drain_debounce: Duration,
  /// Upper bound on one remote attempt; elapsed attempts count as failures.
  pub request_timeout: Duration,
  /// First delay before the background worker retries a failed pass.
  pub retry_backoff: Duration,
  /// Cap for the doubling retry delay.
  pub max_backoff: Duration,
  /// Background drain period regardless of other triggers.
  pub safety_net_interval: Option<Duration>,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      max_retries: 3,
      drain_debounce: Duration::from_millis(250),
      request_timeout: Duration::from_secs(15),
      retry_backoff: Duration::from_secs(1),
      max_backoff: Duration::from_secs(60),
      safety_net_interval: Some(Duration::from_secs(60)),
    }
  }
}

type SharedPass = Shared<BoxFuture<'static, DrainReport>>;

struct QueueState {
  items: VecDeque<QueueItem>,
  last_sync_at: Option<DateTime<Utc>>,
  /// Consecutive passes that ended on a failed attempt
  failed_passes: u32,
}

struct Inner {
  options: SyncOptions,
  registry: ActionRegistry,
  connectivity: ConnectivityMonitor,
  store: Arc<dyn PersistentStore>,
  clock: Arc<dyn Clock>,
  state: Mutex<QueueState>,
  events: broadcast::Sender<SyncEvent>,
  trackers: Mutex<HashMap<String, oneshot::Sender<ItemOutcome>>>,
  /// The pass currently running, if any
  running: Mutex<Option<SharedPass>>,
  drain_scheduled: AtomicBool,
}

/// Builder for [`SyncQueue`].
pub struct SyncQueueBuilder {
  registry: ActionRegistry,
  options: SyncOptions,
  connectivity: Option<ConnectivityMonitor>,
  store: Option<Arc<dyn PersistentStore>>,
  clock: Arc<dyn Clock>,
}

impl SyncQueueBuilder {
  pub fn options(mut self, options: SyncOptions) -> Self {
    self.options = options;
    self
  }

  pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Build the queue, reloading any persisted items.
  pub fn build(self) -> SyncQueue {
    let store = self
      .store
      .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn PersistentStore>);

    let items: VecDeque<QueueItem> = store
      .get::<Vec<QueueItem>>(&queue_key())
      .unwrap_or_default()
      .into();
    if !items.is_empty() {
      info!(pending = items.len(), "restored sync queue");
    }

    let (events, _) = broadcast::channel(256);

    SyncQueue {
      inner: Arc::new(Inner {
        options: self.options,
        registry: self.registry,
        connectivity: self.connectivity.unwrap_or_default(),
        store,
        clock: self.clock,
        state: Mutex::new(QueueState {
          items,
          last_sync_at: None,
          failed_passes: 0,
        }),
        events,
        trackers: Mutex::new(HashMap::new()),
        running: Mutex::new(None),
        drain_scheduled: AtomicBool::new(false),
      }),
    }
  }
}

/// Ordered, persisted queue of pending remote writes. Cheap to clone.
#[derive(Clone)]
pub struct SyncQueue {
  inner: Arc<Inner>,
}

impl SyncQueue {
  pub fn builder(registry: ActionRegistry) -> SyncQueueBuilder {
    SyncQueueBuilder {
      registry,
      options: SyncOptions::default(),
      connectivity: None,
      store: None,
      clock: Arc::new(SystemClock),
    }
  }

  /// Queue a write and return its id.
  ///
  /// The item is persisted before this returns. When online, a drain is
  /// scheduled in the background; the caller never waits for the network.
  pub fn enqueue(&self, action: impl Into<String>, payload: Value) -> String {
    let item = QueueItem::new(action, payload, self.inner.clock.now());
    let id = item.id.clone();
    self.inner.push(item);
    self.kick();
    id
  }

  /// Like [`enqueue`](Self::enqueue), also returning a receiver that yields
  /// the item's final outcome.
  ///
  /// Outcomes are only tracked for this process; items reloaded after a
  /// restart report through [`SyncEvent`]s alone.
  pub fn enqueue_tracked(
    &self,
    action: impl Into<String>,
    payload: Value,
  ) -> (String, oneshot::Receiver<ItemOutcome>) {
    let item = QueueItem::new(action, payload, self.inner.clock.now());
    let id = item.id.clone();

    let (tx, rx) = oneshot::channel();
    self.inner.lock_trackers().insert(id.clone(), tx);

    self.inner.push(item);
    self.kick();
    (id, rx)
  }

  /// Process queued items in order until the queue is empty, the monitor
  /// reports offline, or an attempt fails.
  ///
  /// Calling this while a pass is running joins that pass instead of starting
  /// another one.
  pub async fn drain(&self) -> DrainReport {
    let pass = {
      let mut running = self.inner.lock_running();
      match running.as_ref() {
        Some(pass) => {
          debug!("drain already running, joining it");
          pass.clone()
        }
        None => {
          let inner = Arc::clone(&self.inner);
          let task = tokio::spawn(async move {
            let _guard = PassGuard {
              inner: Arc::clone(&inner),
            };
            inner.run_pass().await
          });
          let inner = Arc::clone(&self.inner);
          let pass: SharedPass = async move {
            match task.await {
              Ok(report) => report,
              Err(e) => {
                error!(error = %e, "drain pass aborted");
                DrainReport {
                  remaining: inner.lock_state().items.len(),
                  ..DrainReport::default()
                }
              }
            }
          }
          .boxed()
          .shared();
          *running = Some(pass.clone());
          pass
        }
      }
    };
    pass.await
  }

  pub fn status(&self) -> QueueStatus {
    self.inner.status()
  }

  /// Snapshot of the queued items in order.
  pub fn items(&self) -> Vec<QueueItem> {
    self.inner.lock_state().items.iter().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.lock_state().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.inner.events.subscribe()
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.inner.connectivity
  }

  pub fn options(&self) -> &SyncOptions {
    &self.inner.options
  }

  /// Delay before the background worker retries after failed passes.
  pub fn backoff_delay(&self) -> Duration {
    let failed_passes = self.inner.lock_state().failed_passes;
    backoff_for(&self.inner.options, failed_passes)
  }

  /// Schedule a debounced drain if online and a runtime is available.
  fn kick(&self) {
    if !self.inner.connectivity.is_online() {
      debug!("offline, item stays queued");
      return;
    }
    if self.inner.drain_scheduled.swap(true, Ordering::SeqCst) {
      return;
    }

    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      self.inner.drain_scheduled.store(false, Ordering::SeqCst);
      debug!("no runtime, drain deferred to the next trigger");
      return;
    };

    let queue = self.clone();
    let delay = self.inner.options.drain_debounce;
    runtime.spawn(async move {
      tokio::time::sleep(delay).await;
      queue.inner.drain_scheduled.store(false, Ordering::SeqCst);
      queue.drain().await;
    });
  }
}

impl std::fmt::Debug for SyncQueue {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SyncQueue")
      .field("status", &self.status())
      .field("registry", &self.inner.registry)
      .finish_non_exhaustive()
  }
}

/// Exponential delay: `retry_backoff * 2^(failed_passes - 1)`, capped.
fn backoff_for(options: &SyncOptions, failed_passes: u32) -> Duration {
  if failed_passes == 0 {
    return Duration::ZERO;
  }
  let factor = 1u32 << (failed_passes - 1).min(16);
  options
    .retry_backoff
    .saturating_mul(factor)
    .min(options.max_backoff)
}

/// Ends a pass even when it unwinds: releases the running slot and returns
/// an item left mid-send to Pending.
struct PassGuard {
  inner: Arc<Inner>,
}

impl Drop for PassGuard {
  fn drop(&mut self) {
    {
      let mut state = self.inner.lock_state();
      for item in state.items.iter_mut() {
        item.state = ItemState::Pending;
      }
    }
    *self.inner.lock_running() = None;
    self.inner.emit(SyncEvent::StatusChanged(self.inner.status()));
  }
}

enum FailureOutcome {
  Retry,
  Abandoned,
}

impl Inner {
  fn lock_state(&self) -> MutexGuard<'_, QueueState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_trackers(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<ItemOutcome>>> {
    self.trackers.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn lock_running(&self) -> MutexGuard<'_, Option<SharedPass>> {
    self.running.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine.
    let _ = self.events.send(event);
  }

  fn status(&self) -> QueueStatus {
    let state = self.lock_state();
    QueueStatus {
      pending: state.items.len(),
      last_sync_at: state.last_sync_at,
      draining: self.lock_running().is_some(),
    }
  }

  /// Write the queue while holding the state lock so snapshots land in order.
  fn persist(&self, state: &QueueState) {
    let items: Vec<&QueueItem> = state.items.iter().collect();
    self.store.set(&queue_key(), &items);
  }

  fn push(&self, item: QueueItem) {
    let (id, action) = (item.id.clone(), item.action.clone());
    {
      let mut state = self.lock_state();
      state.items.push_back(item);
      self.persist(&state);
    }
    debug!(%id, %action, "enqueued");
    self.emit(SyncEvent::Enqueued { id, action });
    self.emit(SyncEvent::StatusChanged(self.status()));
  }

  fn settle(&self, id: &str, outcome: ItemOutcome) {
    if let Some(tx) = self.lock_trackers().remove(id) {
      let _ = tx.send(outcome);
    }
  }

  async fn run_pass(&self) -> DrainReport {
    let mut report = DrainReport::default();

    loop {
      if !self.connectivity.is_online() {
        debug!("offline, stopping drain");
        report.went_offline = true;
        break;
      }

      let item = {
        let mut state = self.lock_state();
        let Some(front) = state.items.front_mut() else {
          break;
        };
        front.state = ItemState::Sending;
        front.clone()
      };

      let Some(operation) = self.registry.get(&item.action) else {
        warn!(id = %item.id, action = %item.action, "no executor for action, abandoning");
        self.abandon(&item, AbandonReason::UnknownAction(item.action.clone()));
        report.abandoned += 1;
        continue;
      };

      debug!(id = %item.id, action = %item.action, attempt = item.retry_count + 1, "sending");
      let timeout = self.options.request_timeout;
      let result = match tokio::time::timeout(timeout, operation.execute(item.payload.clone())).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
      };

      match result {
        Ok(()) => {
          self.complete(&item);
          report.synced += 1;
        }
        Err(error) => match self.record_failure(&item, &error) {
          FailureOutcome::Retry => {
            report.failed += 1;
            break;
          }
          FailureOutcome::Abandoned => {
            report.abandoned += 1;
          }
        },
      }
    }

    {
      let mut state = self.lock_state();
      report.remaining = state.items.len();
      if report.failed > 0 {
        state.failed_passes = state.failed_passes.saturating_add(1);
      } else if !report.went_offline {
        state.failed_passes = 0;
      }
    }

    if report.synced + report.failed + report.abandoned > 0 {
      info!(
        synced = report.synced,
        failed = report.failed,
        abandoned = report.abandoned,
        remaining = report.remaining,
        "drain pass finished"
      );
    }
    report
  }

  fn complete(&self, item: &QueueItem) {
    {
      let mut state = self.lock_state();
      state.items.retain(|i| i.id != item.id);
      state.last_sync_at = Some(self.clock.now());
      self.persist(&state);
    }
    debug!(id = %item.id, action = %item.action, "synced");
    self.emit(SyncEvent::Synced {
      id: item.id.clone(),
      action: item.action.clone(),
    });
    self.settle(&item.id, ItemOutcome::Synced);
  }

  fn record_failure(&self, item: &QueueItem, error: &RemoteError) -> FailureOutcome {
    let attempts = {
      let mut state = self.lock_state();
      let Some(queued) = state.items.iter_mut().find(|i| i.id == item.id) else {
        // Removed while sending; nothing left to account for.
        return FailureOutcome::Abandoned;
      };
      queued.retry_count += 1;
      queued.state = ItemState::Pending;
      let attempts = queued.retry_count;
      if attempts < self.options.max_retries {
        self.persist(&state);
      }
      attempts
    };

    if attempts >= self.options.max_retries {
      self.abandon(
        item,
        AbandonReason::Exhausted {
          attempts,
          last_error: error.to_string(),
        },
      );
      return FailureOutcome::Abandoned;
    }

    warn!(id = %item.id, action = %item.action, attempts, %error, "attempt failed, will retry");
    self.emit(SyncEvent::Retrying {
      id: item.id.clone(),
      action: item.action.clone(),
      attempts,
      error: error.to_string(),
    });
    FailureOutcome::Retry
  }

  fn abandon(&self, item: &QueueItem, reason: AbandonReason) {
    let removed = {
      let mut state = self.lock_state();
      let before = state.items.len();
      state.items.retain(|i| i.id != item.id);
      let removed = state.items.len() != before;
      if removed {
        self.persist(&state);
      }
      removed
    };
    if !removed {
      return;
    }

    warn!(id = %item.id, action = %item.action, %reason, "abandoned queued write");
    self.emit(SyncEvent::Abandoned {
      id: item.id.clone(),
      action: item.action.clone(),
      reason: reason.clone(),
    });
    self.settle(&item.id, ItemOutcome::Abandoned(reason));
  }
}
