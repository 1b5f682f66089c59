//! Background driver that drains the queue without explicit calls.
//!
//! A drain is started when:
//! - the worker starts (items restored from a previous run)
//! - connectivity goes from offline to online
//! - the safety-net interval ticks while online
//! - the retry backoff after a failed pass runs out

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::queue::SyncQueue;

/// Handle to the running worker. Dropping it stops the worker.
pub struct BackgroundSync {
  shutdown: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl BackgroundSync {
  /// Stop the worker and wait for any pass it is driving to finish.
  pub async fn shutdown(mut self) {
    if let Some(tx) = self.shutdown.take() {
      let _ = tx.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }

  pub fn is_finished(&self) -> bool {
    self.handle.as_ref().map_or(true, JoinHandle::is_finished)
  }
}

impl Drop for BackgroundSync {
  fn drop(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

impl SyncQueue {
  /// Spawn the background worker for this queue.
  pub fn start(&self) -> BackgroundSync {
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(run(self.clone(), rx));
    BackgroundSync {
      shutdown: Some(tx),
      handle: Some(handle),
    }
  }
}

async fn run(queue: SyncQueue, mut shutdown: oneshot::Receiver<()>) {
  let mut connectivity = queue.connectivity().subscribe();
  let mut safety_net = queue.options().safety_net_interval.map(|period| {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
  });

  info!("background sync started");
  if queue.connectivity().is_online() {
    queue.drain().await;
  }

  loop {
    let backoff = queue.backoff_delay();
    let retry_pending =
      backoff > Duration::ZERO && !queue.is_empty() && queue.connectivity().is_online();

    tokio::select! {
      _ = &mut shutdown => break,
      changed = connectivity.changed() => {
        if changed.is_err() {
          break;
        }
        let online = connectivity.borrow_and_update().online;
        if online {
          debug!("back online, draining");
          queue.drain().await;
        }
      }
      _ = tick(&mut safety_net) => {
        if queue.connectivity().is_online() && !queue.is_empty() {
          debug!("safety-net drain");
          queue.drain().await;
        }
      }
      _ = tokio::time::sleep(backoff), if retry_pending => {
        debug!(?backoff, "retrying after backoff");
        queue.drain().await;
      }
    }
  }
  info!("background sync stopped");
}

async fn tick(interval: &mut Option<Interval>) {
  match interval {
    Some(interval) => {
      interval.tick().await;
    }
    None => std::future::pending().await,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ConnectivityMonitor;
  use crate::error::RemoteError;
  use crate::sync::executor::{actions, ActionRegistry};
  use crate::sync::queue::SyncOptions;
  use serde_json::{json, Value};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  fn counting_registry(calls: &Arc<AtomicUsize>, fail_first: usize) -> ActionRegistry {
    let calls = Arc::clone(calls);
    ActionRegistry::new().with(actions::CREATE_RECORD, move |_payload: Value| {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      async move {
        if n < fail_first {
          Err(RemoteError::Network("unreachable".to_string()))
        } else {
          Ok::<(), RemoteError>(())
        }
      }
    })
  }

  #[tokio::test(start_paused = true)]
  async fn test_reconnect_drains_queue() {
    let calls = Arc::new(AtomicUsize::new(0));
    let connectivity = ConnectivityMonitor::with_initial(false);
    let queue = SyncQueue::builder(counting_registry(&calls, 0))
      .connectivity(connectivity.clone())
      .options(SyncOptions {
        safety_net_interval: None,
        ..SyncOptions::default()
      })
      .build();
    let worker = queue.start();

    queue.enqueue(actions::CREATE_RECORD, json!({"n": 1}));
    queue.enqueue(actions::CREATE_RECORD, json!({"n": 2}));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.len(), 2);

    connectivity.set_online(true);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(queue.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    worker.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_pass_retried_after_backoff() {
    let calls = Arc::new(AtomicUsize::new(0));
    let connectivity = ConnectivityMonitor::with_initial(false);
    let queue = SyncQueue::builder(counting_registry(&calls, 1))
      .connectivity(connectivity.clone())
      .options(SyncOptions {
        retry_backoff: Duration::from_secs(2),
        safety_net_interval: None,
        ..SyncOptions::default()
      })
      .build();
    queue.enqueue(actions::CREATE_RECORD, json!({}));
    connectivity.set_online(true);

    let worker = queue.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.items()[0].retry_count, 1);
    assert_eq!(queue.backoff_delay(), Duration::from_secs(2));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
    assert_eq!(queue.backoff_delay(), Duration::ZERO);
    worker.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn test_safety_net_drains_periodically() {
    let calls = Arc::new(AtomicUsize::new(0));
    let connectivity = ConnectivityMonitor::with_initial(false);
    let queue = SyncQueue::builder(counting_registry(&calls, 1))
      .connectivity(connectivity.clone())
      .options(SyncOptions {
        retry_backoff: Duration::from_secs(3600),
        max_backoff: Duration::from_secs(3600),
        safety_net_interval: Some(Duration::from_secs(30)),
        ..SyncOptions::default()
      })
      .build();
    queue.enqueue(actions::CREATE_RECORD, json!({}));
    connectivity.set_online(true);

    let worker = queue.start();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());

    worker.shutdown().await;
  }

  #[tokio::test]
  async fn test_drop_stops_worker() {
    let queue = SyncQueue::builder(ActionRegistry::new()).build();
    let worker = queue.start();
    assert!(!worker.is_finished());
    drop(worker);
  }
}
