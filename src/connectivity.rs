//! Online/offline tracking with change notifications.
//!
//! The platform (or the host application) reports link changes through
//! [`ConnectivityMonitor::set_online`]. An optional [`ConnectivityProbe`]
//! periodically checks real reachability and corrects the state when the OS
//! reports a link that cannot actually reach the remote.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Snapshot of connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub online: bool,
  /// Number of online/offline flips observed so far.
  pub transitions: u64,
}

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

struct Inner {
  state: watch::Sender<ConnectivityState>,
  listeners: Mutex<Vec<(u64, Listener)>>,
  next_listener_id: AtomicU64,
}

impl Inner {
  // A listener list is still usable after a panicking holder.
  fn lock_listeners(&self) -> MutexGuard<'_, Vec<(u64, Listener)>> {
    self.listeners.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Process-wide connectivity state, shared by cloning.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  /// Create a monitor that assumes it is online until told otherwise.
  pub fn new() -> Self {
    Self::with_initial(true)
  }

  pub fn with_initial(online: bool) -> Self {
    let (state, _) = watch::channel(ConnectivityState {
      online,
      transitions: 0,
    });

    Self {
      inner: Arc::new(Inner {
        state,
        listeners: Mutex::new(Vec::new()),
        next_listener_id: AtomicU64::new(0),
      }),
    }
  }

  pub fn is_online(&self) -> bool {
    self.inner.state.borrow().online
  }

  pub fn state(&self) -> ConnectivityState {
    *self.inner.state.borrow()
  }

  /// Record a platform online/offline signal.
  ///
  /// Returns `true` if the state actually changed. Repeated signals with the
  /// same value notify nobody.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.inner.state.send_if_modified(|state| {
      if state.online == online {
        return false;
      }
      state.online = online;
      state.transitions += 1;
      true
    });

    if changed {
      let state = self.state();
      info!(
        online = state.online,
        transitions = state.transitions,
        "connectivity changed"
      );
      self.notify(state);
    }

    changed
  }

  /// Register a listener called on every transition.
  ///
  /// The listener stays registered until the returned [`Subscription`] is
  /// dropped or explicitly unsubscribed.
  pub fn on_change<F>(&self, listener: F) -> Subscription
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
    self
      .inner
      .lock_listeners()
      .push((id, Arc::new(listener)));

    Subscription {
      id,
      inner: Arc::downgrade(&self.inner),
    }
  }

  /// Async view of the state, for tasks that `select!` on transitions.
  pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  /// Periodically run `probe` and feed its verdict into the monitor.
  pub fn spawn_probe<P>(&self, probe: P, interval: Duration) -> JoinHandle<()>
  where
    P: ConnectivityProbe + 'static,
  {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let reachable = probe.check().await;
        debug!(reachable, "connectivity probe");
        monitor.set_online(reachable);
      }
    })
  }

  fn notify(&self, state: ConnectivityState) {
    // Call listeners outside the lock so they may (un)subscribe.
    let listeners: Vec<Listener> = self
      .inner
      .lock_listeners()
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();

    for listener in listeners {
      listener(state);
    }
  }

  pub fn listener_count(&self) -> usize {
    self.inner.lock_listeners().len()
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for ConnectivityMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectivityMonitor")
      .field("state", &self.state())
      .field("listeners", &self.listener_count())
      .finish()
  }
}

/// Handle for a registered change listener.
#[must_use = "dropping a Subscription unregisters its listener"]
pub struct Subscription {
  id: u64,
  inner: Weak<Inner>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    // Drop does the work.
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.upgrade() {
      inner.lock_listeners().retain(|(id, _)| *id != self.id);
    }
  }
}

/// Active reachability check.
pub trait ConnectivityProbe: Send + Sync {
  /// Resolve to `true` when the remote is actually reachable.
  fn check(&self) -> BoxFuture<'_, bool>;
}

impl<F, Fut> ConnectivityProbe for F
where
  F: Fn() -> Fut + Send + Sync,
  Fut: Future<Output = bool> + Send + 'static,
{
  fn check(&self) -> BoxFuture<'_, bool> {
    Box::pin(self())
  }
}

/// Probe that treats any HTTP response from `url` as "reachable".
#[derive(Debug, Clone)]
pub struct HttpProbe {
  client: reqwest::Client,
  url: url::Url,
}

impl HttpProbe {
  pub fn new(url: url::Url, timeout: Duration) -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to build probe client: {}", e))?;
    Ok(Self { client, url })
  }
}

impl ConnectivityProbe for HttpProbe {
  fn check(&self) -> BoxFuture<'_, bool> {
    Box::pin(async move {
      match self.client.head(self.url.clone()).send().await {
        Ok(_) => true,
        Err(e) => {
          debug!(url = %self.url, error = %e, "probe failed");
          false
        }
      }
    })
  }
}
