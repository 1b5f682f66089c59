//! Time source used for queue timestamps and cache expiry.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of "now" for everything that stamps or expires data.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Manually advanced clock for tests and replays.
///
/// Clones share the same underlying instant, so a test can hold one handle
/// while the cache or queue holds another.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  /// Start at the Unix epoch, which makes "t = N ms" arithmetic in tests exact.
  pub fn new() -> Self {
    Self::starting_at(DateTime::<Utc>::default())
  }

  pub fn starting_at(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now = *now + by;
  }

  pub fn advance_ms(&self, ms: i64) {
    self.advance(Duration::milliseconds(ms));
  }

  pub fn set(&self, to: DateTime<Utc>) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}
