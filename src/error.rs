//! Error taxonomy for the data layer.
//!
//! Remote failures are transient and retried by the queue. Abandonment is the
//! permanent outcome of an item. Persistence failures are logged where they
//! happen and never reach callers of `enqueue` or `resolve`.

use std::sync::Arc;
use std::time::Duration;

/// Failure of a single remote write attempt. Always counted against the
/// item's retry budget.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
  /// Network-level failure (connect, reset, DNS).
  #[error("network error: {0}")]
  Network(String),

  /// The remote answered with a non-success status.
  #[error("remote returned status {status}: {body}")]
  Status { status: u16, body: String },

  /// The attempt did not finish within the request timeout.
  #[error("timed out after {0:?}")]
  Timeout(Duration),

  /// The payload could not be turned into a request.
  #[error("invalid payload: {0}")]
  InvalidPayload(String),
}

impl RemoteError {
  pub fn network(err: impl std::fmt::Display) -> Self {
    Self::Network(err.to_string())
  }
}

/// Why a queue item was removed without succeeding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbandonReason {
  /// No executor is registered for the action tag.
  #[error("unknown action '{0}'")]
  UnknownAction(String),

  /// The item failed on every allowed attempt.
  #[error("gave up after {attempts} attempts: {last_error}")]
  Exhausted { attempts: u32, last_error: String },
}

/// Failure of a cached read. Cloneable because every waiter on a shared
/// in-flight fetch receives the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  #[error("fetch failed: {0}")]
  Failed(Arc<str>),

  #[error("fetch timed out after {0:?}")]
  Timeout(Duration),

  #[error("fetch cancelled")]
  Cancelled,
}

impl FetchError {
  pub fn failed(err: impl std::fmt::Display) -> Self {
    Self::Failed(Arc::from(err.to_string()))
  }
}

impl From<RemoteError> for FetchError {
  fn from(err: RemoteError) -> Self {
    match err {
      RemoteError::Timeout(after) => Self::Timeout(after),
      other => Self::failed(other),
    }
  }
}

impl From<color_eyre::Report> for FetchError {
  fn from(err: color_eyre::Report) -> Self {
    Self::failed(err)
  }
}

/// Failure of the durable key-value medium.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
  #[error("storage error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("quota exceeded: {needed} bytes needed, {limit} allowed")]
  QuotaExceeded { needed: usize, limit: usize },

  #[error("storage unavailable: {0}")]
  Unavailable(String),
}

pub type PersistResult<T> = Result<T, PersistError>;
