//! Remote store executors and the action dispatch table.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::RemoteError;

/// Action tags used by the coaching client.
pub mod actions {
  pub const CREATE_RECORD: &str = "create-record";
  pub const UPDATE_RECORD: &str = "update-record";
  pub const DELETE_RECORD: &str = "delete-record";
  pub const AI_GENERATE: &str = "ai-generate";
}

/// One remote write capability. The queue does not care whether it is a
/// database insert, an HTTP call or an AI request.
pub trait RemoteOperation: Send + Sync {
  fn execute(&self, payload: Value) -> BoxFuture<'static, Result<(), RemoteError>>;
}

impl<F, Fut> RemoteOperation for F
where
  F: Fn(Value) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), RemoteError>> + Send + 'static,
{
  fn execute(&self, payload: Value) -> BoxFuture<'static, Result<(), RemoteError>> {
    Box::pin(self(payload))
  }
}

/// Lookup table from action tag to remote operation.
#[derive(Clone, Default)]
pub struct ActionRegistry {
  operations: HashMap<String, Arc<dyn RemoteOperation>>,
}

impl ActionRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register (or replace) the operation for `action`.
  pub fn register<O>(&mut self, action: impl Into<String>, operation: O) -> &mut Self
  where
    O: RemoteOperation + 'static,
  {
    self.operations.insert(action.into(), Arc::new(operation));
    self
  }

  /// Builder-style [`register`](Self::register).
  pub fn with<O>(mut self, action: impl Into<String>, operation: O) -> Self
  where
    O: RemoteOperation + 'static,
  {
    self.register(action, operation);
    self
  }

  pub fn get(&self, action: &str) -> Option<Arc<dyn RemoteOperation>> {
    self.operations.get(action).cloned()
  }

  pub fn contains(&self, action: &str) -> bool {
    self.operations.contains_key(action)
  }

  /// Registered tags, sorted.
  pub fn actions(&self) -> Vec<&str> {
    let mut actions: Vec<&str> = self.operations.keys().map(String::as_str).collect();
    actions.sort_unstable();
    actions
  }
}

impl std::fmt::Debug for ActionRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ActionRegistry")
      .field("actions", &self.actions())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_closures_are_operations() {
    let registry = ActionRegistry::new()
      .with(actions::CREATE_RECORD, |_payload: Value| async { Ok::<(), RemoteError>(()) })
      .with(actions::AI_GENERATE, |payload: Value| async move {
        Err::<(), _>(RemoteError::Network(format!("offline: {}", payload["prompt"])))
      });

    assert_eq!(registry.actions(), vec!["ai-generate", "create-record"]);
    assert!(!registry.contains("unknown"));

    let create = registry.get(actions::CREATE_RECORD).unwrap();
    assert!(create.execute(json!({})).await.is_ok());

    let ai = registry.get(actions::AI_GENERATE).unwrap();
    let err = ai.execute(json!({"prompt": "x"})).await.unwrap_err();
    assert!(matches!(err, RemoteError::Network(_)));
  }
}
