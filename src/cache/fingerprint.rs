//! Deterministic cache keys for read requests.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Build a fingerprint of the form `namespace:<sha256 hex>`.
///
/// Parameters are hashed through their JSON form. `serde_json` maps keep keys
/// sorted, so two structurally equal requests hash the same regardless of
/// field insertion order. The readable namespace prefix is what
/// `invalidate_prefix` matches on.
pub fn fingerprint<P: Serialize + ?Sized>(namespace: &str, params: &P) -> String {
  let canonical = serde_json::to_value(params)
    .map(|v| v.to_string())
    .unwrap_or_default();
  format!("{}:{}", namespace, sha256_hex(&canonical))
}

fn sha256_hex(input: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Read requests issued by the coaching client.
#[derive(Clone, Debug)]
pub enum CoachQuery {
  /// Free-text food search
  FoodSearch { query: String },
  /// A single food record
  Food { id: String },
  /// A client's workout plan for one week
  WorkoutPlan { client_id: String, week: u32 },
  /// AI-generated text for a prompt
  AiGenerate { model: String, prompt: String },
}

impl CoachQuery {
  /// Namespace used for the key prefix and for per-namespace TTLs.
  pub fn namespace(&self) -> &'static str {
    match self {
      Self::FoodSearch { .. } | Self::Food { .. } => "food",
      Self::WorkoutPlan { .. } => "plan",
      Self::AiGenerate { .. } => "ai",
    }
  }

  /// Key under which the response is cached.
  ///
  /// Plans carry the client id in clear (`plan:<client_id>:<hash>`) so that
  /// every week of one client can be dropped with a single prefix.
  pub fn cache_key(&self) -> String {
    match self {
      Self::FoodSearch { query } => fingerprint("food", &format!("search:{}", normalize(query))),
      Self::Food { id } => fingerprint("food", &format!("id:{}", id)),
      Self::WorkoutPlan { client_id, week } => {
        fingerprint(&format!("plan:{}", client_id), week)
      }
      Self::AiGenerate { model, prompt } => {
        fingerprint("ai", &format!("{}:{}", model, normalize(prompt)))
      }
    }
  }

  /// Prefix shared by every cached plan of `client_id`.
  pub fn client_plan_prefix(client_id: &str) -> String {
    format!("plan:{}:", client_id)
  }

  pub fn description(&self) -> String {
    match self {
      Self::FoodSearch { query } => format!("food search: {}", query),
      Self::Food { id } => format!("food {}", id),
      Self::WorkoutPlan { client_id, week } => format!("plan for {} week {}", client_id, week),
      Self::AiGenerate { model, .. } => format!("ai generation ({})", model),
    }
  }
}

/// Trim and lowercase so trivially different inputs share a key.
fn normalize(text: &str) -> String {
  text.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_fingerprint_ignores_field_order() {
    let a = fingerprint("food", &json!({"q": "oats", "limit": 10}));
    let b = fingerprint("food", &json!({"limit": 10, "q": "oats"}));
    assert_eq!(a, b);
    assert!(a.starts_with("food:"));
    assert_eq!(a.len(), "food:".len() + 64);
  }

  #[test]
  fn test_fingerprint_distinguishes_params() {
    let a = fingerprint("food", &json!({"q": "oats"}));
    let b = fingerprint("food", &json!({"q": "rice"}));
    assert_ne!(a, b);
  }

  #[test]
  fn test_query_keys_normalize_text() {
    let a = CoachQuery::FoodSearch {
      query: "  Greek Yogurt ".to_string(),
    };
    let b = CoachQuery::FoodSearch {
      query: "greek yogurt".to_string(),
    };
    assert_eq!(a.cache_key(), b.cache_key());
  }

  #[test]
  fn test_query_namespaces() {
    let plan = CoachQuery::WorkoutPlan {
      client_id: "c1".to_string(),
      week: 3,
    };
    assert!(plan.cache_key().starts_with("plan:c1:"));
    assert_eq!(plan.cache_key().len(), "plan:c1:".len() + 64);
    assert_eq!(plan.description(), "plan for c1 week 3");

    let ai = CoachQuery::AiGenerate {
      model: "coach-small".to_string(),
      prompt: "Meal ideas".to_string(),
    };
    assert!(ai.cache_key().starts_with("ai:"));
  }

  #[test]
  fn test_plan_keys_group_by_client() {
    let plan = |client: &str, week| CoachQuery::WorkoutPlan {
      client_id: client.to_string(),
      week,
    };
    let prefix = CoachQuery::client_plan_prefix("c1");

    assert!(plan("c1", 1).cache_key().starts_with(&prefix));
    assert!(plan("c1", 2).cache_key().starts_with(&prefix));
    assert_ne!(plan("c1", 1).cache_key(), plan("c1", 2).cache_key());
    assert!(!plan("c2", 1).cache_key().starts_with(&prefix));
    // "c1" must not swallow "c10"
    assert!(!plan("c10", 1).cache_key().starts_with(&prefix));
  }

  #[tokio::test]
  async fn test_client_prefix_invalidates_only_that_client() {
    use crate::cache::TtlCache;
    use crate::error::RemoteError;
    use std::time::Duration;

    let cache: TtlCache<String> = TtlCache::new("plan");
    let ttl = Duration::from_secs(60);
    let queries = [("c1", 1), ("c1", 2), ("c2", 1)].map(|(client, week)| CoachQuery::WorkoutPlan {
      client_id: client.to_string(),
      week,
    });
    for query in &queries {
      let value = query.description();
      cache
        .resolve(&query.cache_key(), ttl, move || async move { Ok::<_, RemoteError>(value) })
        .await
        .unwrap();
    }

    assert_eq!(cache.invalidate_prefix(&CoachQuery::client_plan_prefix("c1")), 2);
    assert_eq!(cache.peek(&queries[0].cache_key()), None);
    assert_eq!(cache.peek(&queries[1].cache_key()), None);
    assert_eq!(cache.peek(&queries[2].cache_key()), Some("plan for c2 week 1".to_string()));
  }
}
