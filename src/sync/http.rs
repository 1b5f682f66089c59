//! REST executor for queued writes.
//!
//! Each action tag maps to a [`Route`]. Path placeholders such as
//! `/rest/v1/meals?id=eq.{id}` are filled from top-level payload fields.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::executor::{ActionRegistry, RemoteOperation};
use crate::error::RemoteError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
  Post,
  Patch,
  Put,
  Delete,
}

impl HttpMethod {
  fn as_reqwest(self) -> reqwest::Method {
    match self {
      HttpMethod::Post => reqwest::Method::POST,
      HttpMethod::Patch => reqwest::Method::PATCH,
      HttpMethod::Put => reqwest::Method::PUT,
      HttpMethod::Delete => reqwest::Method::DELETE,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
  pub method: HttpMethod,
  /// Path relative to the base URL, with optional `{field}` placeholders
  pub path: String,
}

impl Route {
  pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
    }
  }
}

struct Endpoint {
  client: reqwest::Client,
  base_url: Url,
  api_key: Option<String>,
  timeout: Duration,
}

/// HTTP-backed remote store.
#[derive(Clone)]
pub struct HttpRemoteStore {
  endpoint: Arc<Endpoint>,
  routes: HashMap<String, Route>,
}

impl HttpRemoteStore {
  pub fn new(base_url: Url, api_key: Option<String>, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      endpoint: Arc::new(Endpoint {
        client,
        base_url,
        api_key,
        timeout,
      }),
      routes: HashMap::new(),
    })
  }

  pub fn route(mut self, action: impl Into<String>, route: Route) -> Self {
    self.routes.insert(action.into(), route);
    self
  }

  pub fn routes(&self) -> &HashMap<String, Route> {
    &self.routes
  }

  /// One registry entry per configured route.
  pub fn registry(&self) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    for (action, route) in &self.routes {
      registry.register(
        action.clone(),
        HttpOperation {
          endpoint: Arc::clone(&self.endpoint),
          route: route.clone(),
        },
      );
    }
    registry
  }
}

impl std::fmt::Debug for HttpRemoteStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HttpRemoteStore")
      .field("base_url", &self.endpoint.base_url.as_str())
      .field("routes", &self.routes)
      .finish()
  }
}

struct HttpOperation {
  endpoint: Arc<Endpoint>,
  route: Route,
}

impl RemoteOperation for HttpOperation {
  fn execute(&self, payload: Value) -> BoxFuture<'static, Result<(), RemoteError>> {
    let endpoint = Arc::clone(&self.endpoint);
    let route = self.route.clone();
    Box::pin(async move { send(&endpoint, &route, payload).await })
  }
}

async fn send(endpoint: &Endpoint, route: &Route, payload: Value) -> Result<(), RemoteError> {
  let path = expand_path(&route.path, &payload)?;
  let url = endpoint
    .base_url
    .join(&path)
    .map_err(|e| RemoteError::InvalidPayload(format!("bad path '{}': {}", path, e)))?;

  let mut request = endpoint.client.request(route.method.as_reqwest(), url.clone());
  if let Some(key) = &endpoint.api_key {
    request = request.header("apikey", key).bearer_auth(key);
  }
  if route.method != HttpMethod::Delete {
    request = request.json(&payload);
  }

  debug!(method = ?route.method, %url, "sending");
  let response = request.send().await.map_err(|e| {
    if e.is_timeout() {
      RemoteError::Timeout(endpoint.timeout)
    } else {
      RemoteError::network(e)
    }
  })?;

  let status = response.status();
  if status.is_success() {
    return Ok(());
  }

  let body = response.text().await.unwrap_or_default();
  Err(RemoteError::Status {
    status: status.as_u16(),
    body,
  })
}

/// Replace `{field}` placeholders with the payload's top-level values,
/// percent-encoded so a value stays inside its path segment or query value.
fn expand_path(template: &str, payload: &Value) -> Result<String, RemoteError> {
  let mut out = String::with_capacity(template.len());
  let mut rest = template;

  while let Some(start) = rest.find('{') {
    out.push_str(&rest[..start]);
    let after = &rest[start + 1..];
    let Some(end) = after.find('}') else {
      return Err(RemoteError::InvalidPayload(format!(
        "unclosed placeholder in '{}'",
        template
      )));
    };
    let field = &after[..end];
    let value = match payload.get(field) {
      Some(Value::String(s)) => s.clone(),
      Some(Value::Number(n)) => n.to_string(),
      Some(Value::Bool(b)) => b.to_string(),
      _ => {
        return Err(RemoteError::InvalidPayload(format!(
          "payload has no '{}' for path '{}'",
          field, template
        )))
      }
    };
    out.push_str(&encode_component(&value));
    rest = &after[end + 1..];
  }
  out.push_str(rest);
  Ok(out)
}

fn encode_component(value: &str) -> String {
  // byte_serialize writes spaces as '+' and escapes a literal '+', so every
  // remaining '+' is a space.
  url::form_urlencoded::byte_serialize(value.as_bytes())
    .collect::<String>()
    .replace('+', "%20")
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use wiremock::matchers::{body_json, header, method, path, query_param};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn store(server: &MockServer) -> HttpRemoteStore {
    let base = Url::parse(&server.uri()).unwrap();
    HttpRemoteStore::new(base, Some("anon-key".to_string()), Duration::from_secs(5))
      .unwrap()
      .route("create-record", Route::new(HttpMethod::Post, "/rest/v1/meals"))
      .route(
        "update-record",
        Route::new(HttpMethod::Patch, "/rest/v1/meals?id=eq.{id}"),
      )
      .route(
        "delete-record",
        Route::new(HttpMethod::Delete, "/rest/v1/meals/{id}"),
      )
  }

  #[test]
  fn test_expand_path() {
    let payload = json!({"id": 42, "client": "c-1"});
    assert_eq!(
      expand_path("/plans/{client}/{id}", &payload).unwrap(),
      "/plans/c-1/42"
    );
    assert_eq!(expand_path("/plain", &payload).unwrap(), "/plain");
    assert!(matches!(
      expand_path("/plans/{week}", &payload),
      Err(RemoteError::InvalidPayload(_))
    ));
    assert!(expand_path("/plans/{id", &payload).is_err());
  }

  #[test]
  fn test_placeholder_values_are_escaped() {
    let query = expand_path(
      "/rest/v1/meals?id=eq.{id}",
      &json!({"id": "7&select=secret"}),
    )
    .unwrap();
    assert_eq!(query, "/rest/v1/meals?id=eq.7%26select%3Dsecret");

    let path = expand_path("/rest/v1/meals/{id}", &json!({"id": "../admin"})).unwrap();
    assert_eq!(path, "/rest/v1/meals/..%2Fadmin");

    let spaced = expand_path("/foods/{name}", &json!({"name": "greek yogurt+"})).unwrap();
    assert_eq!(spaced, "/foods/greek%20yogurt%2B");

    let base = Url::parse("https://example.supabase.co/").unwrap();
    let joined = base.join(&path).unwrap();
    assert_eq!(joined.path(), "/rest/v1/meals/..%2Fadmin");
  }

  #[tokio::test]
  async fn test_post_sends_json_and_auth_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/rest/v1/meals"))
      .and(header("apikey", "anon-key"))
      .and(header("authorization", "Bearer anon-key"))
      .and(body_json(json!({"name": "oats", "kcal": 350})))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let registry = store(&server).registry();
    let op = registry.get("create-record").unwrap();
    op.execute(json!({"name": "oats", "kcal": 350})).await.unwrap();
  }

  #[tokio::test]
  async fn test_placeholders_fill_path() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
      .and(path("/rest/v1/meals"))
      .and(query_param("id", "eq.7"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;
    Mock::given(method("DELETE"))
      .and(path("/rest/v1/meals/7"))
      .respond_with(ResponseTemplate::new(204))
      .expect(1)
      .mount(&server)
      .await;

    let registry = store(&server).registry();
    registry
      .get("update-record")
      .unwrap()
      .execute(json!({"id": 7, "kcal": 400}))
      .await
      .unwrap();
    registry
      .get("delete-record")
      .unwrap()
      .execute(json!({"id": 7}))
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
      .mount(&server)
      .await;

    let registry = store(&server).registry();
    let err = registry
      .get("create-record")
      .unwrap()
      .execute(json!({}))
      .await
      .unwrap_err();

    match err {
      RemoteError::Status { status, body } => {
        assert_eq!(status, 503);
        assert_eq!(body, "maintenance");
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let base = Url::parse("http://127.0.0.1:9/").unwrap();
    let registry = HttpRemoteStore::new(base, None, Duration::from_secs(2))
      .unwrap()
      .route("create-record", Route::new(HttpMethod::Post, "/meals"))
      .registry();

    let err = registry
      .get("create-record")
      .unwrap()
      .execute(json!({}))
      .await
      .unwrap_err();
    assert!(matches!(err, RemoteError::Network(_) | RemoteError::Timeout(_)));
  }
}
