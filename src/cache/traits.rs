//! Core types for the request cache.

use chrono::{DateTime, Utc};
use reqwest::Method;
use sha2::{Digest, Sha256};
use url::Url;

/// An outgoing request as seen by the interception policy.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Only GET is eligible for interception; everything else mutates.
  pub fn is_safe(&self) -> bool {
    self.method == Method::GET
  }

  /// Cache key for this request. The fragment never reaches the server, so it
  /// is not part of the key.
  pub fn identity(&self) -> RequestIdentity {
    let mut url = self.url.clone();
    url.set_fragment(None);
    RequestIdentity {
      method: self.method.as_str().to_string(),
      url: url.to_string(),
    }
  }
}

/// The (method, absolute URL) pair used as the cache lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
  pub method: String,
  pub url: String,
}

impl RequestIdentity {
  /// Stable, fixed-length key for storage.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A fully buffered response.
///
/// The body is read from the wire exactly once. Cloning the snapshot yields
/// an independent copy, so one value can go back to the caller while another
/// is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSnapshot {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl ResponseSnapshot {
  pub fn new(status: u16, headers: Vec<(String, String)>, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  /// Build a JSON response with status 200.
  pub fn json(value: &serde_json::Value) -> Self {
    Self {
      status: 200,
      headers: vec![("Content-Type".to_string(), "application/json".to_string())],
      body: value.to_string().into_bytes(),
    }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// A named, version-suffixed partition of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
  name: String,
}

impl Namespace {
  pub(crate) fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// A stored entry together with when it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub identity: RequestIdentity,
  pub response: ResponseSnapshot,
  pub stored_at: DateTime<Utc>,
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Request was not intercepted and went to the network untouched
  Passthrough,
  /// Live response from the network
  Network,
  /// Network failed, served a stored snapshot
  Offline,
  /// Network failed and nothing was stored, served a generated error payload
  Synthesized,
}

/// A response produced by the policy, with its provenance.
#[derive(Debug, Clone)]
pub struct Interception {
  pub response: ResponseSnapshot,
  pub source: CacheSource,
}

impl Interception {
  pub fn from_network(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Network,
    }
  }

  pub fn offline(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Offline,
    }
  }

  pub fn synthesized(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Synthesized,
    }
  }

  pub fn passthrough(response: ResponseSnapshot) -> Self {
    Self {
      response,
      source: CacheSource::Passthrough,
    }
  }
}

/// What the policy decided to do with a request.
#[derive(Debug, Clone)]
pub enum Decision {
  /// Leave the request alone; the caller forwards it as-is.
  Bypass,
  /// The policy produced a response.
  Respond(Interception),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_identity_hash_is_stable_and_method_sensitive() {
    let url = Url::parse("http://localhost:8080/odata/tasks").unwrap();
    let get = Request::get(url.clone()).identity();
    let head = Request::new(Method::HEAD, url).identity();

    assert_eq!(get.cache_hash(), get.clone().cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
    assert_ne!(get.cache_hash(), head.cache_hash());
  }

  #[test]
  fn test_identity_ignores_fragment() {
    let plain = Request::get(Url::parse("http://localhost:8080/odata/tasks?day=1").unwrap());
    let anchored = Request::get(Url::parse("http://localhost:8080/odata/tasks?day=1#top").unwrap());

    assert_eq!(plain.identity(), anchored.identity());
    assert_eq!(
      anchored.identity().url,
      "http://localhost:8080/odata/tasks?day=1"
    );
  }

  #[test]
  fn test_only_get_is_safe() {
    let url = Url::parse("http://localhost:8080/").unwrap();
    assert!(Request::get(url.clone()).is_safe());
    assert!(!Request::new(Method::POST, url.clone()).is_safe());
    assert!(!Request::new(Method::DELETE, url).is_safe());
  }

  #[test]
  fn test_json_snapshot_has_content_type() {
    let snapshot = ResponseSnapshot::json(&serde_json::json!({"ok": true}));
    assert_eq!(snapshot.header("content-type"), Some("application/json"));
    assert!(snapshot.is_success());
  }
}
