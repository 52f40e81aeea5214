//! Interception policy: network-first with cache fallback.
//!
//! Every outgoing request is routed through [`InterceptionPolicy::handle`]:
//!
//! 1. Cross-origin or non-GET requests are bypassed untouched
//! 2. Otherwise the network is tried first; API responses are written
//!    through to the API namespace without delaying the caller
//! 3. On network failure the store is consulted
//! 4. On a miss, API requests get a synthesized JSON error payload while
//!    other assets fail
//!
//! Install and activate are the lifecycle steps that fill the shell
//! namespace and evict namespaces from older versions.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{Decision, Interception, Request, RequestIdentity, ResponseSnapshot};
use crate::config::Config;
use crate::net::Transport;

/// Everything the policy needs to know, fixed at construction.
#[derive(Debug, Clone)]
pub struct PolicySettings {
  pub origin: Url,
  pub shell_namespace: String,
  pub api_namespace: String,
  pub manifest: Vec<String>,
  pub api_markers: Vec<String>,
  pub offline_message: String,
}

impl PolicySettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      origin: config.origin()?.clone(),
      shell_namespace: config.cache.shell_namespace(),
      api_namespace: config.cache.api_namespace(),
      manifest: config.cache.manifest.clone(),
      api_markers: config.cache.api_markers.clone(),
      offline_message: config.cache.offline_message.clone(),
    })
  }
}

/// Lifecycle of the runtime hosting the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  /// Nothing done yet
  Idle,
  /// Shell manifest is cached; waiting for activation
  Installed,
  /// Stale namespaces swept; requests are intercepted
  Active,
}

/// Per-request routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  Bypass,
  NetworkFirst,
}

pub struct InterceptionPolicy<S: CacheStorage, T: Transport> {
  storage: Arc<S>,
  transport: T,
  settings: PolicySettings,
  lifecycle: Mutex<Lifecycle>,
  /// Write-through puts still running on the blocking pool
  writes: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage + 'static, T: Transport> InterceptionPolicy<S, T> {
  pub fn new(storage: Arc<S>, transport: T, settings: PolicySettings) -> Self {
    Self {
      storage,
      transport,
      settings,
      lifecycle: Mutex::new(Lifecycle::Idle),
      writes: Mutex::new(JoinSet::new()),
    }
  }

  pub fn settings(&self) -> &PolicySettings {
    &self.settings
  }

  pub fn lifecycle(&self) -> Result<Lifecycle> {
    self
      .lifecycle
      .lock()
      .map(|state| *state)
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn set_lifecycle(&self, update: impl FnOnce(Lifecycle) -> Lifecycle) -> Result<()> {
    let mut state = self
      .lifecycle
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    *state = update(*state);
    Ok(())
  }

  /// Whether the URL path contains one of the API markers.
  pub fn is_api(&self, request: &Request) -> bool {
    let path = request.url.path();
    self
      .settings
      .api_markers
      .iter()
      .any(|marker| path.contains(marker.as_str()))
  }

  fn is_same_origin(&self, request: &Request) -> bool {
    request.url.origin() == self.settings.origin.origin()
  }

  /// Decide how a request is handled. Nothing is intercepted before activation.
  pub fn route(&self, request: &Request) -> Result<Route> {
    if self.lifecycle()? != Lifecycle::Active {
      return Ok(Route::Bypass);
    }
    if !self.is_same_origin(request) || !request.is_safe() {
      return Ok(Route::Bypass);
    }
    Ok(Route::NetworkFirst)
  }

  /// Run one request through the policy.
  ///
  /// Returns `Decision::Bypass` when the caller should forward the request
  /// itself. Returns an error only when the network and the store both fail
  /// for a non-API asset.
  pub async fn handle(&self, request: &Request) -> Result<Decision> {
    match self.route(request)? {
      Route::Bypass => {
        debug!(method = %request.method, url = %request.url, "bypass");
        Ok(Decision::Bypass)
      }
      Route::NetworkFirst => self.network_first(request).await.map(Decision::Respond),
    }
  }

  /// Like [`handle`](Self::handle), but bypassed requests are forwarded
  /// through the transport untouched.
  pub async fn fetch(&self, request: &Request) -> Result<Interception> {
    match self.handle(request).await? {
      Decision::Respond(interception) => Ok(interception),
      Decision::Bypass => {
        let response = self.transport.fetch(request).await?;
        Ok(Interception::passthrough(response))
      }
    }
  }

  async fn network_first(&self, request: &Request) -> Result<Interception> {
    let is_api = self.is_api(request);

    match self.transport.fetch(request).await {
      Ok(response) => {
        if is_api {
          // The persisted copy is its own buffer; the caller keeps the original
          if let Err(e) = self.write_through(request.identity(), response.clone()) {
            warn!(url = %request.url, error = %e, "skipping api cache write");
          }
        }
        Ok(Interception::from_network(response))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "network failed, falling back to cache");
        self.cache_fallback(request, is_api)
      }
    }
  }

  fn write_through(&self, identity: RequestIdentity, response: ResponseSnapshot) -> Result<()> {
    let storage = Arc::clone(&self.storage);
    let namespace = self.settings.api_namespace.clone();

    let mut writes = self
      .writes
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Reap finished writes so the set only holds in-flight ones
    while let Some(result) = writes.try_join_next() {
      if let Err(e) = result {
        warn!(error = %e, "cache write task failed");
      }
    }

    writes.spawn_blocking(move || {
      let result = storage
        .open(&namespace)
        .and_then(|ns| storage.put(&ns, &identity, &response));
      match result {
        Ok(()) => debug!(url = %identity.url, namespace = %namespace, "cached api response"),
        Err(e) => warn!(url = %identity.url, error = %e, "failed to cache api response"),
      }
    });

    Ok(())
  }

  fn cache_fallback(&self, request: &Request, is_api: bool) -> Result<Interception> {
    let identity = request.identity();

    let cached = match self.storage.match_request(&identity, None) {
      Ok(cached) => cached,
      Err(e) => {
        // Unreadable store counts as a miss
        warn!(url = %request.url, error = %e, "cache lookup failed");
        None
      }
    };

    if let Some(entry) = cached {
      info!(url = %entry.identity.url, stored_at = %entry.stored_at, "serving cached response");
      return Ok(Interception::offline(entry.response));
    }

    if is_api {
      info!(url = %request.url, "offline with no cached copy, synthesizing error payload");
      return Ok(Interception::synthesized(self.offline_response()));
    }

    Err(eyre!(
      "Network unavailable and no cached copy of {}",
      request.url
    ))
  }

  fn offline_response(&self) -> ResponseSnapshot {
    ResponseSnapshot::json(&serde_json::json!({
      "error": self.settings.offline_message,
      "cached": true,
    }))
  }

  #[cfg(test)]
  fn pending_writes(&self) -> usize {
    self.writes.lock().map(|w| w.len()).unwrap_or_default()
  }

  /// Wait for every pending write-through to finish.
  pub async fn flush(&self) -> Result<()> {
    let mut pending = {
      let mut writes = self
        .writes
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      std::mem::take(&mut *writes)
    };

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "cache write task failed");
      }
    }

    Ok(())
  }

  /// Fetch every manifest path and store them in the shell namespace.
  ///
  /// Fail-fast: if any resource is unreachable or not 2xx, nothing is stored.
  pub async fn install(&self) -> Result<usize> {
    info!(namespace = %self.settings.shell_namespace, "installing shell manifest");

    let requests = self
      .settings
      .manifest
      .iter()
      .map(|path| {
        self
          .settings
          .origin
          .join(path)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid manifest path '{}': {}", path, e))
      })
      .collect::<Result<Vec<_>>>()?;

    let responses = try_join_all(requests.iter().map(|request| async move {
      let response = self.transport.fetch(request).await?;
      if !response.is_success() {
        return Err(eyre!(
          "Manifest resource {} returned status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.identity(), response))
    }))
    .await
    .map_err(|e| eyre!("Install aborted: {}", e))?;

    let namespace = self.storage.open(&self.settings.shell_namespace)?;
    self.storage.put_all(&namespace, &responses)?;

    self.set_lifecycle(|state| match state {
      Lifecycle::Idle => Lifecycle::Installed,
      other => other,
    })?;

    info!(count = responses.len(), "shell manifest cached");
    Ok(responses.len())
  }

  /// Delete every namespace other than the two current ones, then start
  /// intercepting. Returns the names that were removed.
  pub fn activate(&self) -> Result<Vec<String>> {
    info!("activating");

    let current = [
      self.settings.shell_namespace.as_str(),
      self.settings.api_namespace.as_str(),
    ];

    let mut removed = Vec::new();
    for name in self.storage.namespace_names()? {
      if current.contains(&name.as_str()) {
        continue;
      }
      info!(namespace = %name, "deleting stale cache");
      self.storage.delete(&name)?;
      removed.push(name);
    }

    self.set_lifecycle(|_| Lifecycle::Active)?;
    Ok(removed)
  }
}
