//! Scripted transport for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cache::{Request, ResponseSnapshot};

use super::Transport;

/// Serves canned responses by URL. Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct FakeTransport {
  routes: Mutex<HashMap<String, ResponseSnapshot>>,
  offline: AtomicBool,
  calls: AtomicUsize,
}

impl FakeTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(self, url: &str, response: ResponseSnapshot) -> Self {
    self.set_route(url, response);
    self
  }

  pub fn set_route(&self, url: &str, response: ResponseSnapshot) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Transport for FakeTransport {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    self
      .routes
      .lock()
      .unwrap()
      .get(request.url.as_str())
      .cloned()
      .ok_or_else(|| eyre!("connection refused: {}", request.url))
  }
}
