//! Network transport used by the interception policy.

mod client;
#[cfg(test)]
pub mod fake;

use color_eyre::Result;
use std::future::Future;

use crate::cache::{Request, ResponseSnapshot};

pub use client::HttpTransport;

/// Something that can carry a request to the network and buffer the reply.
///
/// Any error is treated by the policy as a transient network failure.
pub trait Transport: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<ResponseSnapshot>> + Send;
}
