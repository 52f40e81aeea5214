//! Offline request cache.
//!
//! This module provides:
//! - A namespaced, versioned store of response snapshots keyed by request identity
//! - A network-first interception policy that falls back to the store, or to a
//!   synthesized JSON payload for API calls, when the network is unavailable
//! - Install and activate lifecycle steps that seed the shell namespace and
//!   evict namespaces left over from older versions

mod policy;
mod storage;
mod traits;

pub use policy::{InterceptionPolicy, PolicySettings};
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use traits::{CacheSource, Request, ResponseSnapshot};
