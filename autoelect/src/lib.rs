//! Continuous single-leader election over a shared coordination store.
//!
//! Every node of a cluster runs one [`Election`]. Exactly one of them holds
//! the cluster's distributed lock at a time and reports itself master; the
//! others keep polling as candidates and take over once the lock is released
//! or expires.
//!
//! Two locking primitives are supported behind the [`LockBackend`] contract:
//!
//! - [`LeaseMutex`] - an etcd session-bound mutex (`etcd` feature).
//! - [`TtlKeyLock`] - a redis key created if absent and kept alive by expiry
//!   resets (`redis` feature).
//!
//! The `memory` feature (default) provides [`MemoryStore`], an in-process
//! store implementing both, used for tests and local runs.
//!
//! ```rust,ignore
//! use autoelect::{ElectConfig, Election, RedisStore};
//!
//! let store = RedisStore::open("redis://127.0.0.1/").await?;
//! let mut election = Election::ttl_key(store, "abc", "node-1", ElectConfig::default())?;
//!
//! election.on_become_master(|| async { true });
//!
//! let running = election.start();
//! assert!(!running.is_master());
//! ```

#![forbid(unsafe_code)]

mod backend;
mod config;
mod election;
mod error;
pub mod metrics;
mod store;

pub use backend::*;
pub use config::*;
pub use election::*;
pub use error::*;
pub use store::*;

pub use tokio_util::sync::CancellationToken;
