//! Coordination store capabilities consumed by the lock backends.
//!
//! A store is the opaque part of the backend: it owns the lease and key
//! machinery, while [`crate::backend`] owns the locking protocol built on top.

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "memory")]
pub use memory::*;

#[cfg(feature = "etcd")]
mod etcd;
#[cfg(feature = "etcd")]
pub use etcd::*;

#[cfg(feature = "redis")]
mod redis_store;
#[cfg(feature = "redis")]
pub use redis_store::*;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use dyn_clone::DynClone;
use tokio::{sync::watch, task::JoinHandle};

use crate::error::Result;

/// A lease granted by a [`LeaseStore`] and kept alive by the store client.
///
/// Cloning shares the same lease; the keep-alive task, if any, stops once the
/// last clone is dropped.
#[derive(Clone)]
pub struct LeaseSession {
    id: i64,
    alive: watch::Receiver<bool>,
    keepalive: Option<Arc<KeepAlive>>,
}

impl LeaseSession {
    pub fn new(id: i64, alive: watch::Receiver<bool>) -> Self {
        Self {
            id,
            alive,
            keepalive: None,
        }
    }

    pub fn with_keepalive(mut self, task: JoinHandle<()>) -> Self {
        self.keepalive = Some(Arc::new(KeepAlive(task)));
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn is_expired(&self) -> bool {
        !*self.alive.borrow()
    }

    /// Resolves once the lease is known to be gone.
    pub async fn expired(&self) {
        let mut alive = self.alive.clone();
        let _ = alive.wait_for(|alive| !*alive).await;
    }
}

impl fmt::Debug for LeaseSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseSession")
            .field("id", &self.id)
            .field("expired", &self.is_expired())
            .finish()
    }
}

struct KeepAlive(JoinHandle<()>);

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Session-scoped mutex primitive of a consensus store.
#[async_trait]
pub trait LeaseStore: DynClone + Send + Sync {
    async fn grant(&self, ttl: Duration) -> Result<LeaseSession>;

    /// Key `session` contends for `name` under, in the etcd lock service layout.
    fn contender_key(&self, session: &LeaseSession, name: &str) -> Vec<u8> {
        format!("{name}/{:x}", session.id()).into_bytes()
    }

    /// Blocks until `name` is owned under `session`, returning the owner key.
    /// A call that fails or is dropped leaves no contender key behind.
    async fn lock(&self, session: &LeaseSession, name: &str) -> Result<Vec<u8>>;

    /// Number of keys currently contending for `name`, holder included,
    /// `except` left out.
    async fn holders(&self, name: &str, except: &[u8]) -> Result<usize>;

    async fn exists(&self, key: &[u8]) -> Result<bool>;

    async fn unlock(&self, key: &[u8]) -> Result<()>;

    async fn revoke(&self, session: &LeaseSession) -> Result<()>;
}

dyn_clone::clone_trait_object!(LeaseStore);

/// Whole seconds, the ttl granularity of etcd leases and redis expiries.
#[cfg(any(feature = "etcd", feature = "redis"))]
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// Remaining lifetime of a key in a [`TtlStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// Map a redis `TTL` reply.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            -2 => Self::Missing,
            s if s < 0 => Self::Persistent,
            s => Self::Expires(Duration::from_secs(s as u64)),
        }
    }
}

/// Key-value primitive with atomic create-if-absent and per-key expiry.
#[async_trait]
pub trait TtlStore: DynClone + Send + Sync {
    /// Atomically create `key` with `value` and `ttl`; false when it already exists.
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Reset the expiry of `key`; false when the key no longer exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool>;
}

dyn_clone::clone_trait_object!(TtlStore);
