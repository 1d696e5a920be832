//! The lock backend contract the election engine drives.
//!
//! Two adapters implement it:
//!
//! - [`LeaseMutex`] - a consensus store's session-bound mutex (etcd).
//! - [`TtlKeyLock`] - a key created if absent and kept alive by explicit
//!   expiry resets (redis).
//!
//! Errors returned by any operation are either transient (retry the same
//! handle after a backoff) or session-invalid (see
//! [`ElectError::is_session_invalid`](crate::ElectError::is_session_invalid)),
//! in which case the engine calls [`LockBackend::reset_session`] before
//! retrying.

mod lease;
mod ttl;

pub use lease::*;
pub use ttl::*;

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Acquired,
    HeldByOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renew {
    Renewed,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Held {
    Held,
    NotHeld,
}

#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Store key or lock path contested by this backend.
    fn key(&self) -> &str;

    /// Try to take the lock. A blocking call only returns once the lock is
    /// ours, the store fails, or the session dies.
    async fn acquire(&mut self, blocking: bool) -> Result<Acquire>;

    /// Extend the validity of a held lock and confirm it is still ours.
    async fn renew(&mut self) -> Result<Renew>;

    /// Confirm the current holder without attempting acquisition.
    async fn check_still_held(&mut self) -> Result<Held>;

    /// Best-effort unlock. Expiry on the store side is the fallback.
    async fn release(&mut self) -> Result<()>;

    /// Throw away the current handle and build a fresh one.
    async fn reset_session(&mut self) -> Result<()>;

    /// Release the lock and tear down anything the handle keeps alive.
    async fn close(&mut self) -> Result<()> {
        self.release().await
    }
}

#[async_trait]
impl<B: LockBackend + ?Sized> LockBackend for Box<B> {
    fn key(&self) -> &str {
        (**self).key()
    }

    async fn acquire(&mut self, blocking: bool) -> Result<Acquire> {
        (**self).acquire(blocking).await
    }

    async fn renew(&mut self) -> Result<Renew> {
        (**self).renew().await
    }

    async fn check_still_held(&mut self) -> Result<Held> {
        (**self).check_still_held().await
    }

    async fn release(&mut self) -> Result<()> {
        (**self).release().await
    }

    async fn reset_session(&mut self) -> Result<()> {
        (**self).reset_session().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}
