use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    backend::{Acquire, Held, LockBackend, Renew},
    config::ElectConfig,
    error::{ElectError, Result},
    store::{LeaseSession, LeaseStore},
};

/// How long a non-blocking acquisition waits on a lock call that raced
/// another contender.
const TRY_LOCK_WAIT: Duration = Duration::from_millis(500);

/// Lock held through a consensus store's session-scoped mutex.
///
/// The session lease is kept alive by the store client, so renewal is
/// implicit; [`LockBackend::renew`] only observes whether the keep-alive is
/// still healthy. A session that expired, or a mutex whose unlock failed, is
/// never reused: [`LockBackend::reset_session`] revokes it and the next
/// acquisition grants a new lease.
pub struct LeaseMutex<S: LeaseStore> {
    store: S,
    name: String,
    tenancy: Duration,
    session: Option<LeaseSession>,
    held: Option<Vec<u8>>,
}

impl<S: LeaseStore> LeaseMutex<S> {
    /// Grant the first session. Fails when the store cannot be reached.
    pub async fn new(store: S, cluster_id: &str, config: &ElectConfig) -> Result<Self> {
        if cluster_id.is_empty() {
            return Err(ElectError::InvalidArgument("cluster id is empty"));
        }

        config.validate()?;

        let session = store.grant(config.tenancy).await?;

        Ok(Self {
            store,
            name: format!("{}{}", config.lock_prefix, cluster_id),
            tenancy: config.tenancy,
            session: Some(session),
            held: None,
        })
    }

    pub fn session(&self) -> Option<&LeaseSession> {
        self.session.as_ref()
    }

    /// Key under which the store records our ownership, while held.
    pub fn owner_key(&self) -> Option<&[u8]> {
        self.held.as_deref()
    }

    async fn live_session(&mut self) -> Result<LeaseSession> {
        match &self.session {
            Some(session) if session.is_expired() => Err(ElectError::SessionExpired(format!(
                "lease {:x} expired",
                session.id()
            ))),
            Some(session) => Ok(session.clone()),
            None => {
                let session = self.store.grant(self.tenancy).await?;
                self.session = Some(session.clone());
                Ok(session)
            }
        }
    }

    /// Take the mutex only if nobody else contends for it. Losing a race to
    /// another contender withdraws our key instead of queueing behind it.
    async fn try_lock(&self, session: &LeaseSession) -> Result<Option<Vec<u8>>> {
        let contender = self.store.contender_key(session, &self.name);

        if self.store.holders(&self.name, &contender).await? > 0 {
            return Ok(None);
        }

        match timeout(TRY_LOCK_WAIT, self.store.lock(session, &self.name)).await {
            Ok(key) => key.map(Some),
            Err(_) => {
                debug!(lock = %self.name, "mutex taken by another contender");

                if let Err(e) = self.store.unlock(&contender).await {
                    warn!(lock = %self.name, error = %e, "failed to withdraw contender key");
                }

                Ok(None)
            }
        }
    }
}

#[async_trait]
impl<S: LeaseStore> LockBackend for LeaseMutex<S> {
    fn key(&self) -> &str {
        &self.name
    }

    async fn acquire(&mut self, blocking: bool) -> Result<Acquire> {
        if self.held.is_some() {
            return Ok(Acquire::Acquired);
        }

        let session = self.live_session().await?;

        let key = if blocking {
            self.store.lock(&session, &self.name).await?
        } else {
            match self.try_lock(&session).await? {
                Some(key) => key,
                None => return Ok(Acquire::HeldByOther),
            }
        };
        debug!(
            lock = %self.name,
            lease = session.id(),
            "mutex granted"
        );
        self.held = Some(key);

        Ok(Acquire::Acquired)
    }

    async fn renew(&mut self) -> Result<Renew> {
        match (&self.held, &self.session) {
            (Some(_), Some(session)) if !session.is_expired() => Ok(Renew::Renewed),
            _ => Ok(Renew::Lost),
        }
    }

    async fn check_still_held(&mut self) -> Result<Held> {
        let Some(key) = self.held.as_deref() else {
            return Ok(Held::NotHeld);
        };

        if self.session.as_ref().map_or(true, LeaseSession::is_expired) {
            return Ok(Held::NotHeld);
        }

        // The key disappears with the lease, whatever reaped it.
        if self.store.exists(key).await? {
            Ok(Held::Held)
        } else {
            Ok(Held::NotHeld)
        }
    }

    async fn release(&mut self) -> Result<()> {
        let Some(key) = self.held.take() else {
            return Ok(());
        };

        self.store.unlock(&key).await
    }

    async fn reset_session(&mut self) -> Result<()> {
        self.held = None;

        if let Some(session) = self.session.take() {
            if let Err(e) = self.store.revoke(&session).await {
                warn!(lock = %self.name, error = %e, "failed to revoke old lease");
            }
        }

        self.session = Some(self.store.grant(self.tenancy).await?);

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let released = self.release().await;

        if let Some(session) = self.session.take() {
            self.store.revoke(&session).await?;
        }

        released
    }
}
