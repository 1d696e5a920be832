//! The election control loop.
//!
//! One [`Election`] drives one lock backend for one node of one cluster. The
//! loop is a bounded-latency poller: every tick either tries to take the lock
//! (candidate) or confirms it is still ours (master), then sleeps for the
//! configured interval. Backend errors never end the loop; they are reported
//! through [`Election::on_error`] and followed by a backoff.
//!
//! # Example
//!
//! ```rust,ignore
//! let store = MemoryStore::new();
//! let mut election = Election::lease(store.client(), "abc", ElectConfig::default()).await?;
//!
//! election
//!     .on_become_master(|| async { start_jobs().await.is_ok() })
//!     .on_lost_master(|| async { stop_jobs().await })
//!     .on_error(|err| tracing::warn!("election error: {err}"));
//!
//! let running = election.start();
//! // ...
//! running.shutdown().await?;
//! ```

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    backend::{Acquire, Held, LeaseMutex, LockBackend, Renew, TtlKeyLock},
    config::ElectConfig,
    error::{ElectError, Result},
    metrics,
    store::{LeaseStore, TtlStore},
};

type BecomeMasterFn = Box<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;
type LostMasterFn = Box<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorFn = Box<dyn Fn(&ElectError) + Send + Sync>;
type GateFn = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Role {
    Candidate = 0,
    Master = 1,
    Stopped = 2,
}

impl Role {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Master,
            2 => Self::Stopped,
            _ => Self::Candidate,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candidate => f.write_str("candidate"),
            Self::Master => f.write_str("master"),
            Self::Stopped => f.write_str("stopped"),
        }
    }
}

#[derive(Debug)]
struct Shared {
    role: AtomicU8,
    stop: CancellationToken,
    exited: CancellationToken,
}

/// Cheap, cloneable view of a running election.
#[derive(Debug, Clone)]
pub struct ElectionHandle {
    cluster_id: Arc<str>,
    node_id: Arc<str>,
    shared: Arc<Shared>,
}

impl ElectionHandle {
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.shared.role.load(Ordering::Acquire))
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    /// Ask the loop to stop. Safe to call any number of times, before, during
    /// or after the loop runs.
    pub fn stop_elect(&self) {
        self.shared.stop.cancel();
    }

    /// Resolves once the loop has exited and released its lock.
    pub async fn stopped(&self) {
        self.shared.exited.cancelled().await;
    }
}

enum Tick {
    Sleep(Duration),
    Stop,
}

struct StopSignal {
    stop: CancellationToken,
    cancel: CancellationToken,
}

impl StopSignal {
    fn is_set(&self) -> bool {
        self.stop.is_cancelled() || self.cancel.is_cancelled()
    }

    async fn wait(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}

/// Leader election for one node over one [`LockBackend`].
///
/// Callbacks are registered through `&mut self`, so they are all in place
/// before [`Election::run`] borrows the election. An election runs once; after
/// its loop exits it stays [`Role::Stopped`].
pub struct Election<B: LockBackend> {
    cluster_id: String,
    node_id: String,
    config: ElectConfig,
    backend: B,
    shared: Arc<Shared>,
    on_become_master: Option<BecomeMasterFn>,
    on_lost_master: Option<LostMasterFn>,
    on_error: Option<ErrorFn>,
    gate: Option<GateFn>,
}

pub type LeaseElection<S> = Election<LeaseMutex<S>>;
pub type TtlElection<S> = Election<TtlKeyLock<S>>;

impl<S: LeaseStore> LeaseElection<S> {
    /// Election over a session-bound mutex. The lease itself identifies the
    /// node, so a random node id is generated for logs.
    pub async fn lease(store: S, cluster_id: impl Into<String>, config: ElectConfig) -> Result<Self> {
        let cluster_id = cluster_id.into();
        let backend = LeaseMutex::new(store, &cluster_id, &config).await?;

        Self::with_generated_id(cluster_id, config, backend)
    }
}

impl<S: TtlStore> TtlElection<S> {
    /// Election over a TTL key. `node_id` is written into the key and must be
    /// unique within the cluster.
    pub fn ttl_key(
        store: S,
        cluster_id: impl Into<String>,
        node_id: impl Into<String>,
        config: ElectConfig,
    ) -> Result<Self> {
        let cluster_id = cluster_id.into();
        let node_id = node_id.into();
        let backend = TtlKeyLock::new(store, &cluster_id, node_id.to_owned(), &config)?;

        Self::new(cluster_id, node_id, config, backend)
    }
}

impl<B: LockBackend> Election<B> {
    pub fn new(
        cluster_id: impl Into<String>,
        node_id: impl Into<String>,
        config: ElectConfig,
        backend: B,
    ) -> Result<Self> {
        let cluster_id = cluster_id.into();
        let node_id = node_id.into();

        if cluster_id.is_empty() {
            return Err(ElectError::InvalidArgument("cluster id is empty"));
        }

        if node_id.is_empty() {
            return Err(ElectError::InvalidArgument("node id is empty"));
        }

        config.validate()?;

        Ok(Self {
            cluster_id,
            node_id,
            config,
            backend,
            shared: Arc::new(Shared {
                role: AtomicU8::new(Role::Candidate as u8),
                stop: CancellationToken::new(),
                exited: CancellationToken::new(),
            }),
            on_become_master: None,
            on_lost_master: None,
            on_error: None,
            gate: None,
        })
    }

    pub fn with_generated_id(
        cluster_id: impl Into<String>,
        config: ElectConfig,
        backend: B,
    ) -> Result<Self> {
        Self::new(cluster_id, Uuid::new_v4().to_string(), config, backend)
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &ElectConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn handle(&self) -> ElectionHandle {
        ElectionHandle {
            cluster_id: self.cluster_id.as_str().into(),
            node_id: self.node_id.as_str().into(),
            shared: self.shared.clone(),
        }
    }

    pub fn role(&self) -> Role {
        Role::from_u8(self.shared.role.load(Ordering::Acquire))
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Master
    }

    pub fn stop_elect(&self) {
        self.shared.stop.cancel();
    }

    /// Called after the lock is acquired, before the node reports itself
    /// master. Returning `false` vetoes the transition: the lock is released
    /// and the node stays candidate.
    pub fn on_become_master<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        self.on_become_master = Some(Box::new(move || f().boxed()));
        self
    }

    /// Called once per master to candidate transition, and when a master stops.
    pub fn on_lost_master<F, Fut>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_lost_master = Some(Box::new(move || f().boxed()));
        self
    }

    /// Called with every backend error. Must not block.
    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ElectError) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Checked on every candidate tick; the tick is skipped while it returns `false`.
    pub fn set_election_gate<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Box::new(f));
        self
    }

    fn set_role(&self, role: Role) {
        self.shared.role.store(role as u8, Ordering::Release);
        metrics::set_master(&self.cluster_id, role == Role::Master);
    }

    /// Run the control loop until [`Election::stop_elect`] is called or
    /// `cancel` fires, then release the lock.
    #[tracing::instrument(skip_all, fields(cluster = %self.cluster_id, node = %self.node_id))]
    pub async fn run(&mut self, cancel: CancellationToken) {
        let signal = StopSignal {
            stop: self.shared.stop.clone(),
            cancel,
        };

        info!(key = self.backend.key(), "election started");

        loop {
            if signal.is_set() {
                break;
            }

            let tick = if self.is_master() {
                self.master_tick(&signal).await
            } else {
                self.candidate_tick(&signal).await
            };

            let Tick::Sleep(pause) = tick else {
                break;
            };

            tokio::select! {
                _ = signal.wait() => break,
                _ = sleep(pause) => {}
            }
        }

        self.teardown().await;
    }

    /// Spawn [`Election::run`] on the tokio runtime.
    pub fn start(mut self) -> Running<B>
    where
        B: 'static,
    {
        let handle = self.handle();
        let task = tokio::spawn(async move {
            self.run(CancellationToken::new()).await;
            self
        });

        Running { handle, task }
    }

    async fn candidate_tick(&mut self, signal: &StopSignal) -> Tick {
        if let Some(gate) = &self.gate {
            if !gate() {
                debug!("election gate closed, skip");
                return Tick::Sleep(self.config.interval);
            }
        }

        let res = tokio::select! {
            biased;
            _ = signal.wait() => return Tick::Stop,
            res = self.backend.acquire(self.config.blocking_acquire) => res,
        };

        match res {
            Ok(Acquire::HeldByOther) => {
                debug!("lock held by another node");
                Tick::Sleep(self.config.interval)
            }
            Ok(Acquire::Acquired) => {
                self.become_master().await;
                Tick::Sleep(self.config.interval)
            }
            Err(e) => {
                self.report(&e);

                if e.is_session_invalid() {
                    self.reset_session().await;
                }

                Tick::Sleep(self.config.error_backoff)
            }
        }
    }

    async fn become_master(&mut self) {
        metrics::record_acquired(&self.cluster_id);

        let accepted = match &self.on_become_master {
            Some(on_become_master) => on_become_master().await,
            _ => true,
        };

        if !accepted {
            warn!("become master vetoed, releasing lock");
            metrics::record_vetoed(&self.cluster_id);

            if let Err(e) = self.backend.release().await {
                self.report(&e);
                self.reset_session().await;
            }

            return;
        }

        self.set_role(Role::Master);
        info!("became master");
    }

    async fn master_tick(&mut self, signal: &StopSignal) -> Tick {
        let res = tokio::select! {
            biased;
            _ = signal.wait() => return Tick::Stop,
            res = Self::confirm(&mut self.backend) => res,
        };

        match res {
            Ok(true) => Tick::Sleep(self.config.interval),
            Ok(false) => {
                self.report(&ElectError::LockNotHeld(self.backend.key().to_owned()));
                self.lose_master().await;
                Tick::Sleep(self.config.interval)
            }
            Err(e) => {
                // Ownership can no longer be proven; step down rather than risk
                // two masters.
                self.report(&e);
                self.lose_master().await;
                Tick::Sleep(self.config.error_backoff)
            }
        }
    }

    async fn confirm(backend: &mut B) -> Result<bool> {
        if backend.check_still_held().await? == Held::NotHeld {
            return Ok(false);
        }

        Ok(backend.renew().await? == Renew::Renewed)
    }

    async fn lose_master(&mut self) {
        self.set_role(Role::Candidate);
        metrics::record_lost(&self.cluster_id);
        warn!("lost master");

        if let Some(on_lost_master) = &self.on_lost_master {
            on_lost_master().await;
        }

        if let Err(e) = self.backend.release().await {
            self.report(&e);
        }

        self.reset_session().await;
    }

    async fn reset_session(&mut self) {
        match self.backend.reset_session().await {
            Ok(()) => {
                metrics::record_session_reset(&self.cluster_id);
                debug!("lock handle reset");
            }
            Err(e) => self.report(&e),
        }
    }

    async fn teardown(&mut self) {
        let was_master = self.is_master();
        self.set_role(Role::Stopped);

        if was_master {
            if let Some(on_lost_master) = &self.on_lost_master {
                on_lost_master().await;
            }
        }

        match tokio::time::timeout(self.config.tenancy, self.backend.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.report(&e),
            Err(_) => self.report(&ElectError::Timeout(self.config.tenancy)),
        }

        info!("election stopped");
        self.shared.exited.cancel();
    }

    fn report(&self, err: &ElectError) {
        if err.is_transient() {
            warn!(error = %err, "election error, retrying");
        } else {
            error!(error = %err, "election error");
        }

        metrics::record_error(&self.cluster_id);

        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
    }
}

/// An election running on its own tokio task.
pub struct Running<B: LockBackend> {
    handle: ElectionHandle,
    task: JoinHandle<Election<B>>,
}

impl<B: LockBackend> Running<B> {
    pub fn handle(&self) -> &ElectionHandle {
        &self.handle
    }

    pub fn is_master(&self) -> bool {
        self.handle.is_master()
    }

    /// Stop the loop and wait for it to release its lock. The election is
    /// handed back, stopped.
    pub async fn shutdown(self) -> std::result::Result<Election<B>, tokio::task::JoinError> {
        self.handle.stop_elect();
        self.task.await
    }
}
