use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, LeaseKeepAliveStream, LeaseKeeper, LockOptions};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::{
    error::{ElectError, Result},
    store::{ttl_secs, LeaseSession, LeaseStore},
};

/// [`LeaseStore`] backed by etcd leases and the v3 lock service.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(endpoints: S) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        debug!("Connected to etcd");

        Ok(Self { client })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl LeaseStore for EtcdStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseSession> {
        let mut client = self.client.clone();
        let secs = ttl_secs(ttl);
        let lease_id = client.lease_grant(secs as i64, None).await?.id();
        let (keeper, stream) = client.lease_keep_alive(lease_id).await?;
        let (alive, rx) = watch::channel(true);

        let interval = Duration::from_millis((secs * 1000 / 3).max(200));
        let task = spawn_keepalive_task(keeper, stream, lease_id, interval, alive);

        Ok(LeaseSession::new(lease_id, rx).with_keepalive(task))
    }

    async fn lock(&self, session: &LeaseSession, name: &str) -> Result<Vec<u8>> {
        if session.is_expired() {
            return Err(ElectError::SessionExpired(format!(
                "lease {:x} expired",
                session.id()
            )));
        }

        let mut client = self.client.clone();
        let options = LockOptions::new().with_lease(session.id());

        tokio::select! {
            res = client.lock(name, Some(options)) => Ok(res?.key().to_vec()),
            _ = session.expired() => Err(ElectError::SessionExpired(format!(
                "lease {:x} expired while waiting for {name}",
                session.id()
            ))),
        }
    }

    async fn holders(&self, name: &str, except: &[u8]) -> Result<usize> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                format!("{name}/"),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;

        Ok(resp.kvs().iter().filter(|kv| kv.key() != except).count())
    }

    async fn exists(&self, key: &[u8]) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;

        Ok(!resp.kvs().is_empty())
    }

    async fn unlock(&self, key: &[u8]) -> Result<()> {
        let mut client = self.client.clone();
        client.unlock(key).await?;

        Ok(())
    }

    async fn revoke(&self, session: &LeaseSession) -> Result<()> {
        let mut client = self.client.clone();

        match client.lease_revoke(session.id()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = ElectError::from(e);
                // Already reaped by the server.
                if err.is_session_invalid() {
                    return Ok(());
                }

                Err(err)
            }
        }
    }
}

/// Send periodic keep-alive requests for the lease.
/// Flags the session expired as soon as a keep-alive fails or reports a zero ttl.
fn spawn_keepalive_task(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    interval: Duration,
    alive: watch::Sender<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);

        loop {
            interval.tick().await;

            if let Err(e) = keeper.keep_alive().await {
                error!(lease_id = lease_id, error = %e, "Keep-alive send failed");
                break;
            }

            match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    trace!(lease_id = lease_id, ttl = resp.ttl(), "Keep-alive OK");
                }
                Ok(Some(_)) => {
                    warn!(lease_id = lease_id, "Lease expired on the server");
                    break;
                }
                Ok(None) => {
                    error!(lease_id = lease_id, "Keep-alive stream closed");
                    break;
                }
                Err(e) => {
                    error!(lease_id = lease_id, error = %e, "Keep-alive failed");
                    break;
                }
            }
        }

        alive.send_replace(false);
    })
}
