use std::{fmt, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    backend::{Acquire, Held, LockBackend, Renew},
    config::ElectConfig,
    error::{ElectError, Result},
    store::{KeyTtl, TtlStore},
};

/// Value stored under a TTL-key lock: `"<unixSeconds>:<nodeId>"`.
///
/// Every node of a cluster must read and write this format identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub acquired_at: i64,
    pub node_id: String,
}

impl LockRecord {
    pub fn new(acquired_at: i64, node_id: impl Into<String>) -> Self {
        Self {
            acquired_at,
            node_id: node_id.into(),
        }
    }

    pub fn now(node_id: impl Into<String>) -> Self {
        Self::new(Utc::now().timestamp(), node_id)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let Some((acquired_at, node_id)) = raw.split_once(':') else {
            return Err(ElectError::InvalidRecord(raw.to_owned()));
        };

        let acquired_at = acquired_at
            .parse::<i64>()
            .map_err(|_| ElectError::InvalidRecord(raw.to_owned()))?;

        Ok(Self::new(acquired_at, node_id))
    }

    /// Seconds elapsed between acquisition and `now`.
    pub fn age(&self, now: i64) -> i64 {
        now - self.acquired_at
    }
}

impl fmt::Display for LockRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.acquired_at, self.node_id)
    }
}

/// Node id part of a raw lock value. A value without `:` is a bare node id.
pub fn owner_of(raw: &str) -> &str {
    raw.split_once(':').map_or(raw, |(_, node_id)| node_id)
}

/// Lock implemented as a key created if absent, with an expiry refreshed while held.
///
/// The record is written together with its expiry in one atomic call. Records
/// left without an expiry, by writers that create then expire in two steps and
/// died in between, are broken once older than the staleness threshold.
pub struct TtlKeyLock<S: TtlStore> {
    store: S,
    key: String,
    node_id: String,
    tenancy: Duration,
    staleness_threshold: Duration,
    staleness_ceiling: Duration,
    held: Option<String>,
}

impl<S: TtlStore> TtlKeyLock<S> {
    pub fn new(
        store: S,
        cluster_id: &str,
        node_id: impl Into<String>,
        config: &ElectConfig,
    ) -> Result<Self> {
        let node_id = node_id.into();

        if cluster_id.is_empty() {
            return Err(ElectError::InvalidArgument("cluster id is empty"));
        }

        if node_id.is_empty() {
            return Err(ElectError::InvalidArgument("node id is empty"));
        }

        config.validate()?;

        Ok(Self {
            store,
            key: Self::cluster_key(cluster_id),
            node_id,
            tenancy: config.tenancy,
            staleness_threshold: config.staleness_threshold,
            staleness_ceiling: config.staleness_ceiling,
            held: None,
        })
    }

    pub fn cluster_key(cluster_id: &str) -> String {
        format!("electCluster.{cluster_id}.MasterNodeId")
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn owner_matches(&self) -> Result<bool> {
        let Some(raw) = self.store.get(&self.key).await? else {
            debug!(key = %self.key, "lock record vanished");
            return Ok(false);
        };

        let found = owner_of(&raw);
        if found != self.node_id {
            let err = ElectError::OwnerMismatch {
                expected: self.node_id.to_owned(),
                found: found.to_owned(),
            };
            debug!(key = %self.key, "{err}");
            return Ok(false);
        }

        Ok(true)
    }

    /// Whether a record that carries no sane expiry was abandoned by its writer.
    fn is_abandoned(&self, raw: &str) -> bool {
        match LockRecord::parse(raw) {
            Ok(record) => {
                record.age(Utc::now().timestamp()) > self.staleness_threshold.as_secs() as i64
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "unreadable lock record");
                true
            }
        }
    }
}

#[async_trait]
impl<S: TtlStore> LockBackend for TtlKeyLock<S> {
    fn key(&self) -> &str {
        &self.key
    }

    /// The store has no blocking primitive, so `blocking` is ignored.
    async fn acquire(&mut self, _blocking: bool) -> Result<Acquire> {
        let value = LockRecord::now(self.node_id.to_owned()).to_string();

        if self.store.create(&self.key, &value, self.tenancy).await? {
            self.held = Some(value);
            return Ok(Acquire::Acquired);
        }

        match self.store.ttl(&self.key).await? {
            KeyTtl::Missing => return Ok(Acquire::HeldByOther),
            KeyTtl::Expires(ttl) if ttl <= self.staleness_ceiling => {
                return Ok(Acquire::HeldByOther)
            }
            _ => {}
        }

        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(Acquire::HeldByOther);
        };

        if self.is_abandoned(&raw) {
            warn!(key = %self.key, record = %raw, "breaking stale lock");
            // Only the record we judged stale goes; a fresh writer keeps its lock.
            self.store.delete_if(&self.key, &raw).await?;
        }

        Ok(Acquire::HeldByOther)
    }

    async fn renew(&mut self) -> Result<Renew> {
        if self.held.is_none() {
            return Ok(Renew::Lost);
        }

        if !self.store.expire(&self.key, self.tenancy).await? {
            self.held = None;
            return Ok(Renew::Lost);
        }

        // Another node may have taken the key between the owner check and the
        // expiry reset.
        if !self.owner_matches().await? {
            self.held = None;
            return Ok(Renew::Lost);
        }

        Ok(Renew::Renewed)
    }

    async fn check_still_held(&mut self) -> Result<Held> {
        if self.held.is_none() {
            return Ok(Held::NotHeld);
        }

        if self.owner_matches().await? {
            Ok(Held::Held)
        } else {
            self.held = None;
            Ok(Held::NotHeld)
        }
    }

    async fn release(&mut self) -> Result<()> {
        let Some(value) = self.held.take() else {
            return Ok(());
        };

        if !self.store.delete_if(&self.key, &value).await? {
            debug!(key = %self.key, "lock record already replaced or expired");
        }

        Ok(())
    }

    async fn reset_session(&mut self) -> Result<()> {
        self.held = None;

        Ok(())
    }
}


#[cfg(all(test, feature = "memory"))]
mod memory_tests {
    use super::*;
    use crate::store::MemoryStore;
    use tokio::time::sleep;

    fn config() -> ElectConfig {
        ElectConfig::builder().tenancy_secs(5).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn second_node_is_refused() {
        let store = MemoryStore::new();
        let mut a = TtlKeyLock::new(store.client(), "abc", "a", &config()).unwrap();
        let mut b = TtlKeyLock::new(store.client(), "abc", "b", &config()).unwrap();

        assert_eq!(a.acquire(false).await.unwrap(), Acquire::Acquired);
        assert_eq!(b.acquire(false).await.unwrap(), Acquire::HeldByOther);
        assert_eq!(a.check_still_held().await.unwrap(), Held::Held);
        assert_eq!(a.renew().await.unwrap(), Renew::Renewed);

        a.release().await.unwrap();
        assert_eq!(store.value("electCluster.abc.MasterNodeId"), None);
        assert_eq!(b.acquire(false).await.unwrap(), Acquire::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_persistent_record_is_broken() {
        let store = MemoryStore::new();
        let key = "electCluster.abc.MasterNodeId";
        let old = LockRecord::new(Utc::now().timestamp() - 120, "ghost");
        store.insert(key, old.to_string(), None);

        let mut lock = TtlKeyLock::new(store.client(), "abc", "a", &config()).unwrap();

        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::HeldByOther);
        assert_eq!(store.value(key), None);
        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_persistent_record_is_kept() {
        let store = MemoryStore::new();
        let key = "electCluster.abc.MasterNodeId";
        let recent = LockRecord::now("other");
        store.insert(key, recent.to_string(), None);

        let mut lock = TtlKeyLock::new(store.client(), "abc", "a", &config()).unwrap();

        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::HeldByOther);
        assert_eq!(store.value(key), Some(recent.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn overwritten_record_is_lost() {
        let store = MemoryStore::new();
        let key = "electCluster.abc.MasterNodeId";
        let mut lock = TtlKeyLock::new(store.client(), "abc", "a", &config()).unwrap();

        lock.acquire(false).await.unwrap();
        store.insert(key, LockRecord::now("intruder").to_string(), Some(Duration::from_secs(5)));

        assert_eq!(lock.check_still_held().await.unwrap(), Held::NotHeld);
        assert_eq!(lock.renew().await.unwrap(), Renew::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_rechecks_owner_after_expiry_reset() {
        let store = MemoryStore::new();
        let key = "electCluster.abc.MasterNodeId";
        let mut lock = TtlKeyLock::new(store.client(), "abc", "a", &config()).unwrap();

        lock.acquire(false).await.unwrap();
        assert_eq!(lock.check_still_held().await.unwrap(), Held::Held);

        let intruder = LockRecord::now("intruder").to_string();
        store.insert(key, intruder.to_owned(), Some(Duration::from_secs(5)));

        assert_eq!(lock.renew().await.unwrap(), Renew::Lost);
        assert_eq!(lock.check_still_held().await.unwrap(), Held::NotHeld);

        lock.release().await.unwrap();
        assert_eq!(store.value(key), Some(intruder));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_record_beyond_ceiling_is_broken() {
        let store = MemoryStore::new();
        let key = "electCluster.abc.MasterNodeId";
        let old = LockRecord::new(Utc::now().timestamp() - 120, "ghost");
        store.insert(key, old.to_string(), Some(Duration::from_secs(120)));

        let mut lock = TtlKeyLock::new(store.client(), "abc", "a", &config()).unwrap();

        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::HeldByOther);
        assert_eq!(store.value(key), None);
        assert_eq!(lock.acquire(false).await.unwrap(), Acquire::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn old_record_of_live_master_is_kept() {
        let store = MemoryStore::new();
        let key = "electCluster.abc.MasterNodeId";
        let config = ElectConfig::builder()
            .tenancy_secs(5)
            .staleness_threshold(Duration::from_secs(5))
            .staleness_ceiling(Duration::from_secs(5))
            .build()
            .unwrap();
        let mut a = TtlKeyLock::new(store.client(), "abc", "a", &config).unwrap();
        let mut b = TtlKeyLock::new(store.client(), "abc", "b", &config).unwrap();

        // Master for longer than the staleness threshold, renewing all along.
        let record = LockRecord::new(Utc::now().timestamp() - 120, "a").to_string();
        store.insert(key, record.to_owned(), Some(Duration::from_secs(5)));
        a.held = Some(record.to_owned());

        for _ in 0..3 {
            sleep(Duration::from_secs(1)).await;
            assert_eq!(a.check_still_held().await.unwrap(), Held::Held);
            assert_eq!(a.renew().await.unwrap(), Renew::Renewed);
            assert_eq!(b.acquire(false).await.unwrap(), Acquire::HeldByOther);
        }

        assert_eq!(store.value(key), Some(record));
        assert_eq!(a.check_still_held().await.unwrap(), Held::Held);
    }

    #[test]
    fn cluster_key_format() {
        assert_eq!(
            TtlKeyLock::<crate::store::MemoryClient>::cluster_key("abc"),
            "electCluster.abc.MasterNodeId"
        );
    }

    #[test]
    fn empty_ids_are_rejected() {
        let store = MemoryStore::new();
        assert!(TtlKeyLock::new(store.client(), "", "a", &config()).is_err());
        assert!(TtlKeyLock::new(store.client(), "abc", "", &config()).is_err());
    }
}
