use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};

use crate::{
    error::{ElectError, Result},
    store::{KeyTtl, LeaseSession, LeaseStore, TtlStore},
};

const LOCK_POLL: Duration = Duration::from_millis(20);

/// In-process coordination store.
///
/// It behaves like an etcd cluster (leases, session-bound mutex keys) and a
/// redis server (expiring keys) at once. Each node talks to it through its own
/// [`MemoryClient`], which can be disconnected to simulate a lost connection:
/// leases of a disconnected client stop being kept alive and expire after
/// their ttl, like an etcd session whose process went away.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore(Arc<Mutex<State>>);

#[derive(Debug, Default)]
struct State {
    next_client: u64,
    next_lease: i64,
    revision: u64,
    clients: HashMap<u64, bool>,
    leases: HashMap<i64, Lease>,
    lock_keys: BTreeMap<String, LockKey>,
    kv: HashMap<String, Entry>,
}

#[derive(Debug)]
struct Lease {
    client: u64,
    ttl: Duration,
    expires_at: Instant,
    alive: watch::Sender<bool>,
}

#[derive(Debug)]
struct LockKey {
    name: String,
    lease: i64,
    revision: u64,
}

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl State {
    /// Keep leases of connected clients alive and reap everything past its deadline.
    fn tick(&mut self) {
        let now = Instant::now();

        for lease in self.leases.values_mut() {
            if self.clients.get(&lease.client).copied().unwrap_or(false) {
                lease.expires_at = now + lease.ttl;
            }
        }

        let expired = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        for id in expired {
            self.drop_lease(id);
        }

        self.kv
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    fn drop_lease(&mut self, id: i64) {
        if let Some(lease) = self.leases.remove(&id) {
            lease.alive.send_replace(false);
        }

        self.lock_keys.retain(|_, key| key.lease != id);
    }

    fn owner(&self, name: &str) -> Option<&str> {
        self.lock_keys
            .iter()
            .filter(|(_, key)| key.name == name)
            .min_by_key(|(_, key)| key.revision)
            .map(|(key, _)| key.as_str())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connected client.
    pub fn client(&self) -> MemoryClient {
        let mut state = self.0.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(id, true);

        MemoryClient {
            store: self.clone(),
            id,
        }
    }

    /// Write a key directly, bypassing any client.
    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        let mut state = self.0.lock();
        state.tick();
        state.kv.insert(
            key.into(),
            Entry {
                value: value.into(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }

    pub fn remove(&self, key: &str) -> bool {
        let mut state = self.0.lock();
        state.tick();
        state.kv.remove(key).is_some()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        let mut state = self.0.lock();
        state.tick();
        state.kv.get(key).map(|entry| entry.value.to_owned())
    }

    /// Current holder key of the mutex `name`.
    pub fn lock_owner(&self, name: &str) -> Option<String> {
        let mut state = self.0.lock();
        state.tick();
        state.owner(name).map(ToOwned::to_owned)
    }

    /// Delete a mutex key out of band, as an operator running `etcdctl del` would.
    pub fn remove_lock_key(&self, key: &[u8]) -> bool {
        let mut state = self.0.lock();
        state.tick();
        state
            .lock_keys
            .remove(String::from_utf8_lossy(key).as_ref())
            .is_some()
    }

    /// Reap a lease server-side along with every key attached to it.
    pub fn expire_lease(&self, id: i64) {
        let mut state = self.0.lock();
        state.drop_lease(id);
    }
}

/// Contender key of a lock call still waiting. Dropped before the mutex is
/// granted (error or cancellation), it deletes the key server-side like the
/// etcd lock service does, whether or not the client is still connected.
struct Waiter<'a> {
    store: &'a MemoryStore,
    key: Option<String>,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.store.0.lock().lock_keys.remove(&key);
        }
    }
}

/// One node's connection to a [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct MemoryClient {
    store: MemoryStore,
    id: u64,
}

impl MemoryClient {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn disconnect(&self) {
        let mut state = self.store.0.lock();
        // Leases were kept alive right up to now.
        state.tick();
        state.clients.insert(self.id, false);
    }

    pub fn reconnect(&self) {
        let mut state = self.store.0.lock();
        state.tick();
        state.clients.insert(self.id, true);
    }

    pub fn is_connected(&self) -> bool {
        self.store
            .0
            .lock()
            .clients
            .get(&self.id)
            .copied()
            .unwrap_or(false)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.store.0.lock();
        state.tick();

        if !state.clients.get(&self.id).copied().unwrap_or(false) {
            return Err(ElectError::Disconnected);
        }

        f(&mut state)
    }
}

#[async_trait]
impl LeaseStore for MemoryClient {
    async fn grant(&self, ttl: Duration) -> Result<LeaseSession> {
        self.with_state(|state| {
            state.next_lease += 1;
            let id = state.next_lease;
            let (alive, rx) = watch::channel(true);

            state.leases.insert(
                id,
                Lease {
                    client: self.id,
                    ttl,
                    expires_at: Instant::now() + ttl,
                    alive,
                },
            );

            Ok(LeaseSession::new(id, rx))
        })
    }

    async fn lock(&self, session: &LeaseSession, name: &str) -> Result<Vec<u8>> {
        let id = session.id();
        let key = String::from_utf8_lossy(&self.contender_key(session, name)).into_owned();

        self.with_state(|state| {
            if !state.leases.contains_key(&id) {
                return Err(ElectError::SessionExpired(format!("lease {id} not found")));
            }

            if !state.lock_keys.contains_key(&key) {
                state.revision += 1;
                let revision = state.revision;
                state.lock_keys.insert(
                    key.to_owned(),
                    LockKey {
                        name: name.to_owned(),
                        lease: id,
                        revision,
                    },
                );
            }

            Ok(())
        })?;

        let mut waiter = Waiter {
            store: &self.store,
            key: Some(key.to_owned()),
        };

        loop {
            let owned = self.with_state(|state| {
                if !state.lock_keys.contains_key(&key) {
                    return Err(ElectError::SessionExpired(format!(
                        "lease {id} lost while waiting for {name}"
                    )));
                }

                Ok(state.owner(name) == Some(key.as_str()))
            })?;

            if owned {
                waiter.key = None;
                return Ok(key.into_bytes());
            }

            sleep(LOCK_POLL).await;
        }
    }

    async fn holders(&self, name: &str, except: &[u8]) -> Result<usize> {
        let except = String::from_utf8_lossy(except);

        self.with_state(|state| {
            Ok(state
                .lock_keys
                .iter()
                .filter(|(key, lock)| lock.name == name && key.as_str() != except)
                .count())
        })
    }

    async fn exists(&self, key: &[u8]) -> Result<bool> {
        self.with_state(|state| {
            Ok(state
                .lock_keys
                .contains_key(String::from_utf8_lossy(key).as_ref()))
        })
    }

    async fn unlock(&self, key: &[u8]) -> Result<()> {
        self.with_state(|state| {
            state
                .lock_keys
                .remove(String::from_utf8_lossy(key).as_ref());
            Ok(())
        })
    }

    async fn revoke(&self, session: &LeaseSession) -> Result<()> {
        self.with_state(|state| {
            state.drop_lease(session.id());
            Ok(())
        })
    }
}

#[async_trait]
impl TtlStore for MemoryClient {
    async fn create(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_state(|state| {
            if state.kv.contains_key(key) {
                return Ok(false);
            }

            state.kv.insert(
                key.to_owned(),
                Entry {
                    value: value.to_owned(),
                    expires_at: Some(Instant::now() + ttl),
                },
            );

            Ok(true)
        })
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.with_state(|state| {
            let ttl = match state.kv.get(key) {
                None => KeyTtl::Missing,
                Some(Entry {
                    expires_at: None, ..
                }) => KeyTtl::Persistent,
                Some(Entry {
                    expires_at: Some(at),
                    ..
                }) => KeyTtl::Expires(at.saturating_duration_since(Instant::now())),
            };

            Ok(ttl)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_state(|state| Ok(state.kv.get(key).map(|entry| entry.value.to_owned())))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_state(|state| match state.kv.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn delete_if(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_state(|state| {
            if state.kv.get(key).map(|entry| entry.value.as_str()) != Some(expected) {
                return Ok(false);
            }

            state.kv.remove(key);
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn lease_survives_while_connected() {
        let store = MemoryStore::new();
        let client = store.client();
        let session = client.grant(Duration::from_secs(2)).await.unwrap();

        sleep(Duration::from_secs(10)).await;

        assert!(client.holders("x", &[]).await.is_ok());
        assert!(!session.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn lease_expires_after_disconnect() {
        let store = MemoryStore::new();
        let client = store.client();
        let observer = store.client();
        let session = client.grant(Duration::from_secs(2)).await.unwrap();
        let key = client.lock(&session, "/e/abc").await.unwrap();

        client.disconnect();
        sleep(Duration::from_secs(1)).await;
        assert!(observer.exists(&key).await.unwrap());

        sleep(Duration::from_secs(2)).await;
        assert!(!observer.exists(&key).await.unwrap());
        assert!(session.is_expired());
        assert!(matches!(
            client.exists(&key).await,
            Err(ElectError::Disconnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn mutex_is_granted_in_revision_order() {
        let store = MemoryStore::new();
        let a = store.client();
        let b = store.client();
        let sa = a.grant(Duration::from_secs(5)).await.unwrap();
        let sb = b.grant(Duration::from_secs(5)).await.unwrap();

        let ka = a.lock(&sa, "/e/abc").await.unwrap();

        let waiter = tokio::spawn({
            let b = b.clone();
            async move { b.lock(&sb, "/e/abc").await }
        });

        sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());
        assert_eq!(a.holders("/e/abc", &[]).await.unwrap(), 2);
        assert_eq!(a.holders("/e/abc", &ka).await.unwrap(), 1);

        a.unlock(&ka).await.unwrap();
        let kb = waiter.await.unwrap().unwrap();
        assert_eq!(
            store.lock_owner("/e/abc").as_deref(),
            Some(String::from_utf8_lossy(&kb).as_ref())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_or_dropped_wait_removes_contender() {
        let store = MemoryStore::new();
        let a = store.client();
        let b = store.client();
        let sa = a.grant(Duration::from_secs(5)).await.unwrap();
        let sb = b.grant(Duration::from_secs(5)).await.unwrap();

        a.lock(&sa, "/e/abc").await.unwrap();

        let waiter = tokio::spawn({
            let b = b.clone();
            let sb = sb.clone();
            async move { b.lock(&sb, "/e/abc").await }
        });

        sleep(Duration::from_millis(100)).await;
        assert_eq!(a.holders("/e/abc", &[]).await.unwrap(), 2);

        b.disconnect();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ElectError::Disconnected)
        ));
        assert_eq!(a.holders("/e/abc", &[]).await.unwrap(), 1);

        b.reconnect();
        let res = tokio::time::timeout(Duration::from_millis(100), b.lock(&sb, "/e/abc")).await;
        assert!(res.is_err());
        assert_eq!(a.holders("/e/abc", &[]).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_on_reaped_lease_fails() {
        let store = MemoryStore::new();
        let client = store.client();
        let session = client.grant(Duration::from_secs(5)).await.unwrap();

        store.expire_lease(session.id());

        let err = client.lock(&session, "/e/abc").await.unwrap_err();
        assert!(err.is_session_invalid());
        assert!(session.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_keys() {
        let store = MemoryStore::new();
        let client = store.client();

        assert!(client
            .create("k", "1:a", Duration::from_secs(3))
            .await
            .unwrap());
        assert!(!client
            .create("k", "1:b", Duration::from_secs(3))
            .await
            .unwrap());
        assert!(matches!(
            client.ttl("k").await.unwrap(),
            KeyTtl::Expires(d) if d <= Duration::from_secs(3)
        ));

        assert!(!client.delete_if("k", "1:b").await.unwrap());
        assert!(client.expire("k", Duration::from_secs(3)).await.unwrap());

        sleep(Duration::from_secs(4)).await;
        assert_eq!(client.ttl("k").await.unwrap(), KeyTtl::Missing);
        assert!(!client.expire("k", Duration::from_secs(3)).await.unwrap());

        store.insert("p", "0:z", None);
        assert_eq!(client.ttl("p").await.unwrap(), KeyTtl::Persistent);
        assert!(client.delete_if("p", "0:z").await.unwrap());
        assert_eq!(client.get("p").await.unwrap(), None);
    }
}
