#![allow(dead_code)]

use anyhow::{bail, ensure, Result};
use async_trait::async_trait;
use autoelect::{ElectConfig, Election, ElectionHandle, LockBackend, Role};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, timeout, Instant};

/// Builds elections contesting one cluster.
#[async_trait]
pub trait Nodes: Send + Sync {
    type Backend: LockBackend + 'static;

    async fn node(&self, node_id: &str) -> Result<Election<Self::Backend>>;
}

pub fn config() -> ElectConfig {
    ElectConfig::builder()
        .tenancy_secs(2)
        .interval(Duration::from_millis(200))
        .error_backoff(Duration::from_millis(200))
        .build()
        .unwrap()
}

pub fn masters(handles: &[&ElectionHandle]) -> usize {
    handles.iter().filter(|h| h.is_master()).count()
}

pub async fn wait_for(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + within;

    while Instant::now() < deadline {
        if check() {
            return true;
        }

        sleep(Duration::from_millis(50)).await;
    }

    check()
}

/// Watch `handles` for `period`, failing as soon as two report master.
pub async fn assert_exclusive(handles: &[&ElectionHandle], period: Duration) -> Result<()> {
    let deadline = Instant::now() + period;

    while Instant::now() < deadline {
        let count = masters(handles);
        if count > 1 {
            bail!("{count} nodes report master at once");
        }

        sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}

pub async fn test_single_master<N: Nodes>(nodes: &N) -> Result<()> {
    let a = nodes.node("a").await?.start();

    ensure!(
        wait_for(Duration::from_secs(2), || a.is_master()).await,
        "first node never became master"
    );

    sleep(Duration::from_secs(1)).await;

    let b = nodes.node("b").await?.start();
    let c = nodes.node("c").await?.start();
    let handles = [a.handle(), b.handle(), c.handle()];

    assert_exclusive(&handles, Duration::from_secs(3)).await?;

    ensure!(a.is_master(), "master changed without any failure");
    ensure!(masters(&handles) == 1, "expected exactly one master");

    for running in [a, b, c] {
        running.shutdown().await?;
    }

    Ok(())
}

pub async fn test_failover_after_stop<N: Nodes>(nodes: &N) -> Result<()> {
    let a = nodes.node("a").await?.start();

    ensure!(
        wait_for(Duration::from_secs(2), || a.is_master()).await,
        "first node never became master"
    );

    let b = nodes.node("b").await?.start();
    sleep(Duration::from_millis(500)).await;
    ensure!(!b.is_master(), "second node became master while the first held the lock");

    let a = a.shutdown().await?;
    ensure!(a.role() == Role::Stopped, "stopped election reports {}", a.role());

    // The stopped master released its lock, no need to wait for expiry.
    ensure!(
        wait_for(Duration::from_secs(1), || b.is_master()).await,
        "second node did not take over"
    );

    b.shutdown().await?;

    Ok(())
}

pub async fn test_veto<N: Nodes>(nodes: &N) -> Result<()> {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut a = nodes.node("a").await?;

    a.on_become_master({
        let calls = calls.clone();
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { false }
        }
    });

    let a = a.start();

    ensure!(
        wait_for(Duration::from_secs(2), || calls.load(Ordering::SeqCst) > 0).await,
        "become master callback never ran"
    );
    ensure!(!a.is_master(), "vetoed node reports master");

    let b = nodes.node("b").await?.start();

    ensure!(
        wait_for(Duration::from_secs(2), || b.is_master()).await,
        "vetoed lock was not released"
    );
    ensure!(!a.is_master(), "vetoed node reports master");

    a.shutdown().await?;
    b.shutdown().await?;

    Ok(())
}

pub async fn test_stop_is_idempotent<N: Nodes>(nodes: &N) -> Result<()> {
    let mut election = nodes.node("a").await?;
    let handle = election.handle();

    handle.stop_elect();
    handle.stop_elect();

    timeout(
        Duration::from_secs(5),
        election.run(autoelect::CancellationToken::new()),
    )
    .await?;

    handle.stop_elect();
    election.stop_elect();
    timeout(Duration::from_secs(1), handle.stopped()).await?;

    ensure!(handle.role() == Role::Stopped, "role is {}", handle.role());
    ensure!(!handle.is_master(), "stopped election reports master");

    Ok(())
}

pub async fn test_cancellation_token<N: Nodes>(nodes: &N) -> Result<()> {
    let mut election = nodes.node("a").await?;
    let handle = election.handle();
    let cancel = autoelect::CancellationToken::new();

    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            election.run(cancel).await;
            election
        }
    });

    ensure!(
        wait_for(Duration::from_secs(2), || handle.is_master()).await,
        "node never became master"
    );

    cancel.cancel();
    let election = timeout(Duration::from_secs(5), task).await??;

    ensure!(election.role() == Role::Stopped, "role is {}", election.role());

    Ok(())
}

pub async fn test_gate<N: Nodes>(nodes: &N) -> Result<()> {
    let open = Arc::new(AtomicBool::new(false));
    let mut a = nodes.node("a").await?;

    a.set_election_gate({
        let open = open.clone();
        move || open.load(Ordering::SeqCst)
    });

    let a = a.start();

    sleep(Duration::from_secs(1)).await;
    ensure!(!a.is_master(), "gated node became master");

    open.store(true, Ordering::SeqCst);

    ensure!(
        wait_for(Duration::from_secs(2), || a.is_master()).await,
        "node did not elect once the gate opened"
    );

    a.shutdown().await?;

    Ok(())
}

pub async fn test_lost_master_on_stop<N: Nodes>(nodes: &N) -> Result<()> {
    let lost = Arc::new(AtomicUsize::new(0));
    let mut a = nodes.node("a").await?;

    a.on_lost_master({
        let lost = lost.clone();
        move || {
            let lost = lost.clone();
            async move {
                lost.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let a = a.start();

    ensure!(
        wait_for(Duration::from_secs(2), || a.is_master()).await,
        "node never became master"
    );
    ensure!(lost.load(Ordering::SeqCst) == 0, "lost callback ran early");

    a.shutdown().await?;

    ensure!(
        lost.load(Ordering::SeqCst) == 1,
        "lost callback ran {} times",
        lost.load(Ordering::SeqCst)
    );

    Ok(())
}
