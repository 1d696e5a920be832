//! Autoelect cluster demo
//!
//! Runs several election nodes for one cluster in a single process and logs
//! every change of master. With the in-memory store the master's connection
//! can be cut periodically to watch the others take over.

use std::time::Duration;

use anyhow::Result;
use autoelect::{ElectConfig, Election, LockBackend, MemoryClient, MemoryStore, Running};
use clap::{Parser, ValueEnum};
use tokio::time::{interval, interval_at, Instant, Interval};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Driver {
    /// In-process store, session-bound mutex
    MemoryLease,
    /// In-process store, TTL key
    MemoryTtl,
    /// etcd session-bound mutex
    Etcd,
    /// redis TTL key
    Redis,
}

#[derive(Parser)]
#[command(name = "autoelect-cluster")]
#[command(about = "Run election nodes for one cluster and report its master")]
struct Cli {
    #[arg(long, value_enum, default_value_t = Driver::MemoryLease)]
    driver: Driver,

    /// Cluster id shared by every node
    #[arg(long, env = "AUTOELECT_CLUSTER", default_value = "demo")]
    cluster: String,

    /// Node id prefix, defaults to the process id
    #[arg(long, env = "AUTOELECT_NODE")]
    node: Option<String>,

    /// Number of nodes to run in this process
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    /// etcd endpoints (comma-separated)
    #[arg(long, env = "ETCD_ENDPOINTS", default_value = "http://127.0.0.1:2379")]
    etcd_endpoints: String,

    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    /// Lock tenancy in seconds
    #[arg(long, default_value_t = 5)]
    tenancy: u32,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Cut the master's connection every N seconds (memory drivers only)
    #[arg(long)]
    failover_every: Option<u64>,
}

impl Cli {
    fn node_id(&self, n: usize) -> String {
        match &self.node {
            Some(prefix) => format!("{prefix}-{n}"),
            None => format!("{}-{n}", std::process::id()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = ElectConfig::builder()
        .tenancy_secs(cli.tenancy)
        .interval(Duration::from_millis(cli.interval_ms))
        .build()?;

    if cli.failover_every.is_some() && matches!(cli.driver, Driver::Etcd | Driver::Redis) {
        warn!("--failover-every only applies to memory drivers, ignored");
    }

    info!(driver = ?cli.driver, cluster = %cli.cluster, nodes = cli.nodes, "Starting cluster");

    match cli.driver {
        Driver::MemoryLease | Driver::MemoryTtl => run_memory(&cli, config).await,
        Driver::Etcd => run_etcd(&cli, config).await,
        Driver::Redis => run_redis(&cli, config).await,
    }
}

async fn run_memory(cli: &Cli, config: ElectConfig) -> Result<()> {
    let store = MemoryStore::new();
    let clients = (0..cli.nodes).map(|_| store.client()).collect::<Vec<_>>();
    let failover_every = cli.failover_every.map(Duration::from_secs);

    if cli.driver == Driver::MemoryTtl {
        let mut nodes = Vec::new();
        for (n, client) in clients.iter().enumerate() {
            let election =
                Election::ttl_key(client.clone(), cli.cluster.as_str(), cli.node_id(n), config.clone())?;
            nodes.push(start(election));
        }

        return supervise(nodes, &clients, failover_every).await;
    }

    let mut nodes = Vec::new();
    for client in clients.iter() {
        let election = Election::lease(client.clone(), cli.cluster.as_str(), config.clone()).await?;
        nodes.push(start(election));
    }

    supervise(nodes, &clients, failover_every).await
}

#[cfg(feature = "etcd")]
async fn run_etcd(cli: &Cli, config: ElectConfig) -> Result<()> {
    let endpoints: Vec<String> = cli.etcd_endpoints.split(',').map(|s| s.to_string()).collect();

    let mut nodes = Vec::new();
    for _ in 0..cli.nodes {
        // One connection per node, like separate processes would have.
        let store = autoelect::EtcdStore::connect(endpoints.as_slice()).await?;
        let election = Election::lease(store, cli.cluster.as_str(), config.clone()).await?;
        nodes.push(start(election));
    }

    supervise(nodes, &[], None).await
}

#[cfg(not(feature = "etcd"))]
async fn run_etcd(_cli: &Cli, _config: ElectConfig) -> Result<()> {
    anyhow::bail!("built without the `etcd` feature")
}

#[cfg(feature = "redis")]
async fn run_redis(cli: &Cli, config: ElectConfig) -> Result<()> {
    let mut nodes = Vec::new();
    for n in 0..cli.nodes {
        let store = autoelect::RedisStore::open(&cli.redis_url).await?;
        let election = Election::ttl_key(store, cli.cluster.as_str(), cli.node_id(n), config.clone())?;
        nodes.push(start(election));
    }

    supervise(nodes, &[], None).await
}

#[cfg(not(feature = "redis"))]
async fn run_redis(_cli: &Cli, _config: ElectConfig) -> Result<()> {
    anyhow::bail!("built without the `redis` feature")
}

fn start<B: LockBackend + 'static>(mut election: Election<B>) -> Running<B> {
    let node = election.node_id().to_owned();

    election
        .on_become_master({
            let node = node.clone();
            move || {
                info!(%node, "Taking over");
                async { true }
            }
        })
        .on_lost_master({
            let node = node.clone();
            move || {
                warn!(%node, "Stepping down");
                async {}
            }
        })
        .on_error(move |err| warn!(%node, error = %err, "Election error"));

    election.start()
}

async fn next_failover(failover: Option<&mut Interval>) {
    match failover {
        Some(failover) => {
            failover.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Report the master until ctrl-c, then stop every node.
async fn supervise<B: LockBackend + 'static>(
    nodes: Vec<Running<B>>,
    clients: &[MemoryClient],
    failover_every: Option<Duration>,
) -> Result<()> {
    let mut status = interval(Duration::from_secs(1));
    let mut failover = failover_every
        .filter(|_| !clients.is_empty())
        .map(|period| interval_at(Instant::now() + period, period));
    let mut last_master = None;

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res?;
                break;
            }
            _ = status.tick() => {
                let master = nodes
                    .iter()
                    .find(|node| node.is_master())
                    .map(|node| node.handle().node_id().to_owned());

                if master != last_master {
                    info!(master = master.as_deref().unwrap_or("none"), "Master changed");
                    last_master = master;
                }
            }
            _ = next_failover(failover.as_mut()) => {
                for (node, client) in nodes.iter().zip(clients) {
                    if node.is_master() {
                        warn!(node = node.handle().node_id(), "Cutting master connection");
                        client.disconnect();
                    } else if !client.is_connected() {
                        client.reconnect();
                    }
                }
            }
        }
    }

    info!("Shutting down");

    for node in nodes {
        node.shutdown().await?;
    }

    Ok(())
}
