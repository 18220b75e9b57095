//! Instance node runtime: CLI options and startup wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use relay_core::resp_server::{self, RespServerState};
use relay_core::{ConsistencyTracker, MemoryStore, RespStore, RespStoreConfig, Roster};

use crate::engine::{PostgresEngine, StorageEngine};
use crate::executor::{ExecutorConfig, QueryExecutor};
use crate::memory_engine::MemoryEngine;
use crate::propagator::{Propagator, PropagatorConfig};
use crate::rpc_service;
use crate::transport::GrpcTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum EngineKind {
    Postgres,
    Memory,
}

/// CLI options for running an instance node.
#[derive(Parser, Debug)]
pub struct NodeArgs {
    /// Identifier of this instance; must appear in `--instances`.
    #[arg(long, env = "RELAY_INSTANCE_ID")]
    pub instance_id: String,

    #[arg(long, env = "RELAY_LISTEN_RPC", default_value = "0.0.0.0:50051")]
    pub listen_rpc: SocketAddr,

    /// Comma-separated roster like: `db1@db-1:50051,db2@db-2:50051`
    #[arg(long, env = "RELAY_INSTANCES")]
    pub instances: String,

    /// Tracking store address (`host:port`).
    #[arg(long, env = "RELAY_STORE_ADDR", default_value = "127.0.0.1:6379")]
    pub store_addr: String,

    #[arg(long, env = "RELAY_STORE_PASSWORD")]
    pub store_password: Option<String>,

    #[arg(long, env = "RELAY_STORE_TIMEOUT_MS", default_value_t = 2000)]
    pub store_timeout_ms: u64,

    #[arg(long, env = "RELAY_ENGINE", value_enum, default_value = "postgres")]
    pub engine: EngineKind,

    /// PostgreSQL connection string for the postgres engine.
    #[arg(
        long,
        env = "RELAY_DATABASE_URL",
        default_value = "host=127.0.0.1 user=postgres password=postgres dbname=postgres"
    )]
    pub database_url: String,

    /// Deadline for each RPC to a sibling instance (ms).
    #[arg(long, env = "RELAY_RPC_TIMEOUT_MS", default_value_t = 5000)]
    pub rpc_timeout_ms: u64,

    /// Delivery attempts per sibling before a replicated write is left pending.
    #[arg(long, env = "RELAY_REPLICATION_MAX_ATTEMPTS", default_value_t = 5)]
    pub replication_max_attempts: u32,

    /// Initial retry backoff for replication, doubled per attempt (ms).
    #[arg(long, env = "RELAY_REPLICATION_BACKOFF_MS", default_value_t = 100)]
    pub replication_backoff_ms: u64,

    #[arg(long, env = "RELAY_REPLICATION_QUEUE_CAPACITY", default_value_t = 4096)]
    pub replication_queue_capacity: usize,
}

/// CLI options for the development tracking store.
#[derive(Parser, Debug)]
pub struct StoreArgs {
    #[arg(long, env = "RELAY_STORE_LISTEN", default_value = "127.0.0.1:6379")]
    pub listen: SocketAddr,

    #[arg(long, env = "RELAY_STORE_PASSWORD")]
    pub password: Option<String>,
}

pub fn store_config(addr: &str, password: Option<String>, timeout_ms: u64) -> RespStoreConfig {
    let mut config = RespStoreConfig::new(addr);
    config.password = password.filter(|p| !p.is_empty());
    config.command_timeout = Duration::from_millis(timeout_ms.max(1));
    config
}

/// Connect to the store, engine and siblings, then serve RPC until ctrl-c.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    let roster = Roster::parse(&args.instances)?;
    anyhow::ensure!(
        roster.contains(&args.instance_id),
        "instance {} is not in the roster",
        args.instance_id
    );

    let store = Arc::new(RespStore::new(store_config(
        &args.store_addr,
        args.store_password.clone(),
        args.store_timeout_ms,
    )));
    if let Err(err) = store.ping().await {
        // The store may come up after us; commands will dial again.
        tracing::warn!(addr = %args.store_addr, error = %format!("{err:#}"), "tracking store not reachable yet");
    }
    let tracker = ConsistencyTracker::new(store, &roster);

    let engine: Arc<dyn StorageEngine> = match args.engine {
        EngineKind::Postgres => Arc::new(PostgresEngine::new(args.database_url.clone())),
        EngineKind::Memory => Arc::new(MemoryEngine::new()),
    };

    let transport =
        GrpcTransport::connect(&roster, Duration::from_millis(args.rpc_timeout_ms)).await?;
    let propagator = Propagator::spawn(
        args.instance_id.clone(),
        &roster,
        Arc::new(transport),
        PropagatorConfig {
            max_attempts: args.replication_max_attempts.max(1),
            base_backoff: Duration::from_millis(args.replication_backoff_ms.max(1)),
            queue_capacity: args.replication_queue_capacity.max(1),
            ..PropagatorConfig::default()
        },
    );
    let executor = Arc::new(QueryExecutor::new(
        ExecutorConfig {
            instance_id: args.instance_id.clone(),
        },
        tracker,
        engine,
        propagator,
    ));

    let (healthy, message) = executor.health().await;
    tracing::info!(
        instance = %args.instance_id,
        rpc = %args.listen_rpc,
        roster = roster.len(),
        engine = ?args.engine,
        healthy,
        message = %message,
        "instance started"
    );

    tokio::select! {
        result = rpc_service::serve(args.listen_rpc, executor) => result,
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!(instance = %args.instance_id, "shutting down");
            Ok(())
        }
    }
}

/// Serve an in-memory tracking store over RESP until ctrl-c.
pub async fn run_store(args: StoreArgs) -> anyhow::Result<()> {
    let state = Arc::new(RespServerState::new(
        Arc::new(MemoryStore::new()),
        args.password,
    ));
    tokio::select! {
        result = resp_server::run(args.listen, state) => result,
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok(())
        }
    }
}
