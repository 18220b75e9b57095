//! Proxy runtime: CLI options and startup wiring.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay_core::{ConsistencyTracker, RespStore, Roster};
use relay_instance::node::store_config;
use relay_instance::GrpcTransport;

use crate::router::InstanceRouter;
use crate::server::ProxyServer;
use crate::session::SessionConfig;

/// CLI options for running a proxy.
#[derive(Parser, Debug)]
#[command(name = "relay-proxy")]
pub struct ProxyArgs {
    #[arg(long, env = "RELAY_LISTEN_PG", default_value = "0.0.0.0:5432")]
    pub listen_pg: SocketAddr,

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

    /// Deadline for each routed call to an instance (ms).
    #[arg(long, env = "RELAY_RPC_TIMEOUT_MS", default_value_t = 5000)]
    pub rpc_timeout_ms: u64,

    /// Version string reported to clients at startup.
    #[arg(long, env = "RELAY_SERVER_VERSION", default_value = "15.4")]
    pub server_version: String,
}

pub async fn run_proxy(args: ProxyArgs) -> anyhow::Result<()> {
    let roster = Roster::parse(&args.instances)?;

    let store = Arc::new(RespStore::new(store_config(
        &args.store_addr,
        args.store_password.clone(),
        args.store_timeout_ms,
    )));
    if let Err(err) = store.ping().await {
        tracing::warn!(addr = %args.store_addr, error = %format!("{err:#}"), "tracking store not reachable yet");
    }
    let tracker = ConsistencyTracker::new(store, &roster);
    let transport =
        GrpcTransport::connect(&roster, Duration::from_millis(args.rpc_timeout_ms)).await?;
    let router = Arc::new(InstanceRouter::new(tracker, Arc::new(transport)));

    for (instance, healthy, message) in router.health().await {
        if healthy {
            tracing::info!(instance = %instance, message = %message, "instance healthy");
        } else {
            tracing::warn!(instance = %instance, message = %message, "instance unhealthy");
        }
    }

    let server = ProxyServer::new(
        router,
        SessionConfig {
            server_version: args.server_version.clone(),
        },
    );
    tracing::info!(pg = %args.listen_pg, roster = roster.len(), "proxy started");

    tokio::select! {
        result = server.run(args.listen_pg) => result,
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutting down");
            Ok(())
        }
    }
}
