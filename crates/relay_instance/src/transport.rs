//! Instance RPC clients.
//!
//! `InstanceRpc` is the seam the router and the propagator call through.
//! `GrpcTransport` talks to remote instances over volo-grpc; `LocalTransport`
//! dispatches to executors in the same process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use relay_core::{InstanceId, QueryId, ResultSet, Roster};
use tokio::time;

use crate::executor::{ApplyOutcome, QueryExecutor};
use crate::volo_gen::relay::rpc;

/// Reply to an apply call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplyReply {
    pub result: ResultSet,
    pub already_applied: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReply {
    pub healthy: bool,
    pub message: String,
}

#[async_trait]
pub trait InstanceRpc: Send + Sync + 'static {
    async fn apply_from_router(&self, target: &str, query_id: &QueryId)
        -> anyhow::Result<ApplyReply>;

    async fn apply_from_sibling(
        &self,
        target: &str,
        query_id: &QueryId,
    ) -> anyhow::Result<ApplyReply>;

    async fn health_check(&self, target: &str) -> anyhow::Result<HealthReply>;
}

/// volo-grpc client per roster instance, each call bounded by `rpc_timeout`.
#[derive(Clone)]
pub struct GrpcTransport {
    clients: Arc<HashMap<InstanceId, rpc::SyncRpcClient>>,
    rpc_timeout: Duration,
}

impl GrpcTransport {
    /// Resolve every roster address and build one client per instance.
    pub async fn connect(roster: &Roster, rpc_timeout: Duration) -> anyhow::Result<Self> {
        let mut clients = HashMap::with_capacity(roster.len());
        for instance in roster.iter() {
            let endpoint = instance.endpoint();
            let addr = tokio::net::lookup_host(&endpoint)
                .await
                .with_context(|| format!("resolve instance {} at {endpoint}", instance.id))?
                .next()
                .with_context(|| format!("no address for instance {} at {endpoint}", instance.id))?;
            let client = rpc::SyncRpcClientBuilder::new("relay.rpc.SyncRpc")
                .address(volo::net::Address::from(addr))
                .build();
            tracing::debug!(instance = %instance.id, %addr, "instance client ready");
            clients.insert(instance.id.clone(), client);
        }
        Ok(Self {
            clients: Arc::new(clients),
            rpc_timeout: rpc_timeout.max(Duration::from_millis(1)),
        })
    }

    fn client(&self, target: &str) -> anyhow::Result<&rpc::SyncRpcClient> {
        self.clients
            .get(target)
            .ok_or_else(|| anyhow::anyhow!("unknown instance {target}"))
    }
}

fn apply_reply(resp: rpc::ApplyResponse) -> anyhow::Result<ApplyReply> {
    anyhow::ensure!(resp.success, "apply failed: {}", resp.message);
    Ok(ApplyReply {
        result: ResultSet::from_json(&resp.result_json)?,
        already_applied: resp.already_applied,
    })
}

#[async_trait]
impl InstanceRpc for GrpcTransport {
    async fn apply_from_router(
        &self,
        target: &str,
        query_id: &QueryId,
    ) -> anyhow::Result<ApplyReply> {
        let client = self.client(target)?;
        let request = rpc::ApplyRequest {
            query_id: query_id.to_string().into(),
        };
        let resp = match time::timeout(self.rpc_timeout, client.apply_from_router(request)).await {
            Ok(Ok(resp)) => resp.into_inner(),
            Ok(Err(err)) => anyhow::bail!("apply_from_router rpc to {target} failed: {err}"),
            Err(_) => anyhow::bail!("apply_from_router rpc to {target} timed out"),
        };
        apply_reply(resp)
    }

    async fn apply_from_sibling(
        &self,
        target: &str,
        query_id: &QueryId,
    ) -> anyhow::Result<ApplyReply> {
        let client = self.client(target)?;
        let request = rpc::ApplyRequest {
            query_id: query_id.to_string().into(),
        };
        let resp = match time::timeout(self.rpc_timeout, client.apply_from_sibling(request)).await
        {
            Ok(Ok(resp)) => resp.into_inner(),
            Ok(Err(err)) => anyhow::bail!("apply_from_sibling rpc to {target} failed: {err}"),
            Err(_) => anyhow::bail!("apply_from_sibling rpc to {target} timed out"),
        };
        apply_reply(resp)
    }

    async fn health_check(&self, target: &str) -> anyhow::Result<HealthReply> {
        let client = self.client(target)?;
        let request = rpc::HealthCheckRequest {};
        let resp = match time::timeout(self.rpc_timeout, client.health_check(request)).await {
            Ok(Ok(resp)) => resp.into_inner(),
            Ok(Err(err)) => anyhow::bail!("health_check rpc to {target} failed: {err}"),
            Err(_) => anyhow::bail!("health_check rpc to {target} timed out"),
        };
        Ok(HealthReply {
            healthy: resp.healthy,
            message: resp.message.to_string(),
        })
    }
}

/// In-process transport. Executors are registered after construction since
/// each executor's propagator needs the transport itself.
#[derive(Default)]
pub struct LocalTransport {
    executors: RwLock<HashMap<InstanceId, Arc<QueryExecutor>>>,
    unreachable: RwLock<HashSet<InstanceId>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, executor: Arc<QueryExecutor>) {
        if let Ok(mut executors) = self.executors.write() {
            executors.insert(executor.instance_id().to_string(), executor);
        }
    }

    /// Make calls to `instance` fail as if it were down.
    pub fn set_reachable(&self, instance: &str, reachable: bool) {
        if let Ok(mut unreachable) = self.unreachable.write() {
            if reachable {
                unreachable.remove(instance);
            } else {
                unreachable.insert(instance.to_string());
            }
        }
    }

    fn executor(&self, target: &str) -> anyhow::Result<Arc<QueryExecutor>> {
        let down = self
            .unreachable
            .read()
            .map(|set| set.contains(target))
            .unwrap_or(false);
        anyhow::ensure!(!down, "instance {target} is unreachable");
        self.executors
            .read()
            .map_err(|_| anyhow::anyhow!("local transport lock poisoned"))?
            .get(target)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown instance {target}"))
    }
}

#[async_trait]
impl InstanceRpc for LocalTransport {
    async fn apply_from_router(
        &self,
        target: &str,
        query_id: &QueryId,
    ) -> anyhow::Result<ApplyReply> {
        let result = self.executor(target)?.apply_from_router(query_id).await?;
        Ok(ApplyReply {
            result,
            already_applied: false,
        })
    }

    async fn apply_from_sibling(
        &self,
        target: &str,
        query_id: &QueryId,
    ) -> anyhow::Result<ApplyReply> {
        let reply = match self.executor(target)?.apply_from_sibling(query_id).await? {
            ApplyOutcome::Applied(result) => ApplyReply {
                result,
                already_applied: false,
            },
            ApplyOutcome::AlreadyApplied => ApplyReply {
                result: ResultSet::empty(),
                already_applied: true,
            },
        };
        Ok(reply)
    }

    async fn health_check(&self, target: &str) -> anyhow::Result<HealthReply> {
        let (healthy, message) = self.executor(target)?.health().await;
        Ok(HealthReply { healthy, message })
    }
}
