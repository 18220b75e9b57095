//! gRPC service handlers that adapt network requests into executor calls.
//!
//! This module is the server-side counterpart to `transport.rs`.

use std::net::SocketAddr;
use std::sync::Arc;

use relay_core::QueryId;

use crate::executor::{ApplyFailure, ApplyOutcome, QueryExecutor};
use crate::volo_gen::relay::rpc;

/// gRPC service implementation backed by a shared executor.
#[derive(Clone)]
pub struct RpcService {
    pub executor: Arc<QueryExecutor>,
}

fn query_id(req: &rpc::ApplyRequest) -> Result<QueryId, volo_grpc::Status> {
    let id = req.query_id.to_string();
    if id.is_empty() {
        return Err(volo_grpc::Status::invalid_argument("missing query_id"));
    }
    Ok(QueryId::from(id))
}

fn status(err: ApplyFailure) -> volo_grpc::Status {
    let message = err.to_string();
    match err {
        ApplyFailure::NotFound(_) => volo_grpc::Status::not_found(message),
        ApplyFailure::InFlight(_) | ApplyFailure::Store(_) => {
            volo_grpc::Status::unavailable(message)
        }
        ApplyFailure::Engine(_) => volo_grpc::Status::internal(message),
    }
}

fn encode_result(result: &relay_core::ResultSet) -> Result<String, volo_grpc::Status> {
    result
        .to_json()
        .map_err(|err| volo_grpc::Status::internal(format!("{err:#}")))
}

impl rpc::SyncRpc for RpcService {
    /// Execute a query chosen for this instance by a router.
    async fn apply_from_router(
        &self,
        req: volo_grpc::Request<rpc::ApplyRequest>,
    ) -> Result<volo_grpc::Response<rpc::ApplyResponse>, volo_grpc::Status> {
        let id = query_id(&req.into_inner())?;
        let result = self.executor.apply_from_router(&id).await.map_err(|err| {
            tracing::warn!(query_id = %id, error = %err, "routed apply failed");
            status(err)
        })?;
        Ok(volo_grpc::Response::new(rpc::ApplyResponse {
            success: true,
            result_json: encode_result(&result)?.into(),
            message: "".into(),
            already_applied: false,
        }))
    }

    /// Apply a write replicated from the instance that originated it.
    async fn apply_from_sibling(
        &self,
        req: volo_grpc::Request<rpc::ApplyRequest>,
    ) -> Result<volo_grpc::Response<rpc::ApplyResponse>, volo_grpc::Status> {
        let id = query_id(&req.into_inner())?;
        let outcome = self.executor.apply_from_sibling(&id).await.map_err(|err| {
            tracing::warn!(query_id = %id, error = %err, "sibling apply failed");
            status(err)
        })?;
        let resp = match outcome {
            ApplyOutcome::Applied(result) => rpc::ApplyResponse {
                success: true,
                result_json: encode_result(&result)?.into(),
                message: "".into(),
                already_applied: false,
            },
            ApplyOutcome::AlreadyApplied => rpc::ApplyResponse {
                success: true,
                result_json: "".into(),
                message: "already applied".into(),
                already_applied: true,
            },
        };
        Ok(volo_grpc::Response::new(resp))
    }

    async fn health_check(
        &self,
        _req: volo_grpc::Request<rpc::HealthCheckRequest>,
    ) -> Result<volo_grpc::Response<rpc::HealthCheckResponse>, volo_grpc::Status> {
        let (healthy, message) = self.executor.health().await;
        Ok(volo_grpc::Response::new(rpc::HealthCheckResponse {
            healthy,
            message: message.into(),
        }))
    }
}

/// Serve the instance RPC service until the server fails.
pub async fn serve(addr: SocketAddr, executor: Arc<QueryExecutor>) -> anyhow::Result<()> {
    let service = RpcService { executor };
    let svc = rpc::SyncRpcServer::new(service);
    let svc = volo_grpc::server::ServiceBuilder::new(svc)
        .build::<rpc::SyncRpcRequestRecv, rpc::SyncRpcResponseSend>();
    tracing::info!(%addr, "instance rpc listening");
    volo_grpc::server::Server::new()
        .add_service(svc)
        .run(volo::net::Address::from(addr))
        .await
        .map_err(|err| anyhow::anyhow!("instance rpc server failed: {err}"))
}
