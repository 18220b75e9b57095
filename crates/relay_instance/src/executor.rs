//! Per-instance query executor.
//!
//! Receives query ids from the router or from the instance that originated a
//! write, fetches the body from the tracker, runs it on the local engine and
//! records progress. Only router-originated writes are fanned out; sibling
//! applies never propagate further.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use relay_core::{ConsistencyTracker, InstanceId, QueryId, ResultSet};

use crate::engine::StorageEngine;
use crate::propagator::Propagator;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    pub instance_id: InstanceId,
}

/// Result of a sibling apply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(ResultSet),
    /// The query was already applied here or has already converged.
    AlreadyApplied,
}

#[derive(Debug)]
pub enum ApplyFailure {
    /// A routed query id has no body in the tracker.
    NotFound(QueryId),
    /// Another apply of the same query is running on this instance.
    InFlight(QueryId),
    Store(anyhow::Error),
    Engine(anyhow::Error),
}

impl fmt::Display for ApplyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyFailure::NotFound(id) => write!(f, "query {id} not found"),
            ApplyFailure::InFlight(id) => write!(f, "query {id} is already being applied"),
            ApplyFailure::Store(err) => write!(f, "tracking store error: {err:#}"),
            ApplyFailure::Engine(err) => write!(f, "storage engine error: {err:#}"),
        }
    }
}

impl std::error::Error for ApplyFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApplyFailure::Store(err) | ApplyFailure::Engine(err) => Some(&**err),
            _ => None,
        }
    }
}

pub struct QueryExecutor {
    instance_id: InstanceId,
    tracker: ConsistencyTracker,
    engine: Arc<dyn StorageEngine>,
    propagator: Propagator,
    inflight: Mutex<HashSet<QueryId>>,
}

/// Removes the claimed id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<QueryId>>,
    id: QueryId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.id);
        }
    }
}

impl QueryExecutor {
    pub fn new(
        config: ExecutorConfig,
        tracker: ConsistencyTracker,
        engine: Arc<dyn StorageEngine>,
        propagator: Propagator,
    ) -> Self {
        Self {
            instance_id: config.instance_id,
            tracker,
            engine,
            propagator,
            inflight: Mutex::new(HashSet::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn claim(&self, id: &QueryId) -> Option<InFlightGuard<'_>> {
        let mut set = self.inflight.lock().ok()?;
        if !set.insert(id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: &self.inflight,
            id: id.clone(),
        })
    }

    /// Execute a query the router chose this instance for.
    pub async fn apply_from_router(&self, id: &QueryId) -> Result<ResultSet, ApplyFailure> {
        let query = self
            .tracker
            .get(id)
            .await
            .map_err(ApplyFailure::Store)?
            .ok_or_else(|| ApplyFailure::NotFound(id.clone()))?;

        let result = self
            .engine
            .execute(&query.sql)
            .await
            .map_err(ApplyFailure::Engine)?;
        let converged = self
            .tracker
            .mark_executed(id, &self.instance_id)
            .await
            .map_err(ApplyFailure::Store)?;
        tracing::debug!(
            query_id = %id,
            instance = %self.instance_id,
            kind = ?query.kind,
            rows = result.rows.len(),
            "applied routed query"
        );

        if converged {
            return Ok(result);
        }
        if query.kind.is_write() {
            self.propagator.enqueue(id.clone()).await;
        } else {
            self.tracker.retire(id).await.map_err(ApplyFailure::Store)?;
        }
        Ok(result)
    }

    /// Apply a write replicated from the instance that originated it.
    pub async fn apply_from_sibling(&self, id: &QueryId) -> Result<ApplyOutcome, ApplyFailure> {
        let Some(_guard) = self.claim(id) else {
            return Err(ApplyFailure::InFlight(id.clone()));
        };

        let Some(query) = self.tracker.get(id).await.map_err(ApplyFailure::Store)? else {
            tracing::debug!(query_id = %id, instance = %self.instance_id, "sibling apply for retired query");
            return Ok(ApplyOutcome::AlreadyApplied);
        };
        let executed = self
            .tracker
            .executed_instances(id)
            .await
            .map_err(ApplyFailure::Store)?;
        if executed.contains(&self.instance_id) {
            tracing::debug!(query_id = %id, instance = %self.instance_id, "duplicate sibling apply ignored");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let result = self
            .engine
            .execute(&query.sql)
            .await
            .map_err(ApplyFailure::Engine)?;
        self.tracker
            .mark_executed(id, &self.instance_id)
            .await
            .map_err(ApplyFailure::Store)?;
        tracing::debug!(query_id = %id, instance = %self.instance_id, "applied replicated write");
        Ok(ApplyOutcome::Applied(result))
    }

    /// Probe the local engine. Failures are reported, not returned as errors.
    pub async fn health(&self) -> (bool, String) {
        match self.engine.health_check().await {
            Ok(()) => (true, "ok".to_string()),
            Err(err) => {
                tracing::warn!(instance = %self.instance_id, error = ?err, "health check failed");
                (false, format!("{err:#}"))
            }
        }
    }
}
