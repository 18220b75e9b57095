//! Instance router.
//!
//! Registers each query with the tracker and sends its id to one instance
//! that has applied every pending write on the tables the query touches.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::seq::IteratorRandom;
use relay_core::{ConsistencyTracker, InstanceId, QueryDraft, ResultSet};
use relay_instance::InstanceRpc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    Rows(ResultSet),
    /// Every instance lags on at least one referenced table.
    NoSyncedInstance,
}

pub struct InstanceRouter {
    tracker: ConsistencyTracker,
    rpc: Arc<dyn InstanceRpc>,
}

impl InstanceRouter {
    pub fn new(tracker: ConsistencyTracker, rpc: Arc<dyn InstanceRpc>) -> Self {
        Self { tracker, rpc }
    }

    pub fn tracker(&self) -> &ConsistencyTracker {
        &self.tracker
    }

    /// Uniformly random pick; the only selection policy so far.
    fn pick(candidates: &BTreeSet<InstanceId>) -> Option<InstanceId> {
        candidates.iter().choose(&mut rand::thread_rng()).cloned()
    }

    pub async fn route(&self, draft: QueryDraft) -> anyhow::Result<RouteOutcome> {
        // Eligibility is computed before registering, so a new write never
        // waits on itself and nothing is registered when no instance qualifies.
        let synced = self.tracker.synced_instances(&draft.tables).await?;
        let Some(target) = Self::pick(&synced) else {
            tracing::warn!(tables = ?draft.tables, kind = ?draft.kind, "no synced instance available");
            return Ok(RouteOutcome::NoSyncedInstance);
        };

        let kind = draft.kind;
        let query_id = self.tracker.create(draft).await?;
        tracing::debug!(query_id = %query_id, instance = %target, kind = ?kind, candidates = synced.len(), "routing query");

        match self.rpc.apply_from_router(&target, &query_id).await {
            Ok(reply) => Ok(RouteOutcome::Rows(reply.result)),
            Err(err) => {
                // The instance may have executed the query before the call
                // failed, so the record stays pending until it converges.
                tracing::warn!(
                    query_id = %query_id,
                    instance = %target,
                    kind = ?kind,
                    error = %format!("{err:#}"),
                    "routed call failed, query left pending"
                );
                Err(err.context(format!("query {query_id} failed on instance {target}")))
            }
        }
    }

    /// Ask every roster instance for its health. Failures are reported as
    /// unhealthy entries.
    pub async fn health(&self) -> Vec<(InstanceId, bool, String)> {
        let mut report = Vec::with_capacity(self.tracker.roster().len());
        for instance in self.tracker.roster() {
            let entry = match self.rpc.health_check(instance).await {
                Ok(reply) => (instance.clone(), reply.healthy, reply.message),
                Err(err) => (instance.clone(), false, format!("{err:#}")),
            };
            report.push(entry);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use relay_core::{MemoryStore, QueryKind, TrackingStore};
    use relay_instance::{LocalCluster, PropagatorConfig};

    fn users() -> BTreeSet<String> {
        BTreeSet::from(["users".to_string()])
    }

    fn draft(sql: &str, kind: QueryKind) -> QueryDraft {
        QueryDraft {
            sql: sql.to_string(),
            kind,
            tables: users(),
            connection_id: "c1".to_string(),
        }
    }

    async fn setup() -> (LocalCluster, InstanceRouter) {
        let cluster = LocalCluster::start(
            ["A", "B"],
            Arc::new(MemoryStore::new()),
            PropagatorConfig::default(),
        );
        cluster
            .execute_everywhere("CREATE TABLE users (id TEXT, name TEXT)")
            .await
            .unwrap();
        let router = InstanceRouter::new(cluster.tracker.clone(), cluster.transport.clone());
        (cluster, router)
    }

    #[tokio::test]
    async fn no_synced_instance_registers_nothing() {
        let (cluster, router) = setup().await;
        // A pending write nobody has applied blocks the table everywhere.
        let blocker = cluster
            .tracker
            .create(draft("INSERT INTO users VALUES ('x', 'y')", QueryKind::Write))
            .await
            .unwrap();

        let outcome = router
            .route(draft("SELECT * FROM users", QueryKind::Read))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::NoSyncedInstance);
        assert!(cluster.tracker.get(&blocker).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn read_goes_to_a_synced_instance() {
        let (cluster, router) = setup().await;
        let lagging = cluster
            .tracker
            .create(draft("INSERT INTO users VALUES ('u1', 'Ada')", QueryKind::Write))
            .await
            .unwrap();
        cluster.transport.apply_from_sibling("B", &lagging).await.unwrap();

        for _ in 0..10 {
            let outcome = router
                .route(draft("SELECT name FROM users", QueryKind::Read))
                .await
                .unwrap();
            // Only B has the row, and only B is eligible.
            assert_eq!(
                outcome,
                RouteOutcome::Rows(ResultSet {
                    columns: vec!["name".to_string()],
                    rows: vec![vec![Some("Ada".to_string())]],
                })
            );
        }
        let a_reads = cluster
            .engine("A")
            .map(|e| e.executed().iter().filter(|s| s.starts_with("SELECT")).count());
        assert_eq!(a_reads, Some(0));
    }

    #[tokio::test]
    async fn failed_call_leaves_query_pending() {
        let (cluster, router) = setup().await;
        cluster.transport.set_reachable("A", false);
        cluster.transport.set_reachable("B", false);

        let err = router
            .route(draft("INSERT INTO users VALUES ('u2', 'Bo')", QueryKind::Write))
            .await;
        assert!(err.is_err());
        // Nobody is known to have applied the write, so nobody is synced.
        assert!(cluster.tracker.synced_instances(&users()).await.unwrap().is_empty());
    }

    /// Fails the first SADD that records an instance as having executed a
    /// query; every other call goes straight to the inner store.
    struct FailFirstExecutedAdd {
        inner: MemoryStore,
        instances: BTreeSet<String>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl TrackingStore for FailFirstExecutedAdd {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
            self.inner.set(key, value).await
        }
        async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
            if self.instances.contains(member) && !self.failed.swap(true, Ordering::SeqCst) {
                anyhow::bail!("store timed out");
            }
            self.inner.sadd(key, member).await
        }
        async fn smembers(&self, key: &str) -> anyhow::Result<BTreeSet<String>> {
            self.inner.smembers(key).await
        }
        async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
            self.inner.srem(key, member).await
        }
        async fn del(&self, keys: &[String]) -> anyhow::Result<()> {
            self.inner.del(keys).await
        }
    }

    #[tokio::test]
    async fn write_applied_before_store_failure_stays_pending() {
        let store = Arc::new(FailFirstExecutedAdd {
            inner: MemoryStore::new(),
            instances: BTreeSet::from(["A".to_string(), "B".to_string(), "C".to_string()]),
            failed: AtomicBool::new(false),
        });
        let cluster = LocalCluster::start(["A", "B", "C"], store.clone(), PropagatorConfig::default());
        cluster
            .execute_everywhere("CREATE TABLE users (id TEXT, name TEXT)")
            .await
            .unwrap();
        let router = InstanceRouter::new(cluster.tracker.clone(), cluster.transport.clone());

        let result = router
            .route(draft("INSERT INTO users (id, name) VALUES ('u1', 'Ada')", QueryKind::Write))
            .await;
        assert!(result.is_err());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        // The chosen instance has the row even though recording it failed.
        let rows: Vec<usize> = ["A", "B", "C"]
            .iter()
            .map(|id| cluster.engine(id).map(|e| e.row_count("users")).unwrap_or(0))
            .collect();
        assert_eq!(rows.iter().sum::<usize>(), 1);

        // The record survives, so no instance counts as synced on the table.
        assert!(!store.inner.is_empty());
        assert!(cluster.tracker.synced_instances(&users()).await.unwrap().is_empty());
        let outcome = router
            .route(draft("SELECT name FROM users", QueryKind::Read))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::NoSyncedInstance);
    }

    #[tokio::test]
    async fn health_reports_every_instance() {
        let (cluster, router) = setup().await;
        cluster.transport.set_reachable("B", false);
        let report = router.health().await;
        assert_eq!(report.len(), 2);
        assert!(report[0].1);
        assert!(!report[1].1);
    }
}
