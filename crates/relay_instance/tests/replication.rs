use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use relay_core::{MemoryStore, QueryDraft, QueryId, QueryKind};
use relay_instance::{ApplyFailure, ApplyOutcome, InstanceRpc, LocalCluster, PropagatorConfig};

const SCHEMA: &str = "CREATE TABLE users (id TEXT PRIMARY KEY, name TEXT)";

fn fast_retries(max_attempts: u32) -> PropagatorConfig {
    PropagatorConfig {
        max_attempts,
        base_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        queue_capacity: 64,
    }
}

async fn cluster(max_attempts: u32) -> anyhow::Result<(LocalCluster, Arc<MemoryStore>)> {
    let store = Arc::new(MemoryStore::new());
    let cluster = LocalCluster::start(["A", "B", "C"], store.clone(), fast_retries(max_attempts));
    cluster.execute_everywhere(SCHEMA).await?;
    Ok((cluster, store))
}

fn users() -> BTreeSet<String> {
    BTreeSet::from(["users".to_string()])
}

fn draft(sql: &str, kind: QueryKind) -> QueryDraft {
    QueryDraft {
        sql: sql.to_string(),
        kind,
        tables: users(),
        connection_id: "test".to_string(),
    }
}

async fn wait_retired(cluster: &LocalCluster, id: &QueryId) -> anyhow::Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if cluster.tracker.get(id).await?.is_none() {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("query {id} never converged"))?
}

fn executions(cluster: &LocalCluster, instance: &str, needle: &str) -> usize {
    cluster
        .engine(instance)
        .map(|engine| {
            engine
                .executed()
                .iter()
                .filter(|sql| sql.contains(needle))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn routed_write_replicates_to_every_instance() -> anyhow::Result<()> {
    let (cluster, store) = cluster(3).await?;
    let id = cluster
        .tracker
        .create(draft(
            "INSERT INTO users (id, name) VALUES ('u1', 'Ada') RETURNING *",
            QueryKind::Write,
        ))
        .await?;

    let reply = cluster.transport.apply_from_router("B", &id).await?;
    assert_eq!(reply.result.rows.len(), 1);

    wait_retired(&cluster, &id).await?;
    for instance in ["A", "B", "C"] {
        assert_eq!(cluster.engine(instance).map(|e| e.row_count("users")), Some(1));
    }
    assert_eq!(cluster.tracker.synced_instances(&users()).await?.len(), 3);
    assert!(store.is_empty());
    Ok(())
}

#[tokio::test]
async fn sibling_apply_is_idempotent() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(1).await?;
    let id = cluster
        .tracker
        .create(draft(
            "INSERT INTO users (id, name) VALUES ('u2', 'Bo')",
            QueryKind::Write,
        ))
        .await?;

    let first = cluster.transport.apply_from_sibling("C", &id).await?;
    assert!(!first.already_applied);
    let second = cluster.transport.apply_from_sibling("C", &id).await?;
    assert!(second.already_applied);

    assert_eq!(executions(&cluster, "C", "'u2'"), 1);
    assert_eq!(
        cluster.tracker.executed_instances(&id).await?,
        BTreeSet::from(["C".to_string()])
    );
    Ok(())
}

#[tokio::test]
async fn sibling_apply_does_not_fan_out() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(1).await?;
    let id = cluster
        .tracker
        .create(draft(
            "INSERT INTO users (id, name) VALUES ('u3', 'Cy')",
            QueryKind::Write,
        ))
        .await?;

    cluster.transport.apply_from_sibling("A", &id).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(executions(&cluster, "B", "'u3'"), 0);
    assert_eq!(executions(&cluster, "C", "'u3'"), 0);
    assert!(cluster.tracker.get(&id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn sibling_apply_of_retired_query_is_a_no_op() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(1).await?;
    let outcome = cluster
        .transport
        .apply_from_sibling("A", &QueryId::from("gone"))
        .await?;
    assert!(outcome.already_applied);
    assert_eq!(executions(&cluster, "A", "INSERT"), 0);
    Ok(())
}

#[tokio::test]
async fn routed_read_is_served_once_and_retired() -> anyhow::Result<()> {
    let (cluster, store) = cluster(1).await?;
    cluster.execute_everywhere("INSERT INTO users (id, name) VALUES ('u1', 'Ada')").await?;

    let id = cluster
        .tracker
        .create(draft("SELECT name FROM users WHERE id = 'u1'", QueryKind::Read))
        .await?;
    let reply = cluster.transport.apply_from_router("A", &id).await?;
    assert_eq!(reply.result.rows, vec![vec![Some("Ada".to_string())]]);

    assert!(cluster.tracker.get(&id).await?.is_none());
    assert!(store.is_empty());
    assert_eq!(executions(&cluster, "B", "SELECT"), 0);
    Ok(())
}

#[tokio::test]
async fn routed_unknown_query_is_not_found() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(1).await?;
    let err = cluster
        .transport
        .apply_from_router("A", &QueryId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApplyFailure>(),
        Some(ApplyFailure::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn unreachable_sibling_keeps_write_pending_until_reapplied() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(2).await?;
    cluster.transport.set_reachable("C", false);

    let id = cluster
        .tracker
        .create(draft(
            "INSERT INTO users (id, name) VALUES ('u4', 'Di')",
            QueryKind::Write,
        ))
        .await?;
    cluster.transport.apply_from_router("A", &id).await?;

    // B receives the write; C never does.
    tokio::time::timeout(Duration::from_secs(5), async {
        while executions(&cluster, "B", "'u4'") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let synced = cluster.tracker.synced_instances(&users()).await?;
    assert_eq!(synced, BTreeSet::from(["A".to_string(), "B".to_string()]));
    assert!(cluster.tracker.get(&id).await?.is_some());

    cluster.transport.set_reachable("C", true);
    let reply = cluster.transport.apply_from_sibling("C", &id).await?;
    assert!(!reply.already_applied);
    assert!(cluster.tracker.get(&id).await?.is_none());
    assert_eq!(cluster.tracker.synced_instances(&users()).await?.len(), 3);
    Ok(())
}

#[tokio::test]
async fn engine_failure_leaves_query_pending() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(1).await?;
    let id = cluster
        .tracker
        .create(draft(
            "INSERT INTO users (id, name) VALUES ('u5', 'Ed')",
            QueryKind::Write,
        ))
        .await?;

    let engine = cluster.engine("A").cloned().ok_or_else(|| anyhow::anyhow!("no engine A"))?;
    engine.set_failing(true);
    let err = cluster.transport.apply_from_router("A", &id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ApplyFailure>(),
        Some(ApplyFailure::Engine(_))
    ));
    assert!(cluster.tracker.get(&id).await?.is_some());
    assert!(cluster.tracker.executed_instances(&id).await?.is_empty());

    let health = cluster.transport.health_check("A").await?;
    assert!(!health.healthy);
    engine.set_failing(false);
    assert!(cluster.transport.health_check("A").await?.healthy);
    Ok(())
}

#[tokio::test]
async fn sibling_apply_outcome_reports_rows() -> anyhow::Result<()> {
    let (cluster, _store) = cluster(1).await?;
    let id = cluster
        .tracker
        .create(draft(
            "INSERT INTO users (id, name) VALUES ('u6', 'Fi') RETURNING id",
            QueryKind::Write,
        ))
        .await?;
    let executor_reply = cluster.transport.apply_from_sibling("B", &id).await?;
    assert_eq!(
        ApplyOutcome::Applied(executor_reply.result),
        ApplyOutcome::Applied(relay_core::ResultSet {
            columns: vec!["id".to_string()],
            rows: vec![vec![Some("u6".to_string())]],
        })
    );
    Ok(())
}
