//! Consistency tracker.
//!
//! Every registered query lives in the tracking store until all instances in
//! the roster have applied it. Pending writes are indexed by table so the
//! router can tell which instances are caught up on the tables a query reads.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;

use crate::keys;
use crate::store::TrackingStore;
use crate::types::{unix_time_ms, InstanceId, Query, QueryDraft, QueryId, Roster};

#[derive(Clone)]
pub struct ConsistencyTracker {
    store: Arc<dyn TrackingStore>,
    roster: BTreeSet<InstanceId>,
}

impl ConsistencyTracker {
    pub fn new(store: Arc<dyn TrackingStore>, roster: &Roster) -> Self {
        Self {
            store,
            roster: roster.ids(),
        }
    }

    pub fn roster(&self) -> &BTreeSet<InstanceId> {
        &self.roster
    }

    /// Register a query and return its fresh id.
    pub async fn create(&self, draft: QueryDraft) -> anyhow::Result<QueryId> {
        let query = Query {
            id: QueryId::generate(),
            sql: draft.sql,
            kind: draft.kind,
            tables: draft.tables,
            connection_id: draft.connection_id,
            created_at_ms: unix_time_ms(),
        };
        let body = serde_json::to_vec(&query).context("encode query body")?;
        self.store.set(&keys::query_body(&query.id), body).await?;

        // The body is written first so an indexed id always resolves.
        if query.kind.is_write() {
            for table in &query.tables {
                self.store
                    .sadd(&keys::table_writes(table), query.id.as_str())
                    .await?;
            }
        }
        tracing::debug!(query_id = %query.id, kind = ?query.kind, tables = ?query.tables, "query registered");
        Ok(query.id)
    }

    /// Fetch a query body. `None` means unknown or already retired.
    pub async fn get(&self, id: &QueryId) -> anyhow::Result<Option<Query>> {
        let Some(body) = self.store.get(&keys::query_body(id)).await? else {
            return Ok(None);
        };
        let query = serde_json::from_slice(&body)
            .with_context(|| format!("decode query body {id}"))?;
        Ok(Some(query))
    }

    pub async fn executed_instances(&self, id: &QueryId) -> anyhow::Result<BTreeSet<InstanceId>> {
        self.store.smembers(&keys::query_executed(id)).await
    }

    /// Record that `instance` applied the query.
    ///
    /// Returns `true` when the execution set now covers the whole roster, in
    /// which case the query has been retired.
    pub async fn mark_executed(&self, id: &QueryId, instance: &str) -> anyhow::Result<bool> {
        let executed_key = keys::query_executed(id);
        self.store.sadd(&executed_key, instance).await?;
        let executed = self.store.smembers(&executed_key).await?;
        if !self.roster.is_subset(&executed) {
            tracing::debug!(query_id = %id, instance, applied = executed.len(), roster = self.roster.len(), "query applied");
            return Ok(false);
        }
        self.store
            .del(&[keys::query_body(id), executed_key])
            .await?;
        tracing::info!(query_id = %id, "query converged on all instances, retired");
        Ok(true)
    }

    /// Drop a query's tracking state without waiting for convergence.
    pub async fn retire(&self, id: &QueryId) -> anyhow::Result<()> {
        self.store
            .del(&[keys::query_body(id), keys::query_executed(id)])
            .await?;
        tracing::debug!(query_id = %id, "query retired");
        Ok(())
    }

    /// Instances that have applied every pending write on `tables`.
    pub async fn synced_instances(
        &self,
        tables: &BTreeSet<String>,
    ) -> anyhow::Result<BTreeSet<InstanceId>> {
        let mut synced = self.roster.clone();
        for table in tables {
            let index_key = keys::table_writes(table);
            for raw_id in self.store.smembers(&index_key).await? {
                let id = QueryId::from(raw_id);
                if self.store.get(&keys::query_body(&id)).await?.is_none() {
                    // Retired since it was indexed.
                    self.store.srem(&index_key, id.as_str()).await?;
                    continue;
                }
                let executed = self.executed_instances(&id).await?;
                synced.retain(|instance| executed.contains(instance));
            }
            if synced.is_empty() {
                break;
            }
        }
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::QueryKind;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn tracker(store: Arc<MemoryStore>) -> ConsistencyTracker {
        ConsistencyTracker::new(store, &Roster::from_ids(["A", "B", "C"]))
    }

    fn write_on(table: &str) -> QueryDraft {
        QueryDraft {
            sql: format!("INSERT INTO {table} (id) VALUES (1)"),
            kind: QueryKind::Write,
            tables: set(&[table]),
            connection_id: "conn-1".to_string(),
        }
    }

    #[tokio::test]
    async fn write_excludes_lagging_instances_until_converged() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());
        let orders = set(&["orders"]);

        let q1 = tracker.create(write_on("orders")).await.unwrap();
        assert!(tracker.synced_instances(&orders).await.unwrap().is_empty());

        assert!(!tracker.mark_executed(&q1, "A").await.unwrap());
        assert!(!tracker.mark_executed(&q1, "B").await.unwrap());
        let synced = tracker.synced_instances(&orders).await.unwrap();
        assert!(!synced.contains("C"));
        assert_eq!(synced, set(&["A", "B"]));

        assert!(tracker.mark_executed(&q1, "C").await.unwrap());
        assert_eq!(tracker.get(&q1).await.unwrap(), None);
        assert_eq!(
            tracker.synced_instances(&orders).await.unwrap(),
            set(&["A", "B", "C"])
        );
        // Lazy pruning left nothing behind.
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn execution_set_is_monotonic_and_idempotent() {
        let tracker = tracker(Arc::new(MemoryStore::new()));
        let q = tracker.create(write_on("users")).await.unwrap();

        tracker.mark_executed(&q, "A").await.unwrap();
        tracker.mark_executed(&q, "A").await.unwrap();
        assert_eq!(tracker.executed_instances(&q).await.unwrap(), set(&["A"]));

        tracker.mark_executed(&q, "B").await.unwrap();
        assert_eq!(tracker.executed_instances(&q).await.unwrap(), set(&["A", "B"]));
    }

    #[tokio::test]
    async fn unrelated_tables_stay_fully_synced() {
        let tracker = tracker(Arc::new(MemoryStore::new()));
        let q = tracker.create(write_on("orders")).await.unwrap();
        tracker.mark_executed(&q, "A").await.unwrap();

        assert_eq!(
            tracker.synced_instances(&set(&["users"])).await.unwrap(),
            set(&["A", "B", "C"])
        );
        assert_eq!(
            tracker.synced_instances(&BTreeSet::new()).await.unwrap(),
            set(&["A", "B", "C"])
        );
    }

    #[tokio::test]
    async fn pending_writes_intersect_across_tables() {
        let tracker = tracker(Arc::new(MemoryStore::new()));
        let q1 = tracker.create(write_on("orders")).await.unwrap();
        let q2 = tracker.create(write_on("users")).await.unwrap();
        for instance in ["A", "B"] {
            tracker.mark_executed(&q1, instance).await.unwrap();
        }
        for instance in ["B", "C"] {
            tracker.mark_executed(&q2, instance).await.unwrap();
        }
        assert_eq!(
            tracker.synced_instances(&set(&["orders", "users"])).await.unwrap(),
            set(&["B"])
        );
    }

    #[tokio::test]
    async fn reads_are_not_indexed_and_can_be_retired() {
        let store = Arc::new(MemoryStore::new());
        let tracker = tracker(store.clone());
        let read = tracker
            .create(QueryDraft {
                sql: "SELECT * FROM users".to_string(),
                kind: QueryKind::Read,
                tables: set(&["users"]),
                connection_id: "conn-2".to_string(),
            })
            .await
            .unwrap();

        let query = tracker.get(&read).await.unwrap().unwrap();
        assert_eq!(query.kind, QueryKind::Read);
        assert_eq!(
            tracker.synced_instances(&set(&["users"])).await.unwrap(),
            set(&["A", "B", "C"])
        );

        tracker.mark_executed(&read, "A").await.unwrap();
        tracker.retire(&read).await.unwrap();
        assert_eq!(tracker.get(&read).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn unknown_query_is_absent_not_an_error() {
        let tracker = tracker(Arc::new(MemoryStore::new()));
        assert_eq!(tracker.get(&QueryId::from("missing")).await.unwrap(), None);
    }
}
