//! In-process cluster of instances sharing one tracking store.
//!
//! Every instance gets a [`MemoryEngine`] and talks to its siblings through a
//! [`LocalTransport`]; used by tests and by embedders that want the whole
//! relay in one process.

use std::collections::BTreeMap;
use std::sync::Arc;

use relay_core::{ConsistencyTracker, InstanceId, Roster, TrackingStore};

use crate::engine::StorageEngine;
use crate::executor::{ExecutorConfig, QueryExecutor};
use crate::memory_engine::MemoryEngine;
use crate::propagator::{Propagator, PropagatorConfig};
use crate::transport::LocalTransport;

pub struct LocalCluster {
    pub roster: Roster,
    pub tracker: ConsistencyTracker,
    pub transport: Arc<LocalTransport>,
    pub engines: BTreeMap<InstanceId, Arc<MemoryEngine>>,
}

impl LocalCluster {
    /// Build and register one executor per id. Must run inside a tokio runtime.
    pub fn start<I, S>(ids: I, store: Arc<dyn TrackingStore>, replication: PropagatorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InstanceId>,
    {
        let roster = Roster::from_ids(ids);
        let tracker = ConsistencyTracker::new(store, &roster);
        let transport = Arc::new(LocalTransport::new());
        let mut engines = BTreeMap::new();

        for instance in roster.iter() {
            let engine = Arc::new(MemoryEngine::new());
            let propagator = Propagator::spawn(
                instance.id.clone(),
                &roster,
                transport.clone(),
                replication.clone(),
            );
            let executor = QueryExecutor::new(
                ExecutorConfig {
                    instance_id: instance.id.clone(),
                },
                tracker.clone(),
                engine.clone() as Arc<dyn StorageEngine>,
                propagator,
            );
            transport.register(Arc::new(executor));
            engines.insert(instance.id.clone(), engine);
        }

        Self {
            roster,
            tracker,
            transport,
            engines,
        }
    }

    pub fn engine(&self, id: &str) -> Option<&Arc<MemoryEngine>> {
        self.engines.get(id)
    }

    /// Run `sql` directly on every engine, bypassing tracking. Used to create
    /// schema before traffic starts.
    pub async fn execute_everywhere(&self, sql: &str) -> anyhow::Result<()> {
        for engine in self.engines.values() {
            engine.execute(sql).await?;
        }
        Ok(())
    }
}
