//! Write replication outbox.
//!
//! After an instance applies a routed write that has not yet converged, the
//! query id is queued here. A background worker fans it out to every sibling
//! concurrently, retrying each sibling with exponential backoff. Sibling
//! applies are idempotent, so redelivery is always safe; a sibling that stays
//! unreachable leaves the query pending in the tracker, which keeps readers
//! away from the lagging instance.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use relay_core::{InstanceId, QueryId, Roster};
use tokio::sync::mpsc;
use tokio::time;

use crate::transport::InstanceRpc;

#[derive(Clone, Debug)]
pub struct PropagatorConfig {
    /// Attempts per sibling before giving up on this delivery.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub queue_capacity: usize,
}

impl Default for PropagatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            queue_capacity: 4096,
        }
    }
}

impl PropagatorConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Handle to the replication worker.
#[derive(Clone)]
pub struct Propagator {
    tx: mpsc::Sender<QueryId>,
}

impl Propagator {
    /// Start the worker fanning out from `origin` to the rest of `roster`.
    pub fn spawn(
        origin: InstanceId,
        roster: &Roster,
        rpc: Arc<dyn InstanceRpc>,
        config: PropagatorConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let siblings: Vec<InstanceId> = roster.siblings(&origin).map(|a| a.id.clone()).collect();
        tokio::spawn(run_worker(origin, siblings, rpc, Arc::new(config), rx));
        Self { tx }
    }

    /// Queue a write for fan-out. Waits when the queue is full.
    pub async fn enqueue(&self, query_id: QueryId) {
        if let Err(err) = self.tx.send(query_id).await {
            tracing::error!(query_id = %err.0, "replication worker stopped, write left pending");
        }
    }
}

async fn run_worker(
    origin: InstanceId,
    siblings: Vec<InstanceId>,
    rpc: Arc<dyn InstanceRpc>,
    config: Arc<PropagatorConfig>,
    mut rx: mpsc::Receiver<QueryId>,
) {
    let siblings = Arc::new(siblings);
    while let Some(query_id) = rx.recv().await {
        let origin = origin.clone();
        let siblings = siblings.clone();
        let rpc = rpc.clone();
        let config = config.clone();
        // Deliveries run independently so one slow sibling does not hold up
        // later writes.
        tokio::spawn(async move {
            fan_out(&origin, &siblings, rpc.as_ref(), &config, &query_id).await;
        });
    }
    tracing::debug!(instance = %origin, "replication worker stopped");
}

async fn fan_out(
    origin: &str,
    siblings: &[InstanceId],
    rpc: &dyn InstanceRpc,
    config: &PropagatorConfig,
    query_id: &QueryId,
) {
    let mut deliveries = siblings
        .iter()
        .map(|sibling| async move {
            let delivered = deliver(rpc, config, sibling, query_id).await;
            (sibling, delivered)
        })
        .collect::<FuturesUnordered<_>>();

    let mut failed = 0usize;
    while let Some((sibling, delivered)) = deliveries.next().await {
        if !delivered {
            failed += 1;
            tracing::error!(
                query_id = %query_id,
                instance = %origin,
                sibling = %sibling,
                attempts = config.max_attempts,
                "replication gave up, write stays pending until re-applied"
            );
        }
    }
    tracing::debug!(query_id = %query_id, instance = %origin, siblings = siblings.len(), failed, "replication finished");
}

async fn deliver(
    rpc: &dyn InstanceRpc,
    config: &PropagatorConfig,
    sibling: &str,
    query_id: &QueryId,
) -> bool {
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match rpc.apply_from_sibling(sibling, query_id).await {
            Ok(reply) => {
                tracing::debug!(
                    query_id = %query_id,
                    sibling = %sibling,
                    attempt,
                    already_applied = reply.already_applied,
                    "replicated write"
                );
                return true;
            }
            Err(err) => {
                tracing::warn!(
                    query_id = %query_id,
                    sibling = %sibling,
                    attempt,
                    error = %format!("{err:#}"),
                    "replication attempt failed"
                );
                if attempt < max_attempts {
                    time::sleep(config.backoff(attempt)).await;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = PropagatorConfig {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            queue_capacity: 1,
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(40), Duration::from_millis(500));
    }
}
