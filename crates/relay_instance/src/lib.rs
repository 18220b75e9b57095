//! Relay instance node.
//!
//! An instance wraps one backing database. It executes queries the router
//! sends it, records progress in the consistency tracker and replicates writes
//! to its siblings over gRPC.

include!(concat!(env!("OUT_DIR"), "/volo_gen.rs"));

pub mod cluster;
pub mod engine;
pub mod executor;
pub mod memory_engine;
pub mod node;
pub mod propagator;
pub mod rpc_service;
pub mod transport;

pub use cluster::LocalCluster;
pub use engine::{PostgresEngine, StorageEngine};
pub use executor::{ApplyFailure, ApplyOutcome, ExecutorConfig, QueryExecutor};
pub use memory_engine::MemoryEngine;
pub use propagator::{Propagator, PropagatorConfig};
pub use transport::{ApplyReply, GrpcTransport, HealthReply, InstanceRpc, LocalTransport};
