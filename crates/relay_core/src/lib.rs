//! Core relay crate.
//!
//! This crate holds everything the proxy and the instances must agree on:
//! the query model, the SQL classifier, the tracking-store key scheme and the
//! consistency tracker that decides which instances are safe to read from.
//! Higher layers supply a `TrackingStore` and drive queries through
//! `ConsistencyTracker`.

pub mod classifier;
pub mod keys;
pub mod resp_server;
pub mod resp_store;
pub mod store;
pub mod tracker;
pub mod types;

pub use classifier::{classify, result_columns, Classification};
pub use resp_store::{RespStore, RespStoreConfig};
pub use store::{MemoryStore, TrackingStore};
pub use tracker::ConsistencyTracker;
pub use types::{
    unix_time_ms, InstanceAddr, InstanceId, Query, QueryDraft, QueryId, QueryKind, ResultSet,
    Roster,
};
