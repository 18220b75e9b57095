//! Deterministic tracking-store keys.
//!
//! Every node hashes the same logical names, so proxies and instances agree on
//! keys without sharing any state beyond the store itself.

use md5::{Digest, Md5};

use crate::types::QueryId;

fn hashed(logical: &str) -> String {
    format!("{:x}", Md5::digest(logical.as_bytes()))
}

/// Key holding the serialized query body.
pub fn query_body(id: &QueryId) -> String {
    hashed(&format!("query:{id}"))
}

/// Key holding the set of instances that applied the query.
pub fn query_executed(id: &QueryId) -> String {
    hashed(&format!("query:{id}:executed"))
}

/// Key holding the set of pending write ids that reference `table`.
pub fn table_writes(table: &str) -> String {
    hashed(&format!("table:{table}"))
}
