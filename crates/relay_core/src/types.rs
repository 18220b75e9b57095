//! Shared types for the relay cluster.
//!
//! These are kept dependency-light because they cross every boundary: the
//! wire front end, the tracker, the RPC payloads and the instance executor.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Static identifier of one backing database instance.
pub type InstanceId = String;

/// Unique identifier of a registered query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryId(String);

impl QueryId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for QueryId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for QueryId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Routing class of a statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
    Read,
    Write,
}

impl QueryKind {
    pub fn is_write(self) -> bool {
        matches!(self, QueryKind::Write)
    }
}

/// A query before the tracker has assigned it an id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryDraft {
    pub sql: String,
    pub kind: QueryKind,
    pub tables: BTreeSet<String>,
    pub connection_id: String,
}

/// A registered query. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub id: QueryId,
    pub sql: String,
    pub kind: QueryKind,
    #[serde(default)]
    pub tables: BTreeSet<String>,
    pub connection_id: String,
    pub created_at_ms: u64,
}

/// Network location of one instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAddr {
    pub id: InstanceId,
    pub host: String,
    pub port: u16,
}

impl InstanceAddr {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The fixed set of instances participating in the cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Roster {
    instances: BTreeMap<InstanceId, InstanceAddr>,
}

impl Roster {
    /// Parse a comma-separated roster like `a@127.0.0.1:50051,b@db-2:50051`.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        let mut instances = BTreeMap::new();
        for part in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (id, endpoint) = part
                .split_once('@')
                .with_context(|| format!("invalid instance entry (expected id@host:port): {part}"))?;
            let (host, port) = endpoint
                .rsplit_once(':')
                .with_context(|| format!("invalid instance endpoint (expected host:port): {endpoint}"))?;
            let id = id.trim();
            anyhow::ensure!(!id.is_empty(), "instance id is empty in entry {part}");
            anyhow::ensure!(!host.is_empty(), "instance host is empty in entry {part}");
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid instance port in entry {part}"))?;
            let addr = InstanceAddr {
                id: id.to_string(),
                host: host.to_string(),
                port,
            };
            anyhow::ensure!(
                instances.insert(addr.id.clone(), addr).is_none(),
                "duplicate instance id {id}"
            );
        }
        anyhow::ensure!(!instances.is_empty(), "instance roster is empty");
        Ok(Self { instances })
    }

    pub fn from_addrs(addrs: impl IntoIterator<Item = InstanceAddr>) -> Self {
        Self {
            instances: addrs.into_iter().map(|a| (a.id.clone(), a)).collect(),
        }
    }

    /// Roster with placeholder addresses, for in-process clusters.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InstanceId>,
    {
        Self::from_addrs(ids.into_iter().map(|id| InstanceAddr {
            id: id.into(),
            host: "127.0.0.1".to_string(),
            port: 0,
        }))
    }

    pub fn ids(&self) -> BTreeSet<InstanceId> {
        self.instances.keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<&InstanceAddr> {
        self.instances.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceAddr> {
        self.instances.values()
    }

    /// Every instance except `id`.
    pub fn siblings<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a InstanceAddr> + 'a {
        self.instances.values().filter(move |addr| addr.id != id)
    }
}

/// Rows returned by an instance. Every value is text; `None` is SQL NULL.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("encode result set")
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::empty());
        }
        serde_json::from_str(json).context("decode result set")
    }
}

pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
