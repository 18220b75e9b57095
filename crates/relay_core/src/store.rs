use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

/// Primitive operations the tracker needs from the shared key-value store.
///
/// Set mutations must be atomic at the store: `sadd`/`srem` are commutative
/// and idempotent, which is what lets instances record progress concurrently
/// without any application-level locking.
#[async_trait]
pub trait TrackingStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn smembers(&self, key: &str) -> anyhow::Result<BTreeSet<String>>;
    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn del(&self, keys: &[String]) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
enum Entry {
    Value(Vec<u8>),
    Set(BTreeSet<String>),
}

/// In-process store with the same semantics as the RESP-backed one.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner
            .read()
            .map(|guard| guard.contains_key(key))
            .unwrap_or(false)
    }

    fn poisoned() -> anyhow::Error {
        anyhow::anyhow!("memory store lock poisoned")
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let guard = self.inner.read().map_err(|_| Self::poisoned())?;
        match guard.get(key) {
            None => Ok(None),
            Some(Entry::Value(value)) => Ok(Some(value.clone())),
            Some(Entry::Set(_)) => anyhow::bail!("WRONGTYPE key {key} holds a set"),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| Self::poisoned())?;
        guard.insert(key.to_string(), Entry::Value(value));
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| Self::poisoned())?;
        let entry = guard
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(BTreeSet::new()));
        match entry {
            Entry::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            Entry::Value(_) => anyhow::bail!("WRONGTYPE key {key} holds a value"),
        }
    }

    async fn smembers(&self, key: &str) -> anyhow::Result<BTreeSet<String>> {
        let guard = self.inner.read().map_err(|_| Self::poisoned())?;
        match guard.get(key) {
            None => Ok(BTreeSet::new()),
            Some(Entry::Set(members)) => Ok(members.clone()),
            Some(Entry::Value(_)) => anyhow::bail!("WRONGTYPE key {key} holds a value"),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| Self::poisoned())?;
        let now_empty = match guard.get_mut(key) {
            None => return Ok(()),
            Some(Entry::Set(members)) => {
                members.remove(member);
                members.is_empty()
            }
            Some(Entry::Value(_)) => anyhow::bail!("WRONGTYPE key {key} holds a value"),
        };
        // Like Redis, an emptied set stops existing.
        if now_empty {
            guard.remove(key);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> anyhow::Result<()> {
        let mut guard = self.inner.write().map_err(|_| Self::poisoned())?;
        for key in keys {
            guard.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_membership_is_idempotent() {
        let store = MemoryStore::new();
        store.sadd("k", "a").await.unwrap();
        store.sadd("k", "a").await.unwrap();
        store.sadd("k", "b").await.unwrap();
        let members = store.smembers("k").await.unwrap();
        assert_eq!(members.len(), 2);

        store.srem("k", "a").await.unwrap();
        store.srem("k", "b").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn wrong_type_is_an_error() {
        let store = MemoryStore::new();
        store.set("v", b"x".to_vec()).await.unwrap();
        assert!(store.sadd("v", "a").await.is_err());
        assert!(store.smembers("v").await.is_err());
        store.sadd("s", "a").await.unwrap();
        assert!(store.get("s").await.is_err());
    }

    #[tokio::test]
    async fn del_removes_values_and_sets() {
        let store = MemoryStore::new();
        store.set("v", b"x".to_vec()).await.unwrap();
        store.sadd("s", "a").await.unwrap();
        store
            .del(&["v".to_string(), "s".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("v").await.unwrap(), None);
        assert!(store.smembers("s").await.unwrap().is_empty());
    }
}
