//! In-memory store for tests and single-process use.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rdmsync_common::{Error, Result};

use crate::store::KeyValueStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<String>>,
}

/// In-memory key-value store.
///
/// All data is lost on drop. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::Store("memory store lock poisoned".to_string())
    }

    fn deadline(ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        Ok(inner
            .values
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires: Self::deadline(ttl),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        let now = Instant::now();
        if inner.values.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires: Self::deadline(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner.values.remove(key);
        inner.lists.remove(key);
        Ok(())
    }

    async fn push(&self, list: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        inner
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(value.to_string());
        Ok(())
    }

    async fn pop(&self, list: &str) -> Result<Option<String>> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        Ok(inner.lists.get_mut(list).and_then(|l| l.pop_back()))
    }

    async fn len(&self, list: &str) -> Result<usize> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.lists.get(list).map_or(0, |l| l.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_set_nx() {
        let store = MemoryStore::new();
        assert!(store.set_nx("lock: a", "1", None).await.unwrap());
        assert!(!store.set_nx("lock: a", "2", None).await.unwrap());
        assert_eq!(store.get("lock: a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_expired_key_is_gone_and_reclaimable() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.set_nx("k", "w", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_is_fifo() {
        let store = MemoryStore::new();
        for v in ["1", "2", "3"] {
            store.push("jobs", v).await.unwrap();
        }
        assert_eq!(store.len("jobs").await.unwrap(), 3);
        assert_eq!(store.pop("jobs").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.pop("jobs").await.unwrap().as_deref(), Some("2"));
        assert_eq!(store.pop("jobs").await.unwrap().as_deref(), Some("3"));
        assert!(store.pop("jobs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.set("k", "v", None).await.unwrap();
        assert!(b.exists("k").await.unwrap());
    }
}
