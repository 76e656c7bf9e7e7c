use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{KvResult, KvStore};

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory [KvStore] honoring TTLs, used in tests and local runs.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| !entry.expired());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<Value>> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> KvResult<()> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
        Ok(entries.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> KvResult<Vec<String>> {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| !entry.expired());
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> KvResult<bool> {
        let mut entries = self.entries.lock().unwrap();
        if entries.get(key).is_some_and(Entry::expired) {
            entries.remove(key);
        }
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("a", json!({"n": 1}), None).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), Some(json!({"n": 1})));
        assert!(kv.exists("a").await.unwrap());
        kv.del("a").await.unwrap();
        assert_eq!(kv.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("t", json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(kv.exists("t").await.unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!kv.exists("t").await.unwrap());
        assert_eq!(kv.get("t").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_claims_once() {
        let kv = MemoryKv::new();
        assert!(kv.set_if_absent("c", json!(1), None).await.unwrap());
        assert!(!kv.set_if_absent("c", json!(2), None).await.unwrap());
        assert_eq!(kv.get("c").await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn set_if_absent_reclaims_expired() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_if_absent("e", json!(1), Some(Duration::from_millis(10)))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv.set_if_absent("e", json!(2), None).await.unwrap());
        assert_eq!(kv.get("e").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix() {
        let kv = MemoryKv::new();
        kv.set("net:channel:in-use:p1", json!(1), None).await.unwrap();
        kv.set("net:channel:in-use:p2", json!(1), None).await.unwrap();
        kv.set("net:channel:seq:GABC", json!(1), None).await.unwrap();
        let keys = kv.list_keys("net:channel:in-use:").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "net:channel:in-use:p1".to_string(),
                "net:channel:in-use:p2".to_string()
            ]
        );
    }
}
