use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

mod error;
mod lock;
mod memory;

pub use error::{KvError, KvResult};
pub use lock::{random_token, with_lock, OnBusy};
pub use memory::MemoryKv;

/// The shared key/value store the hosting runtime provides.
///
/// All cross-process coordination in the gateway goes through this trait:
/// channel locks, the pool mutex, cached sequence numbers and fee-usage
/// documents. Values are JSON documents; typed access goes through
/// [get_typed]/[set_typed].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<Value>>;

    /// Stores `value` under `key`, optionally expiring after `ttl`.
    async fn set(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> KvResult<()>;

    async fn del(&self, key: &str) -> KvResult<()>;

    async fn exists(&self, key: &str) -> KvResult<bool>;

    async fn list_keys(&self, prefix: &str) -> KvResult<Vec<String>>;

    /// Atomically stores `value` only if `key` is absent.
    /// Returns `true` if the write happened. Locks are built on this.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> KvResult<bool>;
}

pub async fn get_typed<T: DeserializeOwned>(
    kv: &dyn KvStore,
    key: &str,
) -> KvResult<Option<T>> {
    match kv.get(key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|err| KvError::Decode(key.to_string(), err)),
        None => Ok(None),
    }
}

pub async fn set_typed<T: Serialize>(
    kv: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> KvResult<()> {
    let value = serde_json::to_value(value)
        .map_err(|err| KvError::Encode(key.to_string(), err))?;
    kv.set(key, value, ttl).await
}
