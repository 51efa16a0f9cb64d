/// Ephemeral key/value hash store
///
/// Holds transient per-run and per-step scalars (task handles, mirrored status,
/// error summaries). Values here tolerate eventual consistency and are never
/// the source of truth for step state; the repository is.

use crate::error::{SchedulerError, SchedulerResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

// Key layout and typed proxies over the hashes
pub mod keys;

pub use keys::{ScheduleDataProxy, StepStoreProxy};

/// Hash-of-fields store, shaped after a Redis hash
#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn hset(&self, key: &str, fields: Vec<(String, Value)>) -> SchedulerResult<()>;

    /// Read one field, `KeyNotFoundInHash` when the key or field is missing
    async fn hget(&self, key: &str, field: &str) -> SchedulerResult<Value>;

    async fn hgetall(&self, key: &str) -> SchedulerResult<HashMap<String, Value>>;

    async fn delete(&self, key: &str) -> SchedulerResult<()>;
}

/// In-process store for single-node deployments and tests
#[derive(Debug, Default)]
pub struct InMemoryStore {
    hashes: RwLock<HashMap<String, HashMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralStore for InMemoryStore {
    async fn hset(&self, key: &str, fields: Vec<(String, Value)>) -> SchedulerResult<()> {
        let mut hashes = self.hashes.write().await;
        hashes.entry(key.to_string()).or_default().extend(fields);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> SchedulerResult<Value> {
        let hashes = self.hashes.read().await;
        hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned()
            .ok_or_else(|| SchedulerError::KeyNotFoundInHash {
                key: key.to_string(),
                field: field.to_string(),
            })
    }

    async fn hgetall(&self, key: &str) -> SchedulerResult<HashMap<String, Value>> {
        Ok(self.hashes.read().await.get(key).cloned().unwrap_or_default())
    }

    async fn delete(&self, key: &str) -> SchedulerResult<()> {
        self.hashes.write().await.remove(key);
        Ok(())
    }
}
