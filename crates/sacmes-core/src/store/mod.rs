//! Session state store
//!
//! A key-value store with per-entry expiry. Keys are plain strings
//! namespaced by session (`session:<id>:...`); values are JSON.
//!
//! Two backends:
//! - [`MemoryStore`]: in-process, moka-backed, always available
//! - `RedisStore` (feature `cluster`): shared between relay processes
//!
//! [`open_store`] picks the clustered backend when it is configured and
//! reachable and falls back to the in-process one otherwise, so callers
//! only ever see `Arc<dyn StateStore>`.

pub mod memory;

#[cfg(feature = "cluster")]
pub mod cluster;

use crate::config::StoreConfig;
use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub use memory::MemoryStore;

#[cfg(feature = "cluster")]
pub use cluster::RedisStore;

/// Key-value store with expiry
#[async_trait]
pub trait StateStore: Send + Sync + std::fmt::Debug {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Write a value, resetting its expiry
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Write only if the key is absent; returns whether it was written
    async fn put_if_absent(&self, key: &str, value: Value, ttl: Duration)
        -> Result<bool, StoreError>;

    /// Remove a key; returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// All live keys starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically add to an integer value (absent counts as 0)
    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError>;

    /// Remove every key starting with `prefix`; returns how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        for key in self.keys_with_prefix(prefix).await? {
            if self.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Backend name for logs
    fn backend(&self) -> &'static str;
}

/// Open the configured store, falling back to the in-process backend
pub async fn open_store(config: &StoreConfig) -> Arc<dyn StateStore> {
    #[cfg(feature = "cluster")]
    if let Some(url) = config.url.as_deref() {
        match RedisStore::connect(url).await {
            Ok(store) => {
                tracing::info!(backend = store.backend(), "clustered state store connected");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("clustered store unavailable, using in-process store: {e}");
            }
        }
    }

    #[cfg(not(feature = "cluster"))]
    if config.url.is_some() {
        tracing::warn!("store url configured but built without `cluster`; using in-process store");
    }

    let store = MemoryStore::new();
    tracing::info!(backend = store.backend(), "state store ready");
    Arc::new(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_store_without_url_is_memory() {
        let store = open_store(&StoreConfig::default()).await;
        assert_eq!(store.backend(), "memory");
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_prefix() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.put("session:a:x", Value::from(1), ttl).await.unwrap();
        store.put("session:a:y", Value::from(2), ttl).await.unwrap();
        store.put("session:b:x", Value::from(3), ttl).await.unwrap();

        let removed = store.delete_prefix("session:a:").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get("session:a:x").await.unwrap().is_none());
        assert_eq!(store.get("session:b:x").await.unwrap(), Some(Value::from(3)));
    }
}
