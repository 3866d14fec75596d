//! In-process state store using moka
//!
//! Each entry carries its own time-to-live; writes reset it. There is no
//! size bound: entries leave only by expiry or deletion.

use super::StateStore;
use crate::error::StoreError;
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    ttl: Duration,
}

/// Expire each entry after the ttl it was written with
struct WriteTtl;

impl Expiry<String, StoredValue> for WriteTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process store
#[derive(Debug)]
pub struct MemoryStore {
    inner: Cache<String, StoredValue>,
    /// serializes read-modify-write counters
    counter_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Cache::builder().expire_after(WriteTtl).build(),
            counter_lock: Mutex::new(()),
        }
    }

    /// Approximate entry count
    #[inline]
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.inner.get(key).await.map(|stored| stored.value))
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        self.inner
            .insert(key.to_string(), StoredValue { value, ttl })
            .await;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let entry = self
            .inner
            .entry(key.to_string())
            .or_insert_with(async { StoredValue { value, ttl } })
            .await;
        Ok(entry.is_fresh())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.remove(key).await.is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .inner
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| String::clone(&key))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn incr(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, StoreError> {
        let _guard = self.counter_lock.lock().await;
        let current = match self.inner.get(key).await {
            Some(stored) => stored
                .value
                .as_i64()
                .ok_or_else(|| StoreError::TypeMismatch(key.to_string()))?,
            None => 0,
        };
        let next = current + by;
        self.inner
            .insert(
                key.to_string(),
                StoredValue {
                    value: Value::from(next),
                    ttl,
                },
            )
            .await;
        Ok(next)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
