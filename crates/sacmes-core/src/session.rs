//! Per-session state held in the [`StateStore`]
//!
//! Key layout, all under `session:<id>:`:
//!
//! | Key | Value |
//! |---|---|
//! | `params` | [`AnalysisParams`] |
//! | `filters` | [`FilterSpec`] |
//! | `result:<segment>` | [`AccumulatedResult`] |
//! | `progress:<counter>` | integer |
//! | `warning:<seq>` | [`WarningEntry`] |
//!
//! Every write refreshes that key's TTL. Migration carries params,
//! filters, results, progress and warnings into a new session without
//! losing anything the new session already wrote.

use crate::error::StoreError;
use crate::store::StateStore;
use crate::types::{AccumulatedResult, AnalysisParams, FilterSpec, SessionId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Sub-namespaces copied on reconnection
const CARRY_OVER: &[&str] = &["params", "filters", "result:", "progress:", "warning:"];

/// Per-file progress counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Progress {
    /// File passed validation
    Received,
    /// Analyzer returned a value
    Completed,
    /// Analyzer returned an error status
    Failed,
    /// File failed validation
    Rejected,
}

impl Progress {
    fn key(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

/// Snapshot of all progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounts {
    /// Files accepted for analysis
    pub received: i64,
    /// Files analyzed with a value
    pub completed: i64,
    /// Files analyzed without a value
    pub failed: i64,
    /// Files rejected before analysis
    pub rejected: i64,
}

/// One entry of the session warning log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningEntry {
    /// When it was recorded
    pub at: DateTime<Utc>,
    /// Source filename, if any
    pub filename: Option<String>,
    /// Description
    pub message: String,
}

/// Typed access to session-namespaced keys
#[derive(Debug, Clone)]
pub struct SessionState {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

fn prefix(session: SessionId) -> String {
    format!("session:{session}:")
}

fn key(session: SessionId, suffix: &str) -> String {
    format!("session:{session}:{suffix}")
}

impl SessionState {
    /// Wrap a store; `ttl` applies to every write
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    async fn put_json<T: Serialize>(&self, key: String, value: &T) -> Result<(), StoreError> {
        let value = serde_json::to_value(value).map_err(|e| StoreError::serialization(&key, e))?;
        self.store.put(&key, value, self.ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: String) -> Result<Option<T>, StoreError> {
        match self.store.get(&key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| StoreError::serialization(&key, e)),
            None => Ok(None),
        }
    }

    /// Store analysis parameters
    pub async fn set_params(&self, session: SessionId, params: &AnalysisParams) -> Result<(), StoreError> {
        self.put_json(key(session, "params"), params).await
    }

    /// Analysis parameters, if a session start happened
    pub async fn params(&self, session: SessionId) -> Result<Option<AnalysisParams>, StoreError> {
        self.get_json(key(session, "params")).await
    }

    /// Store the filter set last sent to the agent
    pub async fn set_filters(&self, session: SessionId, filters: &FilterSpec) -> Result<(), StoreError> {
        self.put_json(key(session, "filters"), filters).await
    }

    /// Filter set last sent to the agent
    pub async fn filters(&self, session: SessionId) -> Result<Option<FilterSpec>, StoreError> {
        self.get_json(key(session, "filters")).await
    }

    /// Record one result, replacing any earlier value at the same key
    pub async fn record_result(
        &self,
        session: SessionId,
        result: &AccumulatedResult,
    ) -> Result<(), StoreError> {
        let suffix = format!("result:{}", result.key.to_segment());
        self.put_json(key(session, &suffix), result).await
    }

    /// All accumulated results ordered by (electrode, frequency, index)
    pub async fn results(&self, session: SessionId) -> Result<Vec<AccumulatedResult>, StoreError> {
        let mut out = Vec::new();
        for k in self.store.keys_with_prefix(&key(session, "result:")).await? {
            // may have expired between listing and reading
            if let Some(result) = self.get_json::<AccumulatedResult>(k).await? {
                out.push(result);
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    /// Drop accumulated results and counters ahead of a new analysis run
    pub async fn clear_results(&self, session: SessionId) -> Result<(), StoreError> {
        self.store.delete_prefix(&key(session, "result:")).await?;
        self.store.delete_prefix(&key(session, "progress:")).await?;
        Ok(())
    }

    /// Increment a progress counter
    pub async fn bump_progress(&self, session: SessionId, counter: Progress) -> Result<i64, StoreError> {
        let k = key(session, &format!("progress:{}", counter.key()));
        self.store.incr(&k, 1, self.ttl).await
    }

    /// Snapshot of progress counters
    pub async fn progress(&self, session: SessionId) -> Result<ProgressCounts, StoreError> {
        let read = |counter: Progress| {
            let k = key(session, &format!("progress:{}", counter.key()));
            async move {
                Ok::<_, StoreError>(
                    self.store
                        .get(&k)
                        .await?
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0),
                )
            }
        };
        Ok(ProgressCounts {
            received: read(Progress::Received).await?,
            completed: read(Progress::Completed).await?,
            failed: read(Progress::Failed).await?,
            rejected: read(Progress::Rejected).await?,
        })
    }

    /// Append to the warning log
    pub async fn add_warning(
        &self,
        session: SessionId,
        filename: Option<&str>,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        let seq = self.store.incr(&key(session, "warning_seq"), 1, self.ttl).await?;
        let entry = WarningEntry {
            at: Utc::now(),
            filename: filename.map(str::to_string),
            message: message.into(),
        };
        self.put_json(key(session, &format!("warning:{seq:06}")), &entry).await
    }

    /// Warning log in insertion order
    pub async fn warnings(&self, session: SessionId) -> Result<Vec<WarningEntry>, StoreError> {
        let mut out = Vec::new();
        for k in self.store.keys_with_prefix(&key(session, "warning:")).await? {
            if let Some(entry) = self.get_json(k).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Copy carry-over keys from `from` into `to`, then retire `from`
    ///
    /// Params, filters and results already present under `to` win.
    /// Progress counters are added to whatever `to` has counted so far, and
    /// old warnings are appended to `to`'s log under fresh sequence numbers.
    /// Returns how many keys were carried.
    pub async fn migrate(&self, from: SessionId, to: SessionId) -> Result<usize, StoreError> {
        if from == to {
            return Ok(0);
        }
        let old_prefix = prefix(from);
        let mut copied = 0;
        for sub in CARRY_OVER {
            for old_key in self.store.keys_with_prefix(&key(from, sub)).await? {
                let Some(value) = self.store.get(&old_key).await? else {
                    continue;
                };
                let suffix = &old_key[old_prefix.len()..];
                let carried = if suffix.starts_with("progress:") {
                    let by = value
                        .as_i64()
                        .ok_or_else(|| StoreError::TypeMismatch(old_key.clone()))?;
                    self.store.incr(&key(to, suffix), by, self.ttl).await?;
                    true
                } else if suffix.starts_with("warning:") {
                    let seq = self.store.incr(&key(to, "warning_seq"), 1, self.ttl).await?;
                    self.store
                        .put(&key(to, &format!("warning:{seq:06}")), value, self.ttl)
                        .await?;
                    true
                } else {
                    self.store.put_if_absent(&key(to, suffix), value, self.ttl).await?
                };
                if carried {
                    copied += 1;
                }
            }
        }
        self.purge(from).await?;
        tracing::debug!(from = %from, to = %to, copied, "session state migrated");
        Ok(copied)
    }

    /// Remove everything stored for a session
    pub async fn purge(&self, session: SessionId) -> Result<usize, StoreError> {
        self.store.delete_prefix(&prefix(session)).await
    }

    /// Whether anything is stored for a session
    pub async fn exists(&self, session: SessionId) -> Result<bool, StoreError> {
        Ok(!self.store.keys_with_prefix(&prefix(session)).await?.is_empty())
    }

    /// Raw value under a session key, for diagnostics
    pub async fn raw(&self, session: SessionId, suffix: &str) -> Result<Option<Value>, StoreError> {
        self.store.get(&key(session, suffix)).await
    }
}
