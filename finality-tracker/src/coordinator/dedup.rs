// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orbit_finality_core::clock::elapsed_between;
use orbit_finality_core::{Clock, FinalityResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Last enqueue recorded for a (chain, kind, reason) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupEntry {
    pub job_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Shared `key -> last enqueue` map with set-if-absent semantics.
#[async_trait]
pub trait DedupBackend: Send + Sync + 'static {
    /// Records `entry` unless `key` holds an entry younger than `ttl`, in
    /// which case that entry is returned and nothing is written.
    async fn try_claim(
        &self,
        key: &str,
        entry: &DedupEntry,
        ttl: Duration,
    ) -> FinalityResult<Option<DedupEntry>>;

    /// Records `entry` regardless of what `key` holds.
    async fn force_claim(&self, key: &str, entry: &DedupEntry, ttl: Duration)
        -> FinalityResult<()>;

    /// Drops `key` if it still holds the claim recorded for `job_id`.
    /// Returns whether anything was removed.
    async fn release(&self, key: &str, job_id: &str) -> FinalityResult<bool>;

    /// Drops every key starting with `prefix`; returns how many were removed.
    async fn clear_prefix(&self, prefix: &str) -> FinalityResult<usize>;

    /// Drops entries recorded more than `older_than` ago.
    async fn sweep(&self, older_than: Duration) -> FinalityResult<usize>;
}

/// Process-local backend. Only suppresses duplicates within one process.
#[derive(Debug)]
pub struct MemoryDedupBackend {
    entries: Mutex<HashMap<String, DedupEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryDedupBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DedupEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DedupBackend for MemoryDedupBackend {
    async fn try_claim(
        &self,
        key: &str,
        entry: &DedupEntry,
        ttl: Duration,
    ) -> FinalityResult<Option<DedupEntry>> {
        let now = self.clock.now();
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            if elapsed_between(existing.enqueued_at, now) < ttl {
                return Ok(Some(existing.clone()));
            }
        }
        entries.insert(key.to_string(), entry.clone());
        Ok(None)
    }

    async fn force_claim(
        &self,
        key: &str,
        entry: &DedupEntry,
        _ttl: Duration,
    ) -> FinalityResult<()> {
        self.lock().insert(key.to_string(), entry.clone());
        Ok(())
    }

    async fn release(&self, key: &str, job_id: &str) -> FinalityResult<bool> {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|e| e.job_id == job_id) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn clear_prefix(&self, prefix: &str) -> FinalityResult<usize> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    async fn sweep(&self, older_than: Duration) -> FinalityResult<usize> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| elapsed_between(entry.enqueued_at, now) <= older_than);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::epoch;
    use orbit_finality_core::ManualClock;

    fn entry(job_id: &str, at: DateTime<Utc>) -> DedupEntry {
        DedupEntry {
            job_id: job_id.to_string(),
            enqueued_at: at,
        }
    }

    #[tokio::test]
    async fn claim_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let backend = MemoryDedupBackend::new(clock.clone());
        let ttl = Duration::from_secs(120);

        assert_eq!(backend.try_claim("k", &entry("a", clock.now()), ttl).await.unwrap(), None);
        clock.advance(Duration::from_secs(119));
        let existing = backend
            .try_claim("k", &entry("b", clock.now()), ttl)
            .await
            .unwrap();
        assert_eq!(existing.map(|e| e.job_id), Some("a".to_string()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(backend.try_claim("k", &entry("c", clock.now()), ttl).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sweep_and_prefix_clear() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let backend = MemoryDedupBackend::new(clock.clone());
        let ttl = Duration::from_secs(60);
        backend.try_claim("x:1:a", &entry("1", clock.now()), ttl).await.unwrap();
        clock.advance(Duration::from_secs(31 * 60));
        backend.try_claim("x:1:b", &entry("2", clock.now()), ttl).await.unwrap();
        backend.try_claim("x:2:a", &entry("3", clock.now()), ttl).await.unwrap();

        assert_eq!(backend.sweep(Duration::from_secs(30 * 60)).await.unwrap(), 1);
        assert_eq!(backend.clear_prefix("x:1:").await.unwrap(), 1);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn release_only_drops_the_matching_claim() {
        let clock = Arc::new(ManualClock::new(epoch()));
        let backend = MemoryDedupBackend::new(clock.clone());
        let ttl = Duration::from_secs(120);
        backend.try_claim("k", &entry("a", clock.now()), ttl).await.unwrap();

        assert!(!backend.release("k", "b").await.unwrap());
        assert!(!backend.release("other", "a").await.unwrap());
        assert_eq!(backend.len(), 1);
        assert!(backend.release("k", "a").await.unwrap());
        assert_eq!(backend.try_claim("k", &entry("c", clock.now()), ttl).await.unwrap(), None);
    }
}
