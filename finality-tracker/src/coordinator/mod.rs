// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Job Scheduling Coordinator
//!
//! Bounds how often discovery and monitoring jobs are enqueued per chain.
//! Each (chain, kind, reason) key remembers its last enqueue; a request
//! arriving before `max_age` has elapsed is skipped as rate limited unless
//! forced. The key store is pluggable so several worker processes can share
//! one view of recent enqueues.

use crate::jobs::{JobPayload, JobQueue, JobRequest, DISCOVERY_QUEUE, MONITORING_QUEUE};
use orbit_finality_core::clock::elapsed_between;
use orbit_finality_core::duration_secs;
use orbit_finality_core::{Clock, FinalityMetrics, FinalityResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

mod dedup;
mod redis_dedup;

pub use dedup::{DedupBackend, DedupEntry, MemoryDedupBackend};
pub use redis_dedup::RedisDedupBackend;

const KEY_PREFIX: &str = "finality:dedup";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    #[serde(with = "duration_secs")]
    pub discovery_max_age: Duration,
    #[serde(with = "duration_secs")]
    pub monitoring_max_age: Duration,
    /// Entries older than this are dropped by `sweep`
    #[serde(with = "duration_secs")]
    pub sweep_after: Duration,
    pub discovery_priority: i32,
    pub monitoring_priority: i32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            discovery_max_age: Duration::from_secs(2 * 60),
            monitoring_max_age: Duration::from_secs(5 * 60),
            sweep_after: Duration::from_secs(30 * 60),
            discovery_priority: 5,
            monitoring_priority: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Discovery,
    Monitoring,
}

impl JobKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobKind::Discovery => "discovery",
            JobKind::Monitoring => "monitoring",
        }
    }

    pub const fn queue(&self) -> &'static str {
        match self {
            JobKind::Discovery => DISCOVERY_QUEUE,
            JobKind::Monitoring => MONITORING_QUEUE,
        }
    }

    fn payload(&self, chain_id: u64) -> JobPayload {
        match self {
            JobKind::Discovery => JobPayload::DiscoverBatches { chain_id },
            JobKind::Monitoring => JobPayload::MonitorBatches { chain_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub reason: String,
    pub priority: Option<i32>,
    /// Overrides the kind's default minimum spacing
    pub max_age: Option<Duration>,
    pub force: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::reason("scheduled")
    }
}

impl EnqueueOptions {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            priority: None,
            max_age: None,
            force: false,
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    RateLimited,
    AlreadyQueued,
}

impl SkipReason {
    pub const fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RateLimited => "rate_limited",
            SkipReason::AlreadyQueued => "already_queued",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum EnqueueResult {
    #[serde(rename_all = "camelCase")]
    Enqueued { job_id: String },
    #[serde(rename_all = "camelCase")]
    Skipped {
        reason: SkipReason,
        last_job_id: Option<String>,
        retry_in_ms: u64,
    },
}

impl EnqueueResult {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueResult::Enqueued { .. })
    }
}

pub fn dedup_key(chain_id: u64, kind: JobKind, reason: &str) -> String {
    format!("{}:{}:{}:{}", KEY_PREFIX, chain_id, kind.as_str(), reason)
}

fn chain_prefix(chain_id: u64) -> String {
    format!("{}:{}:", KEY_PREFIX, chain_id)
}

pub struct JobCoordinator {
    backend: Arc<dyn DedupBackend>,
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    metrics: Option<Arc<FinalityMetrics>>,
    /// job id -> chain id for jobs enqueued by this process
    in_flight: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl JobCoordinator {
    pub fn new(
        backend: Arc<dyn DedupBackend>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            backend,
            queue,
            clock,
            config,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub async fn enqueue_discovery(
        &self,
        chain_id: u64,
        options: EnqueueOptions,
    ) -> FinalityResult<EnqueueResult> {
        self.enqueue(JobKind::Discovery, chain_id, options).await
    }

    pub async fn enqueue_monitoring(
        &self,
        chain_id: u64,
        options: EnqueueOptions,
    ) -> FinalityResult<EnqueueResult> {
        self.enqueue(JobKind::Monitoring, chain_id, options).await
    }

    async fn enqueue(
        &self,
        kind: JobKind,
        chain_id: u64,
        options: EnqueueOptions,
    ) -> FinalityResult<EnqueueResult> {
        let (default_max_age, default_priority) = match kind {
            JobKind::Discovery => (self.config.discovery_max_age, self.config.discovery_priority),
            JobKind::Monitoring => (
                self.config.monitoring_max_age,
                self.config.monitoring_priority,
            ),
        };
        let max_age = options.max_age.unwrap_or(default_max_age);
        let now = self.clock.now();
        let key = dedup_key(chain_id, kind, &options.reason);
        let entry = DedupEntry {
            job_id: format!(
                "{}-{}-{}-{}",
                kind.as_str(),
                chain_id,
                now.timestamp_millis(),
                self.next_id.fetch_add(1, Ordering::Relaxed)
            ),
            enqueued_at: now,
        };

        if options.force {
            self.backend.force_claim(&key, &entry, max_age).await?;
        } else if let Some(existing) = self.backend.try_claim(&key, &entry, max_age).await? {
            let retry_in = max_age.saturating_sub(elapsed_between(existing.enqueued_at, now));
            debug!(
                "[Coordinator] Skipping {} for chain {} ({}): last job {} retry in {:?}",
                kind.as_str(),
                chain_id,
                options.reason,
                existing.job_id,
                retry_in
            );
            self.record_skip(kind, SkipReason::RateLimited);
            return Ok(EnqueueResult::Skipped {
                reason: SkipReason::RateLimited,
                last_job_id: Some(existing.job_id),
                retry_in_ms: u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let enqueued = self
            .queue
            .enqueue(JobRequest {
                unique_id: entry.job_id.clone(),
                payload: kind.payload(chain_id),
                priority: options.priority.unwrap_or(default_priority),
            })
            .await;
        // A claim without a queued job would rate-limit the key for nothing.
        let accepted = match enqueued {
            Ok(accepted) => accepted,
            Err(e) => {
                self.release_claim(&key, &entry.job_id).await;
                return Err(e);
            }
        };
        if !accepted {
            self.release_claim(&key, &entry.job_id).await;
            self.record_skip(kind, SkipReason::AlreadyQueued);
            return Ok(EnqueueResult::Skipped {
                reason: SkipReason::AlreadyQueued,
                last_job_id: Some(entry.job_id),
                retry_in_ms: 0,
            });
        }

        self.lock_in_flight().insert(entry.job_id.clone(), chain_id);
        if let Some(m) = &self.metrics {
            m.jobs_enqueued
                .with_label_values(&[kind.queue(), options.reason.as_str()])
                .inc();
        }
        info!(
            "[Coordinator] Enqueued {} job {} for chain {} ({})",
            kind.as_str(),
            entry.job_id,
            chain_id,
            options.reason
        );
        Ok(EnqueueResult::Enqueued {
            job_id: entry.job_id,
        })
    }

    /// Forgets a finished job. Returns false when the job was not enqueued
    /// by this coordinator for `chain_id`.
    pub fn mark_completed(&self, chain_id: u64, job_id: &str) -> bool {
        let mut in_flight = self.lock_in_flight();
        match in_flight.get(job_id) {
            Some(owner) if *owner == chain_id => {
                in_flight.remove(job_id);
                debug!("[Coordinator] Job {} for chain {} completed", job_id, chain_id);
                true
            }
            _ => false,
        }
    }

    pub fn in_flight(&self, chain_id: u64) -> usize {
        self.lock_in_flight()
            .values()
            .filter(|owner| **owner == chain_id)
            .count()
    }

    /// Lets the next request for `chain_id` through regardless of spacing.
    pub async fn clear_rate_limit(&self, chain_id: u64) -> FinalityResult<usize> {
        let cleared = self.backend.clear_prefix(&chain_prefix(chain_id)).await?;
        info!(
            "[Coordinator] Cleared {} rate-limit entries for chain {}",
            cleared, chain_id
        );
        Ok(cleared)
    }

    pub async fn sweep(&self) -> FinalityResult<usize> {
        let swept = self.backend.sweep(self.config.sweep_after).await?;
        if swept > 0 {
            debug!("[Coordinator] Swept {} stale entries", swept);
        }
        Ok(swept)
    }

    async fn release_claim(&self, key: &str, job_id: &str) {
        if let Err(e) = self.backend.release(key, job_id).await {
            warn!("[Coordinator] Failed to release {} for job {}: {}", key, job_id, e);
        }
    }

    fn record_skip(&self, kind: JobKind, reason: SkipReason) {
        if let Some(m) = &self.metrics {
            m.jobs_skipped
                .with_label_values(&[kind.queue(), reason.as_str()])
                .inc();
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}
