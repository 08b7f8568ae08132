// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Job Worker
//!
//! Pulls jobs from the queue and runs them with bounded concurrency. Every
//! job races a hard wall-clock timeout; an abandoned or transiently failed
//! attempt goes back to the queue's own retry policy instead of being retried
//! in-process.

use crate::coordinator::JobCoordinator;
use crate::discovery::BatchDiscovery;
use crate::jobs::{Job, JobPayload, JobQueue};
use crate::monitor::BatchMonitor;
use crate::processor::TransactionProcessor;
use orbit_finality_core::{duration_ms, duration_secs};
use orbit_finality_core::{FinalityError, FinalityMetrics, FinalityResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,
    /// Sleep between polls of an empty queue
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            job_timeout: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Handed back to the queue for another attempt
    Retrying,
    Failed,
    TimedOut,
}

impl JobOutcome {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retrying => "retrying",
            JobOutcome::Failed => "failed",
            JobOutcome::TimedOut => "timed_out",
        }
    }
}

pub struct JobWorker {
    queue: Arc<dyn JobQueue>,
    coordinator: Arc<JobCoordinator>,
    discovery: Arc<BatchDiscovery>,
    monitor: Arc<BatchMonitor>,
    processor: Arc<TransactionProcessor>,
    config: WorkerConfig,
    metrics: Option<Arc<FinalityMetrics>>,
}

impl JobWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        coordinator: Arc<JobCoordinator>,
        discovery: Arc<BatchDiscovery>,
        monitor: Arc<BatchMonitor>,
        processor: Arc<TransactionProcessor>,
        config: WorkerConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            queue,
            coordinator,
            discovery,
            monitor,
            processor,
            config,
            metrics,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        info!("[Worker] Starting with concurrency {}", concurrency);
        info!("  Job timeout: {:?}", self.config.job_timeout);
        let permits = Arc::new(Semaphore::new(concurrency));

        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let job = match self.queue.dequeue().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("[Worker] Dequeue failed: {:?}", e);
                    tokio::time::sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let worker = self.clone();
            tokio::spawn(async move {
                worker.handle(job).await;
                drop(permit);
            });
        }

        info!("[Worker] Shutting down, waiting for running jobs");
        let _ = permits.acquire_many(concurrency as u32).await;
    }

    /// Runs one job attempt and settles it with the queue.
    pub async fn handle(&self, job: Job) -> JobOutcome {
        let started = Instant::now();
        let queue = job.queue();
        let chain_id = job.payload.chain_id();
        let job_id = job.id.clone();

        let outcome =
            match tokio::time::timeout(self.config.job_timeout, self.execute(&job.payload)).await {
                Ok(Ok(summary)) => {
                    debug!("[Worker] Job {} finished: {}", job.id, summary);
                    self.settle_complete(&job).await;
                    JobOutcome::Completed
                }
                Ok(Err(e)) if e.is_transient() || matches!(e, FinalityError::Store(_)) => {
                    warn!("[Worker] Job {} attempt {} failed: {}", job.id, job.attempts, e);
                    self.settle_retry(job, &e.to_string()).await
                }
                Ok(Err(e)) => {
                    error!("[Worker] Job {} failed permanently: {}", job.id, e);
                    self.settle_complete(&job).await;
                    JobOutcome::Failed
                }
                Err(_) => {
                    warn!(
                        "[Worker] Job {} exceeded {:?}, abandoning attempt",
                        job.id, self.config.job_timeout
                    );
                    if let Some(m) = &self.metrics {
                        m.jobs_timed_out.with_label_values(&[queue]).inc();
                    }
                    match self.settle_retry(job, "job timed out").await {
                        JobOutcome::Retrying => JobOutcome::Retrying,
                        _ => JobOutcome::TimedOut,
                    }
                }
            };

        if let Some(chain_id) = chain_id {
            if outcome != JobOutcome::Retrying {
                self.coordinator.mark_completed(chain_id, &job_id);
            }
        }
        if let Some(m) = &self.metrics {
            m.jobs_completed
                .with_label_values(&[queue, outcome.as_str()])
                .inc();
            m.job_duration
                .with_label_values(&[queue])
                .observe(started.elapsed().as_secs_f64());
        }
        outcome
    }

    /// Dispatches a payload and returns its JSON result summary.
    pub async fn execute(&self, payload: &JobPayload) -> FinalityResult<serde_json::Value> {
        let summary = match payload {
            JobPayload::DiscoverBatches { chain_id } => {
                serde_json::to_value(self.discovery.discover(*chain_id).await?)
            }
            JobPayload::MonitorBatches { chain_id } => {
                serde_json::to_value(self.monitor.monitor(*chain_id).await?)
            }
            JobPayload::ProcessTransaction { transaction_id } => {
                let outcome = self.processor.process(*transaction_id).await?;
                serde_json::to_value(&outcome.state).map(|state| {
                    serde_json::json!({
                        "message": outcome.message,
                        "state": state,
                    })
                })
            }
        };
        summary.map_err(|e| FinalityError::Internal(e.to_string()))
    }

    async fn settle_complete(&self, job: &Job) {
        if let Err(e) = self.queue.complete(job).await {
            error!("[Worker] Failed to complete job {}: {:?}", job.id, e);
        }
    }

    async fn settle_retry(&self, job: Job, reason: &str) -> JobOutcome {
        let job_id = job.id.clone();
        match self.queue.fail(job, reason).await {
            Ok(true) => JobOutcome::Retrying,
            Ok(false) => JobOutcome::Failed,
            Err(e) => {
                error!("[Worker] Failed to requeue job {}: {:?}", job_id, e);
                JobOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{CoordinatorConfig, EnqueueOptions, MemoryDedupBackend};
    use crate::discovery::DiscoveryConfig;
    use crate::jobs::{InMemoryJobQueue, JobRequest};
    use crate::lookup::MemoryTransactionLookup;
    use crate::monitor::MonitorConfig;
    use crate::processor::ProcessorConfig;
    use crate::store::FinalityStore;
    use crate::test_utils::{batch, tracked_tx, Harness};
    use crate::validation::{ContractValidator, DEFAULT_VALIDATION_TTL};
    use orbit_finality_core::parser::BatchParser;
    use orbit_finality_core::types::{BatchStatus, TxStatus};

    struct Fixture {
        h: Harness,
        queue: Arc<InMemoryJobQueue>,
        coordinator: Arc<JobCoordinator>,
        lookup: Arc<MemoryTransactionLookup>,
        worker: Arc<JobWorker>,
    }

    async fn fixture(max_attempts: u32) -> Fixture {
        let h = Harness::new(1001).await;
        let queue = Arc::new(InMemoryJobQueue::new(max_attempts, h.clock.clone()));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(MemoryDedupBackend::new(h.clock.clone())),
            queue.clone(),
            h.clock.clone(),
            CoordinatorConfig::default(),
            Some(h.metrics.clone()),
        ));
        let discovery = Arc::new(BatchDiscovery::new(
            h.registry.clone(),
            h.store.clone(),
            BatchParser::default(),
            DiscoveryConfig::default(),
            Some(h.metrics.clone()),
        ));
        let monitor = Arc::new(BatchMonitor::new(
            h.registry.clone(),
            h.clock.clone(),
            MonitorConfig::default(),
            Some(h.metrics.clone()),
        ));
        let lookup = Arc::new(MemoryTransactionLookup::new());
        let processor = Arc::new(TransactionProcessor::new(
            h.registry.clone(),
            lookup.clone(),
            discovery.clone(),
            Arc::new(ContractValidator::new(DEFAULT_VALIDATION_TTL, h.clock.clone())),
            h.clock.clone(),
            ProcessorConfig::default(),
            Some(h.metrics.clone()),
        ));
        let worker = Arc::new(JobWorker::new(
            queue.clone(),
            coordinator.clone(),
            discovery,
            monitor,
            processor,
            WorkerConfig {
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
            Some(h.metrics.clone()),
        ));
        Fixture {
            h,
            queue,
            coordinator,
            lookup,
            worker,
        }
    }

    #[tokio::test]
    async fn discovery_job_completes_and_releases_the_coordinator_slot() {
        let f = fixture(3).await;
        f.h.deliver_on_chain(0, 100, &[]);
        f.h.set_batch_count(1);
        f.coordinator
            .enqueue_discovery(1001, EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(f.coordinator.in_flight(1001), 1);

        let job = f.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(f.worker.handle(job).await, JobOutcome::Completed);
        assert_eq!(f.coordinator.in_flight(1001), 0);
        assert!(f.h.store.get_batch(1001, 0).await.unwrap().is_some());
        assert_eq!(
            f.h.metrics
                .jobs_completed
                .with_label_values(&["batch-discovery", "completed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn transient_failures_go_back_to_the_queue() {
        let f = fixture(2).await;
        f.h.rpc.fail_calls_with(Some("503 service unavailable"));
        f.coordinator
            .enqueue_discovery(1001, EnqueueOptions::default())
            .await
            .unwrap();

        let job = f.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(f.worker.handle(job).await, JobOutcome::Retrying);
        assert_eq!(f.queue.pending().await.unwrap(), 1);
        assert_eq!(f.coordinator.in_flight(1001), 1);

        let job = f.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(f.worker.handle(job).await, JobOutcome::Failed);
        assert_eq!(f.queue.pending().await.unwrap(), 0);
        assert_eq!(f.coordinator.in_flight(1001), 0);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let f = fixture(3).await;
        f.queue
            .enqueue(JobRequest {
                unique_id: "process-404".into(),
                payload: JobPayload::ProcessTransaction { transaction_id: 404 },
                priority: 0,
            })
            .await
            .unwrap();

        let job = f.queue.dequeue().await.unwrap().unwrap();
        assert_eq!(f.worker.handle(job).await, JobOutcome::Failed);
        assert_eq!(f.queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_loop_drains_the_queue_until_cancelled() {
        let f = fixture(3).await;
        f.h.persist_batch(batch(1001, 0)).await;
        f.h.set_latest_confirmed(0);
        f.lookup.insert(tracked_tx(1, 1001, 12));
        f.queue
            .enqueue(JobRequest {
                unique_id: "process-1".into(),
                payload: JobPayload::ProcessTransaction { transaction_id: 1 },
                priority: 0,
            })
            .await
            .unwrap();
        f.coordinator
            .enqueue_monitoring(1001, EnqueueOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.worker.clone().run(cancel.clone()));
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let confirmed = f
                    .h
                    .store
                    .get_batch(1001, 0)
                    .await
                    .unwrap()
                    .is_some_and(|b| b.status == BatchStatus::Confirmed);
                let processed = f.h.store.get_transaction_state(1).await.unwrap().is_some();
                if confirmed && processed && f.coordinator.in_flight(1001) == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        handle.await.unwrap();

        let state = f.h.store.get_transaction_state(1).await.unwrap().unwrap();
        assert!(matches!(state.status, TxStatus::Sequenced | TxStatus::Posted));
    }
}
