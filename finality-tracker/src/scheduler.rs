// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic job producer.
//!
//! Ticks are independent: discovery and monitoring go through the
//! coordinator's rate limit, processing jobs for every non-terminal
//! transaction are deduplicated by the queue's unique ids.

use crate::coordinator::{EnqueueOptions, JobCoordinator};
use crate::jobs::{JobPayload, JobQueue, JobRequest};
use crate::store::FinalityStore;
use orbit_finality_core::duration_secs;
use orbit_finality_core::FinalityResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration_secs")]
    pub discovery_interval: Duration,
    #[serde(with = "duration_secs")]
    pub monitoring_interval: Duration,
    #[serde(with = "duration_secs")]
    pub processing_interval: Duration,
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
    /// Active transactions re-queued per chain per processing tick
    pub processing_batch_size: usize,
    pub processing_priority: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(60),
            monitoring_interval: Duration::from_secs(2 * 60),
            processing_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5 * 60),
            processing_batch_size: 200,
            processing_priority: 20,
        }
    }
}

pub struct Scheduler {
    store: Arc<dyn FinalityStore>,
    coordinator: Arc<JobCoordinator>,
    queue: Arc<dyn JobQueue>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn FinalityStore>,
        coordinator: Arc<JobCoordinator>,
        queue: Arc<dyn JobQueue>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            queue,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("[Scheduler] Starting");
        info!("  Discovery interval: {:?}", self.config.discovery_interval);
        info!("  Monitoring interval: {:?}", self.config.monitoring_interval);
        info!("  Processing interval: {:?}", self.config.processing_interval);

        let mut discovery_timer = tokio::time::interval(self.config.discovery_interval);
        let mut monitoring_timer = tokio::time::interval(self.config.monitoring_interval);
        let mut processing_timer = tokio::time::interval(self.config.processing_interval);
        let mut sweep_timer = tokio::time::interval(self.config.sweep_interval);
        // Nothing to sweep at start-up
        sweep_timer.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[Scheduler] Shutting down");
                    break;
                }
                _ = discovery_timer.tick() => {
                    if let Err(e) = self.tick_discovery().await {
                        error!("[Scheduler] Discovery tick failed: {:?}", e);
                    }
                }
                _ = monitoring_timer.tick() => {
                    if let Err(e) = self.tick_monitoring().await {
                        error!("[Scheduler] Monitoring tick failed: {:?}", e);
                    }
                }
                _ = processing_timer.tick() => {
                    if let Err(e) = self.tick_processing().await {
                        error!("[Scheduler] Processing tick failed: {:?}", e);
                    }
                }
                _ = sweep_timer.tick() => {
                    if let Err(e) = self.coordinator.sweep().await {
                        error!("[Scheduler] Coordinator sweep failed: {:?}", e);
                    }
                }
            }
        }
    }

    /// Requests discovery for every configured chain; returns how many
    /// requests were enqueued.
    pub async fn tick_discovery(&self) -> FinalityResult<usize> {
        let mut enqueued = 0;
        for chain in self.store.list_chains().await? {
            match self
                .coordinator
                .enqueue_discovery(chain.chain_id, EnqueueOptions::default())
                .await
            {
                Ok(result) if result.is_enqueued() => enqueued += 1,
                Ok(_) => {}
                Err(e) => error!(
                    "[Scheduler] Discovery enqueue for chain {} failed: {:?}",
                    chain.chain_id, e
                ),
            }
        }
        debug!("[Scheduler] Enqueued {} discovery jobs", enqueued);
        Ok(enqueued)
    }

    pub async fn tick_monitoring(&self) -> FinalityResult<usize> {
        let mut enqueued = 0;
        for chain in self.store.list_chains().await? {
            match self
                .coordinator
                .enqueue_monitoring(chain.chain_id, EnqueueOptions::default())
                .await
            {
                Ok(result) if result.is_enqueued() => enqueued += 1,
                Ok(_) => {}
                Err(e) => error!(
                    "[Scheduler] Monitoring enqueue for chain {} failed: {:?}",
                    chain.chain_id, e
                ),
            }
        }
        debug!("[Scheduler] Enqueued {} monitoring jobs", enqueued);
        Ok(enqueued)
    }

    /// Queues a processing attempt for every non-terminal transaction.
    pub async fn tick_processing(&self) -> FinalityResult<usize> {
        let mut enqueued = 0;
        for chain in self.store.list_chains().await? {
            let active = self
                .store
                .active_transaction_states(chain.chain_id, self.config.processing_batch_size)
                .await?;
            for state in active {
                if self.track_transaction(state.transaction_id).await? {
                    enqueued += 1;
                }
            }
        }
        debug!("[Scheduler] Enqueued {} processing jobs", enqueued);
        Ok(enqueued)
    }

    /// Queues a processing attempt for one transaction unless one is pending.
    pub async fn track_transaction(&self, transaction_id: u64) -> FinalityResult<bool> {
        self.queue
            .enqueue(JobRequest {
                unique_id: format!("process-{}", transaction_id),
                payload: JobPayload::ProcessTransaction { transaction_id },
                priority: self.config.processing_priority,
            })
            .await
    }
}
