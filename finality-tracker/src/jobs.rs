// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Job payloads and the queue seam the worker pulls from.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orbit_finality_core::{Clock, FinalityResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const DISCOVERY_QUEUE: &str = "batch-discovery";
pub const MONITORING_QUEUE: &str = "batch-monitoring";
pub const PROCESSING_QUEUE: &str = "transaction-processing";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobPayload {
    #[serde(rename_all = "camelCase")]
    DiscoverBatches { chain_id: u64 },
    #[serde(rename_all = "camelCase")]
    MonitorBatches { chain_id: u64 },
    #[serde(rename_all = "camelCase")]
    ProcessTransaction { transaction_id: u64 },
}

impl JobPayload {
    pub fn queue(&self) -> &'static str {
        match self {
            JobPayload::DiscoverBatches { .. } => DISCOVERY_QUEUE,
            JobPayload::MonitorBatches { .. } => MONITORING_QUEUE,
            JobPayload::ProcessTransaction { .. } => PROCESSING_QUEUE,
        }
    }

    pub fn chain_id(&self) -> Option<u64> {
        match self {
            JobPayload::DiscoverBatches { chain_id } | JobPayload::MonitorBatches { chain_id } => {
                Some(*chain_id)
            }
            JobPayload::ProcessTransaction { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRequest {
    /// Jobs with the same id are not queued twice while one is pending.
    pub unique_id: String,
    pub payload: JobPayload,
    /// Lower runs first.
    pub priority: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub payload: JobPayload,
    pub priority: i32,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn queue(&self) -> &'static str {
        self.payload.queue()
    }
}

/// Durable job queue shared by scheduler and workers.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Returns false when a job with the same unique id is already pending.
    async fn enqueue(&self, request: JobRequest) -> FinalityResult<bool>;

    async fn dequeue(&self) -> FinalityResult<Option<Job>>;

    async fn complete(&self, job: &Job) -> FinalityResult<()>;

    /// Records a failed attempt. Returns true when the job was requeued.
    async fn fail(&self, job: Job, error: &str) -> FinalityResult<bool>;

    async fn pending(&self) -> FinalityResult<usize>;
}

#[derive(Debug)]
struct Queued {
    job: Job,
    seq: u64,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // BinaryHeap is a max-heap: lower priority value, then older, pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    /// Unique ids queued or running.
    live: HashSet<String>,
    next_seq: u64,
}

/// Process-local queue with at-least-once redelivery.
#[derive(Debug)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    max_attempts: u32,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobQueue {
    pub fn new(max_attempts: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            max_attempts: max_attempts.max(1),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(state: &mut QueueState, job: Job) {
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Queued { job, seq });
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, request: JobRequest) -> FinalityResult<bool> {
        let mut state = self.lock();
        if !state.live.insert(request.unique_id.clone()) {
            debug!("[JobQueue] {} already pending", request.unique_id);
            return Ok(false);
        }
        let job = Job {
            id: request.unique_id,
            payload: request.payload,
            priority: request.priority,
            attempts: 0,
            enqueued_at: self.clock.now(),
        };
        Self::push(&mut state, job);
        Ok(true)
    }

    async fn dequeue(&self) -> FinalityResult<Option<Job>> {
        Ok(self.lock().heap.pop().map(|mut queued| {
            queued.job.attempts += 1;
            queued.job
        }))
    }

    async fn complete(&self, job: &Job) -> FinalityResult<()> {
        self.lock().live.remove(&job.id);
        Ok(())
    }

    async fn fail(&self, job: Job, error: &str) -> FinalityResult<bool> {
        let mut state = self.lock();
        if job.attempts >= self.max_attempts {
            warn!(
                "[JobQueue] Giving up on {} after {} attempts: {}",
                job.id, job.attempts, error
            );
            state.live.remove(&job.id);
            return Ok(false);
        }
        debug!(
            "[JobQueue] Requeueing {} (attempt {}): {}",
            job.id, job.attempts, error
        );
        Self::push(&mut state, job);
        Ok(true)
    }

    async fn pending(&self) -> FinalityResult<usize> {
        Ok(self.lock().heap.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::epoch;
    use orbit_finality_core::ManualClock;

    fn queue(max_attempts: u32) -> InMemoryJobQueue {
        InMemoryJobQueue::new(max_attempts, Arc::new(ManualClock::new(epoch())))
    }

    fn request(id: &str, priority: i32, transaction_id: u64) -> JobRequest {
        JobRequest {
            unique_id: id.to_string(),
            payload: JobPayload::ProcessTransaction { transaction_id },
            priority,
        }
    }

    #[test]
    fn payloads_use_the_wire_shape() {
        let json = serde_json::to_value(JobPayload::DiscoverBatches { chain_id: 42 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "discoverBatches", "chainId": 42}));
        let parsed: JobPayload =
            serde_json::from_str(r#"{"type":"processTransaction","transactionId":7}"#).unwrap();
        assert_eq!(parsed, JobPayload::ProcessTransaction { transaction_id: 7 });
        assert_eq!(parsed.queue(), PROCESSING_QUEUE);
        assert_eq!(parsed.chain_id(), None);
    }

    #[tokio::test]
    async fn priority_then_fifo() {
        let queue = queue(3);
        assert!(queue.enqueue(request("a", 5, 1)).await.unwrap());
        assert!(queue.enqueue(request("b", 1, 2)).await.unwrap());
        assert!(queue.enqueue(request("c", 5, 3)).await.unwrap());

        let order: Vec<_> = [
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
            queue.dequeue().await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|j| j.id)
        .collect();
        assert_eq!(order, ["b", "a", "c"]);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unique_ids_are_not_queued_twice() {
        let queue = queue(3);
        assert!(queue.enqueue(request("tx-1", 0, 1)).await.unwrap());
        assert!(!queue.enqueue(request("tx-1", 0, 1)).await.unwrap());

        let job = queue.dequeue().await.unwrap().unwrap();
        assert!(!queue.enqueue(request("tx-1", 0, 1)).await.unwrap());
        queue.complete(&job).await.unwrap();
        assert!(queue.enqueue(request("tx-1", 0, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_jobs_are_redelivered_up_to_the_limit() {
        let queue = queue(2);
        queue.enqueue(request("tx-1", 0, 1)).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.attempts, 1);
        assert!(queue.fail(first, "503").await.unwrap());

        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(second.attempts, 2);
        assert!(!queue.fail(second, "503").await.unwrap());
        assert_eq!(queue.pending().await.unwrap(), 0);
        assert!(queue.enqueue(request("tx-1", 0, 1)).await.unwrap());
    }
}
