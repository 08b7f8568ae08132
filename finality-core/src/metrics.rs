// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

const RPC_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20.,
    30., 60.,
];

const JOB_DURATION_SEC_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10., 20., 30., 45., 60., 90., 120., 180., 300.,
];

#[derive(Clone, Debug)]
pub struct FinalityMetrics {
    pub rpc_calls: IntCounterVec,
    pub rpc_call_failures: IntCounterVec,
    pub rpc_call_latency: HistogramVec,
    pub rpc_rate_limit_waits: IntCounterVec,
    /// 0 = closed, 1 = half-open, 2 = open
    pub circuit_breaker_state: IntGaugeVec,

    pub batches_discovered: IntCounterVec,
    pub batches_skipped: IntCounterVec,
    pub discovery_errors: IntCounterVec,
    pub last_discovered_sequence: IntGaugeVec,
    pub batch_status_transitions: IntCounterVec,
    pub parser_degradations: IntCounterVec,

    pub transaction_transitions: IntCounterVec,
    pub processor_errors: IntCounterVec,

    pub jobs_enqueued: IntCounterVec,
    pub jobs_skipped: IntCounterVec,
    pub jobs_completed: IntCounterVec,
    pub jobs_timed_out: IntCounterVec,
    pub job_duration: HistogramVec,
}

impl FinalityMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            rpc_calls: register_int_counter_vec_with_registry!(
                "finality_rpc_calls",
                "Total number of contract calls issued, by contract and method",
                &["contract", "method"],
                registry,
            )
            .unwrap(),
            rpc_call_failures: register_int_counter_vec_with_registry!(
                "finality_rpc_call_failures",
                "Total number of failed contract calls, by contract and error type",
                &["contract", "error_type"],
                registry,
            )
            .unwrap(),
            rpc_call_latency: register_histogram_vec_with_registry!(
                "finality_rpc_call_latency",
                "Latency of contract calls including retries, by contract and method",
                &["contract", "method"],
                RPC_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            rpc_rate_limit_waits: register_int_counter_vec_with_registry!(
                "finality_rpc_rate_limit_waits",
                "Number of times a call waited for a rate limiter slot",
                &["contract"],
                registry,
            )
            .unwrap(),
            circuit_breaker_state: register_int_gauge_vec_with_registry!(
                "finality_circuit_breaker_state",
                "Circuit breaker state per contract (0 closed, 1 half-open, 2 open)",
                &["contract"],
                registry,
            )
            .unwrap(),
            batches_discovered: register_int_counter_vec_with_registry!(
                "finality_batches_discovered",
                "Number of batches persisted by discovery, by chain and path",
                &["chain_id", "path"],
                registry,
            )
            .unwrap(),
            batches_skipped: register_int_counter_vec_with_registry!(
                "finality_batches_skipped",
                "Number of batches skipped because they were already persisted",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            discovery_errors: register_int_counter_vec_with_registry!(
                "finality_discovery_errors",
                "Per-item discovery errors, by chain and error type",
                &["chain_id", "error_type"],
                registry,
            )
            .unwrap(),
            last_discovered_sequence: register_int_gauge_vec_with_registry!(
                "finality_last_discovered_sequence",
                "Highest batch sequence number persisted per chain",
                &["chain_id"],
                registry,
            )
            .unwrap(),
            batch_status_transitions: register_int_counter_vec_with_registry!(
                "finality_batch_status_transitions",
                "Batch status changes applied by the monitor",
                &["chain_id", "to"],
                registry,
            )
            .unwrap(),
            parser_degradations: register_int_counter_vec_with_registry!(
                "finality_parser_degradations",
                "Batch payloads that could not be decoded structurally",
                &["reason"],
                registry,
            )
            .unwrap(),
            transaction_transitions: register_int_counter_vec_with_registry!(
                "finality_transaction_transitions",
                "Transaction state transitions, by source and target state",
                &["from", "to"],
                registry,
            )
            .unwrap(),
            processor_errors: register_int_counter_vec_with_registry!(
                "finality_processor_errors",
                "Processor invocations that ended in an error, by error type",
                &["error_type"],
                registry,
            )
            .unwrap(),
            jobs_enqueued: register_int_counter_vec_with_registry!(
                "finality_jobs_enqueued",
                "Jobs handed to the queue, by queue and reason",
                &["queue", "reason"],
                registry,
            )
            .unwrap(),
            jobs_skipped: register_int_counter_vec_with_registry!(
                "finality_jobs_skipped",
                "Enqueue requests suppressed by the coordinator",
                &["queue", "reason"],
                registry,
            )
            .unwrap(),
            jobs_completed: register_int_counter_vec_with_registry!(
                "finality_jobs_completed",
                "Jobs run to completion by the worker, by queue and outcome",
                &["queue", "outcome"],
                registry,
            )
            .unwrap(),
            jobs_timed_out: register_int_counter_vec_with_registry!(
                "finality_jobs_timed_out",
                "Jobs abandoned after exceeding their wall-clock timeout",
                &["queue"],
                registry,
            )
            .unwrap(),
            job_duration: register_histogram_vec_with_registry!(
                "finality_job_duration",
                "Wall-clock duration of worker jobs",
                &["queue"],
                JOB_DURATION_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
