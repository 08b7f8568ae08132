// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `ParentChainRpc` decorator putting raw provider reads (log scans, block,
//! transaction and receipt lookups) behind a rate limiter, circuit breaker
//! and retry loop.

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::client::ResilientClientConfig;
use super::provider::{LogQuery, ParentChainRpc};
use super::rate_limiter::RateLimiter;
use super::retry::{retry_rpc, RetryPolicy};
use crate::error::{FinalityError, FinalityResult, TransientKind};
use crate::metrics::FinalityMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, Log, Transaction, TransactionReceipt, H256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Metric label for provider-level requests.
const SOURCE: &str = "Provider";

pub struct MeteredParentChain {
    inner: Arc<dyn ParentChainRpc>,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
    metrics: Option<Arc<FinalityMetrics>>,
}

impl std::fmt::Debug for MeteredParentChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredParentChain")
            .field("circuit_state", &self.breaker.state())
            .finish_non_exhaustive()
    }
}

impl MeteredParentChain {
    pub fn new(
        inner: Arc<dyn ParentChainRpc>,
        name: impl Into<String>,
        config: &ResilientClientConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(config.max_requests_per_window, config.rate_window),
            breaker: CircuitBreaker::new(
                format!("provider@{}", name.into()),
                CircuitBreakerConfig {
                    failure_threshold: config.failure_threshold,
                    reset_timeout: config.reset_timeout,
                    success_threshold: config.success_threshold,
                },
            ),
            retry: config.retry.clone(),
            call_timeout: config.call_timeout,
            metrics,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn request<T, F, Fut>(&self, method: &'static str, op: F) -> FinalityResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = FinalityResult<T>>,
    {
        let _timer = self.metrics.as_ref().map(|m| {
            m.rpc_calls.with_label_values(&[SOURCE, method]).inc();
            m.rpc_call_latency
                .with_label_values(&[SOURCE, method])
                .start_timer()
        });

        // Range-limit errors go straight back to the caller, which narrows
        // the query instead of repeating it.
        let result = retry_rpc(&self.retry, method, || {
            let attempt = self.attempt(method, op());
            async move {
                match attempt.await {
                    Err(e) if e.is_block_range_limit() => Ok(Err(e)),
                    other => other.map(Ok),
                }
            }
        })
        .await
        .and_then(|inner| inner);

        if let Some(m) = &self.metrics {
            m.circuit_breaker_state
                .with_label_values(&[SOURCE])
                .set(self.breaker.state().as_gauge());
            if let Err(e) = &result {
                m.rpc_call_failures
                    .with_label_values(&[SOURCE, e.error_type()])
                    .inc();
            }
        }
        result
    }

    async fn attempt<T>(
        &self,
        method: &'static str,
        request: impl Future<Output = FinalityResult<T>>,
    ) -> FinalityResult<T> {
        self.breaker.try_acquire()?;
        if self.limiter.wait_for_slot().await {
            if let Some(m) = &self.metrics {
                m.rpc_rate_limit_waits.with_label_values(&[SOURCE]).inc();
            }
        }
        let outcome = match tokio::time::timeout(self.call_timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(FinalityError::transient(
                TransientKind::Timeout,
                format!("{} timed out after {:?}", method, self.call_timeout),
            )),
        };
        match &outcome {
            // The provider answered; only the window was too wide.
            Err(e) if e.is_block_range_limit() => self.breaker.on_success(),
            Err(e) => {
                debug!("[RpcClient] {} failed: {}", method, e);
                self.breaker.on_failure();
            }
            Ok(_) => self.breaker.on_success(),
        }
        outcome
    }
}

#[async_trait]
impl ParentChainRpc for MeteredParentChain {
    async fn chain_id(&self) -> FinalityResult<u64> {
        self.request("eth_chainId", || self.inner.chain_id()).await
    }

    async fn block_number(&self) -> FinalityResult<u64> {
        self.request("eth_blockNumber", || self.inner.block_number())
            .await
    }

    async fn get_code(&self, address: Address) -> FinalityResult<Bytes> {
        self.request("eth_getCode", || self.inner.get_code(address))
            .await
    }

    async fn call(&self, to: Address, data: Bytes) -> FinalityResult<Bytes> {
        self.request("eth_call", || self.inner.call(to, data.clone()))
            .await
    }

    async fn get_logs(&self, query: &LogQuery) -> FinalityResult<Vec<Log>> {
        self.request("eth_getLogs", || self.inner.get_logs(query))
            .await
    }

    async fn get_block_timestamp(&self, block: u64) -> FinalityResult<Option<DateTime<Utc>>> {
        self.request("eth_getBlockByNumber", || {
            self.inner.get_block_timestamp(block)
        })
        .await
    }

    async fn get_transaction(&self, hash: H256) -> FinalityResult<Option<Transaction>> {
        self.request("eth_getTransactionByHash", || {
            self.inner.get_transaction(hash)
        })
        .await
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> FinalityResult<Option<TransactionReceipt>> {
        self.request("eth_getTransactionReceipt", || {
            self.inner.get_transaction_receipt(hash)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockParentChain;

    fn config() -> ResilientClientConfig {
        ResilientClientConfig {
            max_requests_per_window: 2,
            rate_window: Duration::from_secs(1),
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
        }
    }

    fn query(from_block: u64, to_block: u64) -> LogQuery {
        LogQuery {
            address: Address::repeat_byte(0x0a),
            topic0: H256::repeat_byte(0x01),
            topic1: None,
            from_block,
            to_block,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_log_scans_open_the_breaker() {
        let mock = Arc::new(MockParentChain::new());
        mock.fail_logs_with(Some("503 service unavailable"));
        let metrics = Arc::new(FinalityMetrics::new_for_testing());
        let rpc = MeteredParentChain::new(mock.clone(), "test", &config(), Some(metrics.clone()));

        for _ in 0..3 {
            assert!(rpc.get_logs(&query(0, 10)).await.unwrap_err().is_transient());
        }
        assert_eq!(rpc.circuit_state(), CircuitState::Open);

        let err = rpc.get_logs(&query(0, 10)).await.unwrap_err();
        assert_eq!(err.error_type(), "circuit_open");
        assert_eq!(mock.log_queries().len(), 3);
        assert_eq!(
            metrics
                .rpc_calls
                .with_label_values(&[SOURCE, "eth_getLogs"])
                .get(),
            4
        );
    }

    #[tokio::test(start_paused = true)]
    async fn range_limit_errors_are_returned_without_tripping() {
        let mock = Arc::new(MockParentChain::new());
        mock.set_max_log_range(Some(100));
        let rpc = MeteredParentChain::new(mock.clone(), "test", &config(), None);

        for _ in 0..5 {
            let err = rpc.get_logs(&query(0, 1_000)).await.unwrap_err();
            assert!(err.is_block_range_limit());
        }
        assert_eq!(rpc.circuit_state(), CircuitState::Closed);
        assert!(rpc.get_logs(&query(0, 99)).await.unwrap().is_empty());
        assert_eq!(mock.log_queries().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_wait_for_a_rate_limit_slot() {
        let mock = Arc::new(MockParentChain::new());
        let metrics = Arc::new(FinalityMetrics::new_for_testing());
        let rpc = MeteredParentChain::new(mock, "test", &config(), Some(metrics.clone()));
        let start = tokio::time::Instant::now();

        for _ in 0..3 {
            rpc.block_number().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(
            metrics.rpc_rate_limit_waits.with_label_values(&[SOURCE]).get(),
            1
        );
    }
}
