// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use super::contract::{
    first_address, first_u64, first_uint, ArbBridge, ContractInterface, RollupCore,
    SequencerInbox,
};
use super::provider::ParentChainRpc;
use super::rate_limiter::RateLimiter;
use super::retry::{retry_rpc, RetryPolicy};
use crate::error::{FinalityError, FinalityResult, TransientKind};
use crate::metrics::FinalityMetrics;
use ethers::abi::{Abi, Address, Token};
use ethers::types::{Bytes, U256};
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilientClientConfig {
    pub max_requests_per_window: usize,
    #[serde(with = "crate::duration_ms")]
    pub rate_window: Duration,
    pub failure_threshold: u32,
    #[serde(with = "crate::duration_ms")]
    pub reset_timeout: Duration,
    pub success_threshold: u32,
    #[serde(with = "crate::duration_ms")]
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ResilientClientConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: 10,
            rate_window: Duration::from_secs(1),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractHealth {
    pub contract: &'static str,
    pub address: Address,
    pub healthy: bool,
    pub deployed: bool,
    pub circuit_state: CircuitState,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct CallStats {
    total: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// One parent-chain contract behind a rate limiter, circuit breaker and
/// retry loop. `I` fixes the callable method set.
pub struct ResilientContract<I: ContractInterface> {
    address: Address,
    rpc: Arc<dyn ParentChainRpc>,
    abi: Abi,
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    call_timeout: Duration,
    stats: CallStats,
    metrics: Option<Arc<FinalityMetrics>>,
    _interface: PhantomData<fn() -> I>,
}

impl<I: ContractInterface> std::fmt::Debug for ResilientContract<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientContract")
            .field("contract", &I::NAME)
            .field("address", &self.address)
            .field("circuit_state", &self.breaker.state())
            .finish()
    }
}

impl<I: ContractInterface> ResilientContract<I> {
    pub fn new(
        rpc: Arc<dyn ParentChainRpc>,
        address: Address,
        config: &ResilientClientConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> FinalityResult<Self> {
        if address.is_zero() {
            return Err(FinalityError::Validation(format!(
                "{} address is the zero address",
                I::NAME
            )));
        }
        Ok(Self {
            address,
            rpc,
            abi: I::abi()?,
            limiter: RateLimiter::new(config.max_requests_per_window, config.rate_window),
            breaker: CircuitBreaker::new(
                format!("{}@{:?}", I::NAME, address),
                CircuitBreakerConfig {
                    failure_threshold: config.failure_threshold,
                    reset_timeout: config.reset_timeout,
                    success_threshold: config.success_threshold,
                },
            ),
            retry: config.retry.clone(),
            call_timeout: config.call_timeout,
            stats: CallStats::default(),
            metrics,
            _interface: PhantomData,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Calls `method` with `args`, decoding the outputs.
    ///
    /// Unknown methods are rejected before any RPC is issued.
    pub async fn call(&self, method: &str, args: &[Token]) -> FinalityResult<Vec<Token>> {
        let function = self.abi.function(method).map_err(|_| {
            FinalityError::Validation(format!("{} has no method '{}'", I::NAME, method))
        })?;
        let data: Bytes = function
            .encode_input(args)
            .map_err(|e| FinalityError::Validation(format!("{}.{}: {}", I::NAME, method, e)))?
            .into();

        let _timer = self.metrics.as_ref().map(|m| {
            m.rpc_calls.with_label_values(&[I::NAME, method]).inc();
            m.rpc_call_latency
                .with_label_values(&[I::NAME, method])
                .start_timer()
        });

        let label = format!("{}.{}", I::NAME, method);
        let result = retry_rpc(&self.retry, &label, || self.attempt(data.clone())).await;
        self.publish_breaker_state();

        match result {
            Ok(raw) => function.decode_output(&raw).map_err(|e| {
                FinalityError::Decode(format!("{}.{} output: {}", I::NAME, method, e))
            }),
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.rpc_call_failures
                        .with_label_values(&[I::NAME, e.error_type()])
                        .inc();
                }
                Err(e)
            }
        }
    }

    async fn attempt(&self, data: Bytes) -> FinalityResult<Bytes> {
        self.breaker.try_acquire()?;
        if self.limiter.wait_for_slot().await {
            if let Some(m) = &self.metrics {
                m.rpc_rate_limit_waits.with_label_values(&[I::NAME]).inc();
            }
        }
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        let outcome = match tokio::time::timeout(self.call_timeout, self.rpc.call(self.address, data))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(FinalityError::transient(
                TransientKind::Timeout,
                format!("{} call timed out after {:?}", I::NAME, self.call_timeout),
            )),
        };
        match &outcome {
            Ok(_) => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                self.breaker.on_success();
            }
            Err(e) => {
                debug!("[RpcClient] {} call failed: {}", I::NAME, e);
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.breaker.on_failure();
            }
        }
        outcome
    }

    fn publish_breaker_state(&self) {
        if let Some(m) = &self.metrics {
            m.circuit_breaker_state
                .with_label_values(&[I::NAME])
                .set(self.breaker.state().as_gauge());
        }
    }

    /// Reports deployment, breaker state and in-instance call counters.
    pub async fn health_check(&self) -> ContractHealth {
        let (deployed, error) = match self.rpc.get_code(self.address).await {
            Ok(code) => (!code.is_empty(), None),
            Err(e) => (false, Some(e.to_string())),
        };
        let circuit_state = self.breaker.state();
        ContractHealth {
            contract: I::NAME,
            address: self.address,
            healthy: deployed && circuit_state != CircuitState::Open,
            deployed,
            circuit_state,
            total_calls: self.stats.total.load(Ordering::Relaxed),
            successful_calls: self.stats.succeeded.load(Ordering::Relaxed),
            failed_calls: self.stats.failed.load(Ordering::Relaxed),
            error,
        }
    }
}

impl ResilientContract<SequencerInbox> {
    pub async fn batch_count(&self) -> FinalityResult<u64> {
        first_u64("batchCount", self.call("batchCount", &[]).await?)
    }

    pub async fn total_delayed_messages_read(&self) -> FinalityResult<U256> {
        first_uint(
            "totalDelayedMessagesRead",
            self.call("totalDelayedMessagesRead", &[]).await?,
        )
    }

    pub async fn bridge(&self) -> FinalityResult<Address> {
        first_address("bridge", self.call("bridge", &[]).await?)
    }
}

impl ResilientContract<RollupCore> {
    pub async fn latest_confirmed(&self) -> FinalityResult<u64> {
        first_u64("latestConfirmed", self.call("latestConfirmed", &[]).await?)
    }

    pub async fn latest_node_created(&self) -> FinalityResult<u64> {
        first_u64("latestNodeCreated", self.call("latestNodeCreated", &[]).await?)
    }

    pub async fn confirm_period_blocks(&self) -> FinalityResult<u64> {
        first_u64(
            "confirmPeriodBlocks",
            self.call("confirmPeriodBlocks", &[]).await?,
        )
    }

    pub async fn bridge(&self) -> FinalityResult<Address> {
        first_address("bridge", self.call("bridge", &[]).await?)
    }

    pub async fn sequencer_inbox(&self) -> FinalityResult<Address> {
        first_address("sequencerInbox", self.call("sequencerInbox", &[]).await?)
    }
}

impl ResilientContract<ArbBridge> {
    pub async fn sequencer_message_count(&self) -> FinalityResult<U256> {
        first_uint(
            "sequencerMessageCount",
            self.call("sequencerMessageCount", &[]).await?,
        )
    }

    pub async fn delayed_message_count(&self) -> FinalityResult<U256> {
        first_uint(
            "delayedMessageCount",
            self.call("delayedMessageCount", &[]).await?,
        )
    }
}

/// The three contract clients a chain needs, sharing one provider.
#[derive(Debug)]
pub struct ChainContracts {
    pub sequencer_inbox: ResilientContract<SequencerInbox>,
    pub rollup: ResilientContract<RollupCore>,
    pub bridge: ResilientContract<ArbBridge>,
}

impl ChainContracts {
    pub fn new(
        rpc: Arc<dyn ParentChainRpc>,
        chain: &crate::chain::ChainConfig,
        config: &ResilientClientConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> FinalityResult<Self> {
        Ok(Self {
            sequencer_inbox: ResilientContract::new(
                rpc.clone(),
                chain.contracts.sequencer_inbox,
                config,
                metrics.clone(),
            )?,
            rollup: ResilientContract::new(rpc.clone(), chain.contracts.rollup, config, metrics.clone())?,
            bridge: ResilientContract::new(rpc, chain.contracts.bridge, config, metrics)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockParentChain;

    fn config() -> ResilientClientConfig {
        ResilientClientConfig {
            max_requests_per_window: 100,
            rate_window: Duration::from_secs(1),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(10),
            success_threshold: 3,
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
            },
        }
    }

    fn inbox(rpc: Arc<MockParentChain>) -> ResilientContract<SequencerInbox> {
        ResilientContract::new(
            rpc,
            Address::repeat_byte(0x11),
            &config(),
            Some(Arc::new(FinalityMetrics::new_for_testing())),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn typed_call_decodes_output() {
        let rpc = Arc::new(MockParentChain::new());
        rpc.set_uint(Address::repeat_byte(0x11), "batchCount()", U256::from(42));
        let client = inbox(rpc);
        assert_eq!(client.batch_count().await.unwrap(), 42);
        let health = client.health_check().await;
        assert_eq!(health.total_calls, 1);
        assert_eq!(health.successful_calls, 1);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected_without_rpc() {
        let rpc = Arc::new(MockParentChain::new());
        let client = inbox(rpc.clone());
        let err = client.call("latestConfirmed", &[]).await.unwrap_err();
        assert!(matches!(err, FinalityError::Validation(_)));
        assert_eq!(rpc.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_opens_after_repeated_failures() {
        let rpc = Arc::new(MockParentChain::new());
        rpc.fail_calls_with(Some("503 service unavailable"));
        let client = inbox(rpc.clone());
        for _ in 0..5 {
            assert!(client.batch_count().await.unwrap_err().is_transient());
        }
        assert_eq!(client.circuit_state(), CircuitState::Open);

        let err = client.batch_count().await.unwrap_err();
        assert!(err.is_circuit_open());
        assert_eq!(rpc.call_count(), 5);

        rpc.fail_calls_with(None);
        rpc.set_uint(Address::repeat_byte(0x11), "batchCount()", U256::from(1));
        tokio::time::advance(Duration::from_secs(10)).await;
        client.batch_count().await.unwrap();
        assert_eq!(client.circuit_state(), CircuitState::HalfOpen);
        client.batch_count().await.unwrap();
        client.batch_count().await.unwrap();
        assert_eq!(client.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn health_check_reports_undeployed_contract() {
        let rpc = Arc::new(MockParentChain::new());
        let client = inbox(rpc);
        let health = client.health_check().await;
        assert!(!health.deployed);
        assert!(!health.healthy);
        assert_eq!(health.circuit_state, CircuitState::Closed);
    }

    #[test]
    fn zero_address_is_rejected() {
        let rpc = Arc::new(MockParentChain::new());
        let result =
            ResilientContract::<RollupCore>::new(rpc, Address::zero(), &config(), None);
        assert!(matches!(result, Err(FinalityError::Validation(_))));
    }
}
