// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Rate-limited, circuit-broken, retrying access to parent-chain contracts.

pub mod circuit_breaker;
pub mod client;
pub mod contract;
pub mod events;
pub mod metered;
pub mod provider;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ChainContracts, ContractHealth, ResilientClientConfig, ResilientContract};
pub use contract::{ArbBridge, ContractInterface, RollupCore, SequencerInbox};
pub use events::{BatchDataLocation, BatchDeliveredEvent};
pub use metered::MeteredParentChain;
pub use provider::{EthersParentChain, LogQuery, ParentChainRpc};
pub use rate_limiter::RateLimiter;
pub use retry::{retry_rpc, RetryPolicy};
