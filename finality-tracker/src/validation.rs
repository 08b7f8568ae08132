// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Contract reachability checks run before any transaction state is touched.
//!
//! A chain is valid when every required contract has deployed code and a
//! representative read (`batchCount`) succeeds. Successful reports are cached
//! per chain for a short TTL so hot processing paths do not re-issue the
//! `eth_getCode` calls on every invocation.

use crate::chains::ChainRuntime;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use orbit_finality_core::clock::elapsed_between;
use orbit_finality_core::{Clock, FinalityError, FinalityResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_VALIDATION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractCheck {
    pub contract: &'static str,
    pub address: Address,
    pub deployed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub chain_id: u64,
    pub contracts: Vec<ContractCheck>,
    /// Result of the representative `batchCount` read
    pub batch_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub validated_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.error.is_none()
            && self.batch_count.is_some()
            && self.contracts.iter().all(|c| c.deployed)
    }

    fn failure_summary(&self) -> String {
        let missing: Vec<_> = self
            .contracts
            .iter()
            .filter(|c| !c.deployed)
            .map(|c| format!("{} ({:?})", c.contract, c.address))
            .collect();
        let mut parts = Vec::new();
        if !missing.is_empty() {
            parts.push(format!("no code at {}", missing.join(", ")));
        }
        if let Some(error) = &self.error {
            parts.push(format!("batchCount failed: {}", error));
        }
        format!(
            "chain {} contracts failed validation: {}",
            self.chain_id,
            parts.join("; ")
        )
    }
}

#[derive(Debug)]
pub struct ContractValidator {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<u64, ValidationReport>>,
}

impl ContractValidator {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Checks every required contract. Transient provider failures are
    /// returned as errors so callers can retry; anything else ends up in the
    /// report.
    pub async fn validate(&self, runtime: &ChainRuntime) -> FinalityResult<ValidationReport> {
        let mut contracts = Vec::new();
        for (name, address) in runtime.config.contracts.required() {
            let code = runtime.rpc.get_code(address).await?;
            contracts.push(ContractCheck {
                contract: name,
                address,
                deployed: !code.is_empty(),
            });
        }

        let (batch_count, error) = match runtime.contracts.sequencer_inbox.batch_count().await {
            Ok(count) => (Some(count), None),
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => (None, Some(e.to_string())),
        };

        let report = ValidationReport {
            chain_id: runtime.config.chain_id,
            contracts,
            batch_count,
            error,
            validated_at: self.clock.now(),
        };
        if report.is_valid() {
            self.lock().insert(report.chain_id, report.clone());
        } else {
            self.invalidate(report.chain_id);
        }
        Ok(report)
    }

    /// Fails with `Validation` unless the chain's contracts are reachable.
    pub async fn ensure_valid(&self, runtime: &ChainRuntime) -> FinalityResult<()> {
        let chain_id = runtime.config.chain_id;
        if let Some(report) = self.cached(chain_id) {
            debug!("[Validator] Using cached validation for chain {}", chain_id);
            return if report.is_valid() {
                Ok(())
            } else {
                Err(FinalityError::Validation(report.failure_summary()))
            };
        }
        let report = self.validate(runtime).await?;
        if report.is_valid() {
            Ok(())
        } else {
            let summary = report.failure_summary();
            warn!("[Validator] {}", summary);
            Err(FinalityError::Validation(summary))
        }
    }

    pub fn invalidate(&self, chain_id: u64) {
        self.lock().remove(&chain_id);
    }

    fn cached(&self, chain_id: u64) -> Option<ValidationReport> {
        let mut cache = self.lock();
        let fresh = cache
            .get(&chain_id)
            .map(|r| elapsed_between(r.validated_at, self.clock.now()) < self.ttl)?;
        if fresh {
            cache.get(&chain_id).cloned()
        } else {
            cache.remove(&chain_id);
            None
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ValidationReport>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Harness;

    #[tokio::test]
    async fn deployed_contracts_validate_and_are_cached() {
        let h = Harness::new(1001).await;
        let runtime = h.registry.runtime(1001).await.unwrap();
        let validator = ContractValidator::new(Duration::from_secs(60), h.clock.clone());

        let report = validator.validate(&runtime).await.unwrap();
        assert!(report.is_valid());
        assert_eq!(report.contracts.len(), 5);
        assert_eq!(report.batch_count, Some(0));

        let calls = h.rpc.call_count();
        validator.ensure_valid(&runtime).await.unwrap();
        assert_eq!(h.rpc.call_count(), calls);

        h.clock.advance(Duration::from_secs(61));
        validator.ensure_valid(&runtime).await.unwrap();
        assert_eq!(h.rpc.call_count(), calls + 1);
    }

    #[tokio::test]
    async fn missing_code_is_a_validation_error() {
        let h = Harness::new(1001).await;
        h.rpc.set_code(h.chain.contracts.outbox, Vec::new());
        let runtime = h.registry.runtime(1001).await.unwrap();
        let validator = ContractValidator::new(DEFAULT_VALIDATION_TTL, h.clock.clone());

        let err = validator.ensure_valid(&runtime).await.unwrap_err();
        assert!(matches!(err, FinalityError::Validation(_)));
        assert!(err.to_string().contains("outbox"));
    }

    #[tokio::test]
    async fn reverting_read_fails_validation() {
        let h = Harness::new(1001).await;
        h.rpc.fail_calls_with(Some("execution reverted"));
        let runtime = h.registry.runtime(1001).await.unwrap();
        let validator = ContractValidator::new(DEFAULT_VALIDATION_TTL, h.clock.clone());

        let report = validator.validate(&runtime).await.unwrap();
        assert!(!report.is_valid());
        assert!(report.error.unwrap().contains("execution reverted"));
    }

    #[tokio::test]
    async fn transient_failures_propagate() {
        let h = Harness::new(1001).await;
        h.rpc.fail_calls_with(Some("429 Too Many Requests"));
        let runtime = h.registry.runtime(1001).await.unwrap();
        let validator = ContractValidator::new(DEFAULT_VALIDATION_TTL, h.clock.clone());

        let err = validator.ensure_valid(&runtime).await.unwrap_err();
        assert!(err.is_transient());
    }
}
