// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain runtime handles: the metered parent-chain provider and the
//! resilient contract clients built on the raw one.
//!
//! Runtimes are cached so circuit breakers and rate limiters persist across
//! jobs for the same chain within a process.

use crate::store::FinalityStore;
use orbit_finality_core::rpc::{
    ChainContracts, EthersParentChain, MeteredParentChain, ParentChainRpc, ResilientClientConfig,
};
use orbit_finality_core::{ChainConfig, FinalityError, FinalityMetrics, FinalityResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Builds the parent-chain provider for a chain.
pub type RpcFactory =
    Arc<dyn Fn(&ChainConfig) -> FinalityResult<Arc<dyn ParentChainRpc>> + Send + Sync>;

pub struct ChainRuntime {
    pub config: ChainConfig,
    pub rpc: Arc<dyn ParentChainRpc>,
    pub contracts: ChainContracts,
}

impl std::fmt::Debug for ChainRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRuntime")
            .field("chain_id", &self.config.chain_id)
            .field("contracts", &self.contracts)
            .finish_non_exhaustive()
    }
}

pub struct ChainRegistry {
    store: Arc<dyn FinalityStore>,
    factory: RpcFactory,
    client_config: ResilientClientConfig,
    metrics: Option<Arc<FinalityMetrics>>,
    runtimes: Mutex<HashMap<u64, Arc<ChainRuntime>>>,
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("client_config", &self.client_config)
            .finish_non_exhaustive()
    }
}

impl ChainRegistry {
    pub fn new(
        store: Arc<dyn FinalityStore>,
        factory: RpcFactory,
        client_config: ResilientClientConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            store,
            factory,
            client_config,
            metrics,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Registry talking to each chain's configured HTTP endpoint.
    pub fn with_http_providers(
        store: Arc<dyn FinalityStore>,
        client_config: ResilientClientConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        let factory: RpcFactory = Arc::new(|chain: &ChainConfig| {
            Ok(Arc::new(EthersParentChain::new(&chain.parent_rpc_url)?) as Arc<dyn ParentChainRpc>)
        });
        Self::new(store, factory, client_config, metrics)
    }

    pub fn store(&self) -> &Arc<dyn FinalityStore> {
        &self.store
    }

    /// Runtime for `chain_id`, rebuilt when the stored configuration changed.
    pub async fn runtime(&self, chain_id: u64) -> FinalityResult<Arc<ChainRuntime>> {
        let config = self.store.get_chain(chain_id).await?.ok_or_else(|| {
            FinalityError::Configuration(format!("chain {} is not configured", chain_id))
        })?;

        if let Some(runtime) = self.cached(chain_id) {
            if runtime.config == config {
                return Ok(runtime);
            }
        }

        config.validate()?;
        let provider = (self.factory)(&config)?;
        // Contract clients meter their own calls; everything else goes
        // through the metered provider.
        let contracts = ChainContracts::new(
            provider.clone(),
            &config,
            &self.client_config,
            self.metrics.clone(),
        )?;
        let rpc: Arc<dyn ParentChainRpc> = Arc::new(MeteredParentChain::new(
            provider,
            config.display_name(),
            &self.client_config,
            self.metrics.clone(),
        ));
        let runtime = Arc::new(ChainRuntime {
            config,
            rpc,
            contracts,
        });
        info!(
            "[Registry] Built runtime for {} ({})",
            runtime.config.display_name(),
            chain_id
        );
        self.runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(chain_id, runtime.clone());
        Ok(runtime)
    }

    /// Explicit configuration update; the only way to change a chain's
    /// contracts once it is tracked.
    pub async fn update_chain(&self, config: &ChainConfig) -> FinalityResult<()> {
        config.validate()?;
        self.store.upsert_chain(config).await?;
        self.invalidate(config.chain_id);
        Ok(())
    }

    pub fn invalidate(&self, chain_id: u64) {
        self.runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&chain_id);
    }

    fn cached(&self, chain_id: u64) -> Option<Arc<ChainRuntime>> {
        self.runtimes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&chain_id)
            .cloned()
    }
}
