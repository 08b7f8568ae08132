// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration

use crate::coordinator::CoordinatorConfig;
use crate::discovery::DiscoveryConfig;
use crate::monitor::MonitorConfig;
use crate::processor::ProcessorConfig;
use crate::scheduler::SchedulerConfig;
use crate::validation::DEFAULT_VALIDATION_TTL;
use crate::worker::WorkerConfig;
use anyhow::{Context, Result};
use orbit_finality_core::parser::ParserLimits;
use orbit_finality_core::rpc::ResilientClientConfig;
use orbit_finality_core::{ChainConfig, FinalityError, FinalityResult};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Chains seeded into the store at start-up
    pub chains: Vec<ChainConfig>,
    pub rpc: ResilientClientConfig,
    pub parser: ParserLimits,
    pub discovery: DiscoveryConfig,
    pub monitor: MonitorConfig,
    pub processor: ProcessorConfig,
    pub coordinator: CoordinatorConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    /// Shared dedup store; process-local when unset
    pub redis_url: Option<String>,
    /// How long a successful contract validation is reused
    pub validation_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chains: Vec::new(),
            rpc: ResilientClientConfig::default(),
            parser: ParserLimits::default(),
            discovery: DiscoveryConfig::default(),
            monitor: MonitorConfig::default(),
            processor: ProcessorConfig::default(),
            coordinator: CoordinatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            redis_url: None,
            validation_ttl_secs: DEFAULT_VALIDATION_TTL.as_secs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from YAML file with environment variable substitution
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read engine config file: {:?}", path))?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        let contents = substitute_env_vars(contents)?;
        let config: EngineConfig =
            serde_yaml::from_str(&contents).context("Failed to parse engine config YAML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FinalityResult<()> {
        let mut seen = HashSet::new();
        for chain in &self.chains {
            chain.validate()?;
            if !seen.insert(chain.chain_id) {
                return Err(FinalityError::Configuration(format!(
                    "chain {} is configured twice",
                    chain.chain_id
                )));
            }
        }
        if self.worker.concurrency == 0 {
            return Err(FinalityError::Configuration(
                "worker.concurrency must be at least 1".into(),
            ));
        }
        if self.discovery.chunk_size == 0 || self.discovery.min_chunk_size == 0 {
            return Err(FinalityError::Configuration(
                "discovery chunk sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn validation_ttl(&self) -> Duration {
        Duration::from_secs(self.validation_ttl_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").context("invalid env pattern")?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let var_name = &cap[1];

        if let Ok(var_value) = std::env::var(var_name) {
            result = result.replace(full_match, &var_value);
        } else {
            // Keep the placeholder if env var is not set
            tracing::warn!(
                "Environment variable {} not found, keeping placeholder",
                var_name
            );
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CHAIN_YAML: &str = r#"
chains:
  - chain_id: 42161
    name: arbitrum-one
    parent_chain_id: 1
    parent_rpc_url: "${FINALITY_TEST_PARENT_RPC}"
    contracts:
      rollup: "0x5ef0d09d1e6204141b4d37530808ed19f60fba35"
      bridge: "0x8315177ab297ba92a06054ce80a67ed4dbd7ed3a"
      sequencer_inbox: "0x1c479675ad559dc151f6ec7ed3fbf8cee79582b6"
      inbox: "0x4dbd4fc535ac27206064b68ffcf827b0a60bab3f"
      outbox: "0x0b9857ae2d4a3dbe74ffe1d7df045bb7f96e4840"
    deployment_block: 15411056
"#;

    #[test]
    fn loads_yaml_with_env_substitution_and_defaults() {
        std::env::set_var("FINALITY_TEST_PARENT_RPC", "https://eth.example.org");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CHAIN_YAML.as_bytes()).unwrap();
        file.write_all(b"processor:\n  sequencing_timeout: 900\nredis_url: redis://localhost:6379\n")
            .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.chains.len(), 1);
        let chain = &config.chains[0];
        assert_eq!(chain.parent_rpc_url, "https://eth.example.org");
        assert_eq!(chain.deployment_block, 15_411_056);
        assert_eq!(chain.confirm_period_blocks, 45_818);

        assert_eq!(config.processor.sequencing_timeout, Duration::from_secs(900));
        assert_eq!(config.processor.posting_timeout, Duration::from_secs(3600));
        assert_eq!(config.coordinator.discovery_max_age, Duration::from_secs(120));
        assert_eq!(config.coordinator.monitoring_max_age, Duration::from_secs(300));
        assert_eq!(config.discovery.chunk_size, 500);
        assert_eq!(config.worker.job_timeout, Duration::from_secs(120));
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.validation_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn missing_env_var_keeps_placeholder() {
        let out = substitute_env_vars("url: ${FINALITY_TEST_UNSET_VARIABLE}").unwrap();
        assert_eq!(out, "url: ${FINALITY_TEST_UNSET_VARIABLE}");
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = EngineConfig::from_yaml("{}").unwrap();
        assert!(config.chains.is_empty());
        assert!(config.redis_url.is_none());
        assert_eq!(config.scheduler.discovery_interval, Duration::from_secs(60));
    }

    #[test]
    fn duplicate_chains_are_rejected() {
        std::env::set_var("FINALITY_TEST_PARENT_RPC", "https://eth.example.org");
        let yaml = format!("{}{}", CHAIN_YAML, &CHAIN_YAML["\nchains:\n".len()..]);
        let err = EngineConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("configured twice"), "{}", err);
    }

    #[test]
    fn zero_address_is_rejected() {
        std::env::set_var("FINALITY_TEST_PARENT_RPC", "https://eth.example.org");
        let yaml = CHAIN_YAML.replace(
            "0x0b9857ae2d4a3dbe74ffe1d7df045bb7f96e4840",
            "0x0000000000000000000000000000000000000000",
        );
        let err = EngineConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("zero address"), "{}", err);
    }
}
