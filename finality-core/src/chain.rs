// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-chain configuration of finality tracking.

use crate::error::{FinalityError, FinalityResult};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Ethereum mainnet block time, used to turn block counts into wall time.
const DEFAULT_PARENT_BLOCK_TIME_SECS: u64 = 12;

/// Arbitrum One's confirm period (~6.4 days of parent blocks).
const DEFAULT_CONFIRM_PERIOD_BLOCKS: u64 = 45_818;

const DEFAULT_FINALIZATION_WINDOW_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChainType {
    #[default]
    Rollup,
    AnyTrust,
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainType::Rollup => write!(f, "Rollup"),
            ChainType::AnyTrust => write!(f, "AnyTrust"),
        }
    }
}

impl std::str::FromStr for ChainType {
    type Err = FinalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Rollup" | "rollup" => Ok(ChainType::Rollup),
            "AnyTrust" | "anytrust" | "any_trust" => Ok(ChainType::AnyTrust),
            other => Err(FinalityError::Configuration(format!(
                "unknown chain type '{}'",
                other
            ))),
        }
    }
}

/// Infrastructure contracts deployed on the parent chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAddresses {
    pub rollup: Address,
    pub bridge: Address,
    pub sequencer_inbox: Address,
    pub inbox: Address,
    pub outbox: Address,
    #[serde(default)]
    pub challenge_manager: Option<Address>,
    #[serde(default)]
    pub validator_wallet_creator: Option<Address>,
    #[serde(default)]
    pub stake_token: Option<Address>,
}

impl ContractAddresses {
    /// The contracts every chain must have, with their display names.
    pub fn required(&self) -> [(&'static str, Address); 5] {
        [
            ("rollup", self.rollup),
            ("bridge", self.bridge),
            ("sequencer_inbox", self.sequencer_inbox),
            ("inbox", self.inbox),
            ("outbox", self.outbox),
        ]
    }

    pub fn optional(&self) -> Vec<(&'static str, Address)> {
        [
            ("challenge_manager", self.challenge_manager),
            ("validator_wallet_creator", self.validator_wallet_creator),
            ("stake_token", self.stake_token),
        ]
        .into_iter()
        .filter_map(|(name, addr)| addr.map(|a| (name, a)))
        .collect()
    }
}

/// One monitored child chain (workspace).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Child chain id, also the key every Batch and TransactionState hangs off
    pub chain_id: u64,
    #[serde(default)]
    pub name: String,
    pub parent_chain_id: u64,
    pub parent_rpc_url: String,
    #[serde(default)]
    pub chain_type: ChainType,
    pub contracts: ContractAddresses,
    #[serde(default = "default_confirm_period_blocks")]
    pub confirm_period_blocks: u64,
    #[serde(default = "default_parent_block_time_secs")]
    pub parent_block_time_secs: u64,
    /// Age after which a confirmed batch is considered finalized
    #[serde(default = "default_finalization_window_secs")]
    pub finalization_window_secs: u64,
    /// First parent block worth scanning on the RPC discovery path
    #[serde(default)]
    pub deployment_block: u64,
}

fn default_confirm_period_blocks() -> u64 {
    DEFAULT_CONFIRM_PERIOD_BLOCKS
}

fn default_parent_block_time_secs() -> u64 {
    DEFAULT_PARENT_BLOCK_TIME_SECS
}

fn default_finalization_window_secs() -> u64 {
    DEFAULT_FINALIZATION_WINDOW_SECS
}

impl ChainConfig {
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("chain-{}", self.chain_id)
        } else {
            self.name.clone()
        }
    }

    /// Challenge period expressed in wall time.
    pub fn challenge_period(&self) -> Duration {
        Duration::from_secs(
            self.confirm_period_blocks
                .saturating_mul(self.parent_block_time_secs),
        )
    }

    pub fn finalization_window(&self) -> Duration {
        Duration::from_secs(self.finalization_window_secs)
    }

    /// Rejects configurations that must never reach the engine.
    pub fn validate(&self) -> FinalityResult<()> {
        if self.chain_id == 0 {
            return Err(FinalityError::Validation("chain_id must be non-zero".into()));
        }
        if self.parent_chain_id == 0 {
            return Err(FinalityError::Validation(format!(
                "chain {}: parent_chain_id must be non-zero",
                self.chain_id
            )));
        }
        if self.parent_rpc_url.trim().is_empty() {
            return Err(FinalityError::Validation(format!(
                "chain {}: parent_rpc_url is empty",
                self.chain_id
            )));
        }
        url::Url::parse(&self.parent_rpc_url).map_err(|e| {
            FinalityError::Validation(format!(
                "chain {}: invalid parent_rpc_url '{}': {}",
                self.chain_id, self.parent_rpc_url, e
            ))
        })?;
        for (name, address) in self
            .contracts
            .required()
            .into_iter()
            .chain(self.contracts.optional())
        {
            if address.is_zero() {
                return Err(FinalityError::Validation(format!(
                    "chain {}: {} address is the zero address",
                    self.chain_id, name
                )));
            }
        }
        if self.parent_block_time_secs == 0 {
            return Err(FinalityError::Validation(format!(
                "chain {}: parent_block_time_secs must be non-zero",
                self.chain_id
            )));
        }
        Ok(())
    }
}

/// Parses a 20-byte hex address, rejecting anything malformed.
pub fn parse_address(value: &str) -> FinalityResult<Address> {
    let trimmed = value.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    if hex_part.len() != 40 {
        return Err(FinalityError::Validation(format!(
            "invalid address '{}': expected 20 bytes",
            value
        )));
    }
    hex_part
        .parse::<Address>()
        .map_err(|e| FinalityError::Validation(format!("invalid address '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::from_low_u64_be(n as u64)
    }

    fn sample() -> ChainConfig {
        ChainConfig {
            chain_id: 42_170,
            name: "nova".into(),
            parent_chain_id: 1,
            parent_rpc_url: "http://localhost:8545".into(),
            chain_type: ChainType::AnyTrust,
            contracts: ContractAddresses {
                rollup: addr(1),
                bridge: addr(2),
                sequencer_inbox: addr(3),
                inbox: addr(4),
                outbox: addr(5),
                challenge_manager: None,
                validator_wallet_creator: None,
                stake_token: None,
            },
            confirm_period_blocks: 100,
            parent_block_time_secs: 12,
            finalization_window_secs: 600,
            deployment_block: 0,
        }
    }

    #[test]
    fn valid_config_passes() {
        sample().validate().unwrap();
        assert_eq!(sample().challenge_period(), Duration::from_secs(1200));
    }

    #[test]
    fn zero_address_rejected() {
        let mut config = sample();
        config.contracts.stake_token = Some(Address::zero());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stake_token"));
    }

    #[test]
    fn bad_url_rejected() {
        let mut config = sample();
        config.parent_rpc_url = "not a url".into();
        assert!(matches!(
            config.validate(),
            Err(FinalityError::Validation(_))
        ));
    }

    #[test]
    fn parse_address_checks_length() {
        assert!(parse_address("0x1234").is_err());
        assert!(parse_address("0x000000000000000000000000000000000000dEaD").is_ok());
        assert!(parse_address("0xzz0000000000000000000000000000000000dead").is_err());
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let json = serde_json::json!({
            "chain_id": 7,
            "parent_chain_id": 1,
            "parent_rpc_url": "http://localhost:8545",
            "contracts": {
                "rollup": "0x0000000000000000000000000000000000000001",
                "bridge": "0x0000000000000000000000000000000000000002",
                "sequencer_inbox": "0x0000000000000000000000000000000000000003",
                "inbox": "0x0000000000000000000000000000000000000004",
                "outbox": "0x0000000000000000000000000000000000000005"
            }
        });
        let config: ChainConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.chain_type, ChainType::Rollup);
        assert_eq!(config.confirm_period_blocks, DEFAULT_CONFIRM_PERIOD_BLOCKS);
        assert_eq!(config.display_name(), "chain-7");
    }
}
