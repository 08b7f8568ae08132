// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Method sets of the parent-chain contracts the engine reads.

use crate::error::{FinalityError, FinalityResult};
use ethers::abi::{Abi, Address, Token};
use ethers::types::U256;

/// Describes one contract's callable surface as human-readable ABI.
pub trait ContractInterface: Send + Sync + 'static {
    /// Label used in logs, metrics and breaker errors.
    const NAME: &'static str;
    const ABI: &'static [&'static str];

    fn abi() -> FinalityResult<Abi> {
        ethers::abi::parse_abi(Self::ABI).map_err(|e| {
            FinalityError::Configuration(format!("invalid ABI for {}: {}", Self::NAME, e))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SequencerInbox;

impl ContractInterface for SequencerInbox {
    const NAME: &'static str = "sequencer_inbox";
    const ABI: &'static [&'static str] = &[
        "function batchCount() external view returns (uint256)",
        "function totalDelayedMessagesRead() external view returns (uint256)",
        "function bridge() external view returns (address)",
    ];
}

#[derive(Debug, Clone, Copy)]
pub struct RollupCore;

impl ContractInterface for RollupCore {
    const NAME: &'static str = "rollup";
    const ABI: &'static [&'static str] = &[
        "function latestConfirmed() external view returns (uint64)",
        "function latestNodeCreated() external view returns (uint64)",
        "function confirmPeriodBlocks() external view returns (uint64)",
        "function bridge() external view returns (address)",
        "function sequencerInbox() external view returns (address)",
    ];
}

#[derive(Debug, Clone, Copy)]
pub struct ArbBridge;

impl ContractInterface for ArbBridge {
    const NAME: &'static str = "bridge";
    const ABI: &'static [&'static str] = &[
        "function sequencerMessageCount() external view returns (uint256)",
        "function delayedMessageCount() external view returns (uint256)",
    ];
}

pub(crate) fn first_uint(method: &str, tokens: Vec<Token>) -> FinalityResult<U256> {
    match tokens.into_iter().next() {
        Some(Token::Uint(value)) => Ok(value),
        other => Err(FinalityError::Decode(format!(
            "{} returned {:?}, expected uint",
            method, other
        ))),
    }
}

pub(crate) fn first_u64(method: &str, tokens: Vec<Token>) -> FinalityResult<u64> {
    let value = first_uint(method, tokens)?;
    if value > U256::from(u64::MAX) {
        return Err(FinalityError::Decode(format!(
            "{} returned {} which does not fit in u64",
            method, value
        )));
    }
    Ok(value.as_u64())
}

pub(crate) fn first_address(method: &str, tokens: Vec<Token>) -> FinalityResult<Address> {
    match tokens.into_iter().next() {
        Some(Token::Address(value)) => Ok(value),
        other => Err(FinalityError::Decode(format!(
            "{} returned {:?}, expected address",
            method, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interfaces_parse() {
        let inbox = SequencerInbox::abi().unwrap();
        assert!(inbox.function("batchCount").is_ok());
        assert!(inbox.function("latestConfirmed").is_err());

        let rollup = RollupCore::abi().unwrap();
        assert_eq!(rollup.functions().count(), 5);
        assert!(ArbBridge::abi().unwrap().function("sequencerMessageCount").is_ok());
    }

    #[test]
    fn uint_decoding_rejects_overflow() {
        assert_eq!(first_u64("m", vec![Token::Uint(U256::from(5))]).unwrap(), 5);
        assert!(first_u64("m", vec![Token::Uint(U256::MAX)]).is_err());
        assert!(first_u64("m", vec![Token::Bool(true)]).is_err());
        assert!(first_address("m", vec![]).is_err());
    }
}
