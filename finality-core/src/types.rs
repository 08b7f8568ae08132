// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{FinalityError, FinalityResult};
use crate::parser::ParseMetadata;
use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Rollup-level confirmation status of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Confirmed,
    Finalized,
}

impl BatchStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Confirmed => "confirmed",
            BatchStatus::Finalized => "finalized",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = FinalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "confirmed" => Ok(BatchStatus::Confirmed),
            "finalized" => Ok(BatchStatus::Finalized),
            other => Err(FinalityError::Decode(format!("unknown batch status '{}'", other))),
        }
    }
}

/// Where the batch payload lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataLocation {
    Onchain,
    Das,
    External,
}

impl DataLocation {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DataLocation::Onchain => "onchain",
            DataLocation::Das => "das",
            DataLocation::External => "external",
        }
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataLocation {
    type Err = FinalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onchain" => Ok(DataLocation::Onchain),
            "das" => Ok(DataLocation::Das),
            "external" => Ok(DataLocation::External),
            other => Err(FinalityError::Decode(format!("unknown data location '{}'", other))),
        }
    }
}

/// Time bounds carried by the delivery event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    pub min_timestamp: u64,
    pub max_timestamp: u64,
    pub min_block_number: u64,
    pub max_block_number: u64,
}

/// Inclusive range of child-chain blocks a batch is believed to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub first: u64,
    pub last: u64,
}

impl BlockRange {
    pub fn contains(&self, block: u64) -> bool {
        self.first <= block && block <= self.last
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_bounds: Option<TimeBounds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_delayed_messages_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_blocks: Option<BlockRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse: Option<ParseMetadata>,
}

/// One discovered `SequencerBatchDelivered` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub chain_id: u64,
    pub sequence_number: u64,
    pub parent_block_number: u64,
    pub parent_tx_hash: H256,
    pub parent_log_index: u64,
    pub before_acc: H256,
    pub after_acc: H256,
    pub delayed_acc: H256,
    pub gas_used: Option<U256>,
    pub gas_price: Option<U256>,
    pub gas_cost: Option<U256>,
    pub posted_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub transaction_count: u64,
    pub batch_size_bytes: u64,
    pub data_hash: H256,
    pub data_location: DataLocation,
    pub metadata: BatchMetadata,
}

impl Batch {
    /// Whether the parsed child block range covers `block`; `None` when the
    /// payload did not reveal a range.
    pub fn covers_child_block(&self, block: u64) -> Option<bool> {
        self.metadata.child_blocks.map(|range| range.contains(block))
    }
}

/// Result of a unique-constrained batch insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another writer already persisted (chain, sequence number).
    Duplicate,
}

/// Transaction finality state. Ordered; `Failed` sits outside the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Submitted,
    Sequenced,
    Posted,
    Confirmed,
    Finalized,
    Failed,
}

impl TxStatus {
    pub const PROGRESSION: [TxStatus; 5] = [
        TxStatus::Submitted,
        TxStatus::Sequenced,
        TxStatus::Posted,
        TxStatus::Confirmed,
        TxStatus::Finalized,
    ];

    /// Position in the progression; `None` for `Failed`.
    pub const fn rank(&self) -> Option<u8> {
        match self {
            TxStatus::Submitted => Some(0),
            TxStatus::Sequenced => Some(1),
            TxStatus::Posted => Some(2),
            TxStatus::Confirmed => Some(3),
            TxStatus::Finalized => Some(4),
            TxStatus::Failed => None,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Finalized | TxStatus::Failed)
    }

    pub fn can_transition_to(&self, next: TxStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Submitted => "SUBMITTED",
            TxStatus::Sequenced => "SEQUENCED",
            TxStatus::Posted => "POSTED",
            TxStatus::Confirmed => "CONFIRMED",
            TxStatus::Finalized => "FINALIZED",
            TxStatus::Failed => "FAILED",
        }
    }

    /// Share of the progression completed, for read-side views.
    pub fn progress_percent(&self) -> u8 {
        match self.rank() {
            Some(rank) => rank * 25,
            None => 0,
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = FinalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUBMITTED" => Ok(TxStatus::Submitted),
            "SEQUENCED" => Ok(TxStatus::Sequenced),
            "POSTED" => Ok(TxStatus::Posted),
            "CONFIRMED" => Ok(TxStatus::Confirmed),
            "FINALIZED" => Ok(TxStatus::Finalized),
            "FAILED" => Ok(TxStatus::Failed),
            other => Err(FinalityError::Decode(format!("unknown transaction state '{}'", other))),
        }
    }
}

/// How a transaction was matched to its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    BlockRange,
    Timestamp,
}

/// Evidence recorded on entering a state, keyed by the state's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateEvidence {
    Submitted {
        block_number: u64,
    },
    Sequenced {
        batch_sequence_number: u64,
        parent_tx_hash: H256,
        parent_block_number: u64,
        matched_by: MatchMethod,
    },
    Posted {
        batch_sequence_number: u64,
        batch_confirmed_at: Option<DateTime<Utc>>,
    },
    Confirmed {
        batch_sequence_number: u64,
        batch_finalized_at: Option<DateTime<Utc>>,
    },
    Finalized {
        challenge_period_secs: u64,
    },
    Failed {
        previous: TxStatus,
        reason: String,
    },
}

impl StateEvidence {
    pub fn status(&self) -> TxStatus {
        match self {
            StateEvidence::Submitted { .. } => TxStatus::Submitted,
            StateEvidence::Sequenced { .. } => TxStatus::Sequenced,
            StateEvidence::Posted { .. } => TxStatus::Posted,
            StateEvidence::Confirmed { .. } => TxStatus::Confirmed,
            StateEvidence::Finalized { .. } => TxStatus::Finalized,
            StateEvidence::Failed { .. } => TxStatus::Failed,
        }
    }
}

/// A child-chain transaction as known to the upstream ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTransaction {
    pub id: u64,
    pub hash: H256,
    pub chain_id: u64,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    pub transaction_id: u64,
    pub tx_hash: H256,
    pub chain_id: u64,
    pub block_number: u64,
    pub status: TxStatus,
    pub submitted_at: DateTime<Utc>,
    pub sequenced_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub batch_sequence_number: Option<u64>,
    pub state_data: Vec<StateEvidence>,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionState {
    /// Fresh `SUBMITTED` state taken from the transaction's own submission.
    pub fn submitted(tx: &TrackedTransaction) -> Self {
        Self {
            transaction_id: tx.id,
            tx_hash: tx.hash,
            chain_id: tx.chain_id,
            block_number: tx.block_number,
            status: TxStatus::Submitted,
            submitted_at: tx.timestamp,
            sequenced_at: None,
            posted_at: None,
            confirmed_at: None,
            finalized_at: None,
            failed_at: None,
            batch_sequence_number: None,
            state_data: vec![StateEvidence::Submitted {
                block_number: tx.block_number,
            }],
            failure_reason: None,
            updated_at: tx.timestamp,
        }
    }

    /// When the given state was entered, if it was.
    pub fn entered_at(&self, status: TxStatus) -> Option<DateTime<Utc>> {
        match status {
            TxStatus::Submitted => Some(self.submitted_at),
            TxStatus::Sequenced => self.sequenced_at,
            TxStatus::Posted => self.posted_at,
            TxStatus::Confirmed => self.confirmed_at,
            TxStatus::Finalized => self.finalized_at,
            TxStatus::Failed => self.failed_at,
        }
    }

    /// When the current state was entered, falling back to submission time.
    pub fn current_state_entered_at(&self) -> DateTime<Utc> {
        self.entered_at(self.status).unwrap_or(self.submitted_at)
    }

    pub fn evidence_for(&self, status: TxStatus) -> Option<&StateEvidence> {
        self.state_data.iter().rev().find(|e| e.status() == status)
    }

    /// Moves forward to the state named by `evidence`.
    pub fn advance(&mut self, evidence: StateEvidence, at: DateTime<Utc>) -> FinalityResult<()> {
        let next = evidence.status();
        if !self.status.can_transition_to(next) {
            return Err(FinalityError::Validation(format!(
                "illegal transition {} -> {} for transaction {}",
                self.status, next, self.transaction_id
            )));
        }
        match &evidence {
            StateEvidence::Sequenced {
                batch_sequence_number,
                ..
            } => {
                self.batch_sequence_number = Some(*batch_sequence_number);
                self.sequenced_at = Some(at);
            }
            StateEvidence::Posted { .. } => self.posted_at = Some(at),
            StateEvidence::Confirmed { .. } => self.confirmed_at = Some(at),
            StateEvidence::Finalized { .. } => self.finalized_at = Some(at),
            StateEvidence::Failed { reason, .. } => {
                self.failed_at = Some(at);
                self.failure_reason = Some(reason.clone());
            }
            StateEvidence::Submitted { .. } => {}
        }
        self.status = next;
        self.state_data.push(evidence);
        self.updated_at = at;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> FinalityResult<()> {
        let previous = self.status;
        self.advance(
            StateEvidence::Failed {
                previous,
                reason: reason.into(),
            },
            at,
        )
    }
}

/// Aggregate view of a chain's batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub chain_id: u64,
    pub total_batches: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub finalized: u64,
    pub latest_sequence_number: Option<u64>,
    pub total_transactions: u64,
    pub average_transactions_per_batch: f64,
    pub last_posted_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tx() -> TrackedTransaction {
        TrackedTransaction {
            id: 9,
            hash: H256::repeat_byte(0xab),
            chain_id: 1001,
            block_number: 77,
            timestamp: Utc::now(),
        }
    }

    #[rstest]
    #[case(TxStatus::Submitted, TxStatus::Sequenced, true)]
    #[case(TxStatus::Submitted, TxStatus::Posted, true)]
    #[case(TxStatus::Posted, TxStatus::Sequenced, false)]
    #[case(TxStatus::Confirmed, TxStatus::Confirmed, false)]
    #[case(TxStatus::Confirmed, TxStatus::Failed, true)]
    #[case(TxStatus::Finalized, TxStatus::Failed, false)]
    #[case(TxStatus::Failed, TxStatus::Submitted, false)]
    fn transitions(#[case] from: TxStatus, #[case] to: TxStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn history_is_a_subsequence_of_the_progression() {
        let mut state = TransactionState::submitted(&tx());
        let now = Utc::now();
        state
            .advance(
                StateEvidence::Sequenced {
                    batch_sequence_number: 4,
                    parent_tx_hash: H256::zero(),
                    parent_block_number: 10,
                    matched_by: MatchMethod::Timestamp,
                },
                now,
            )
            .unwrap();
        assert!(state
            .advance(StateEvidence::Submitted { block_number: 1 }, now)
            .is_err());
        state
            .advance(
                StateEvidence::Confirmed {
                    batch_sequence_number: 4,
                    batch_finalized_at: None,
                },
                now,
            )
            .unwrap();
        state.fail("boom", now).unwrap();
        assert!(state.fail("again", now).is_err());

        let ranks: Vec<_> = state
            .state_data
            .iter()
            .filter_map(|e| e.status().rank())
            .collect();
        assert!(ranks.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(state.status, TxStatus::Failed);
        assert_eq!(state.failure_reason.as_deref(), Some("boom"));
        assert_eq!(state.batch_sequence_number, Some(4));
    }

    #[test]
    fn evidence_serializes_tagged_by_state() {
        let evidence = StateEvidence::Finalized {
            challenge_period_secs: 60,
        };
        let json = serde_json::to_value(&evidence).unwrap();
        assert_eq!(json["state"], "FINALIZED");
        assert_eq!(json["challenge_period_secs"], 60);
        let back: StateEvidence = serde_json::from_value(json).unwrap();
        assert_eq!(back, evidence);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in TxStatus::PROGRESSION {
            assert_eq!(status.as_str().parse::<TxStatus>().unwrap(), status);
        }
        assert_eq!("das".parse::<DataLocation>().unwrap(), DataLocation::Das);
        assert!("bogus".parse::<BatchStatus>().is_err());
    }
}
