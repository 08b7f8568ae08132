// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read-side views served to the external API layer.

use crate::store::FinalityStore;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use orbit_finality_core::types::{
    Batch, BatchStatistics, BatchStatus, BlockRange, DataLocation, StateEvidence,
    TransactionState, TxStatus,
};
use orbit_finality_core::{FinalityError, FinalityResult};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTimestamps {
    pub submitted_at: DateTime<Utc>,
    pub sequenced_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchView {
    pub chain_id: u64,
    pub sequence_number: u64,
    pub status: BatchStatus,
    pub parent_block_number: u64,
    pub parent_tx_hash: H256,
    pub posted_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub transaction_count: u64,
    pub batch_size_bytes: u64,
    pub data_location: DataLocation,
    /// Wei, decimal
    pub gas_cost: Option<String>,
    pub child_blocks: Option<BlockRange>,
}

impl From<Batch> for BatchView {
    fn from(batch: Batch) -> Self {
        Self {
            chain_id: batch.chain_id,
            sequence_number: batch.sequence_number,
            status: batch.status,
            parent_block_number: batch.parent_block_number,
            parent_tx_hash: batch.parent_tx_hash,
            posted_at: batch.posted_at,
            confirmed_at: batch.confirmed_at,
            finalized_at: batch.finalized_at,
            transaction_count: batch.transaction_count,
            batch_size_bytes: batch.batch_size_bytes,
            data_location: batch.data_location,
            gas_cost: batch.gas_cost.map(|cost| cost.to_string()),
            child_blocks: batch.metadata.child_blocks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrbitStateView {
    pub transaction_id: u64,
    pub tx_hash: H256,
    pub chain_id: u64,
    pub status: TxStatus,
    pub progress_percent: u8,
    pub failure_reason: Option<String>,
    pub timestamps: StateTimestamps,
    pub batch: Option<BatchView>,
    pub evidence: Vec<StateEvidence>,
}

#[derive(Clone)]
pub struct FinalityQueryService {
    store: Arc<dyn FinalityStore>,
}

impl FinalityQueryService {
    pub fn new(store: Arc<dyn FinalityStore>) -> Self {
        Self { store }
    }

    pub async fn get_orbit_state(&self, transaction_id: u64) -> FinalityResult<Option<OrbitStateView>> {
        let Some(state) = self.store.get_transaction_state(transaction_id).await? else {
            return Ok(None);
        };
        let batch = self.batch_for(&state).await?;
        Ok(Some(OrbitStateView {
            transaction_id: state.transaction_id,
            tx_hash: state.tx_hash,
            chain_id: state.chain_id,
            status: state.status,
            progress_percent: state.status.progress_percent(),
            failure_reason: state.failure_reason,
            timestamps: StateTimestamps {
                submitted_at: state.submitted_at,
                sequenced_at: state.sequenced_at,
                posted_at: state.posted_at,
                confirmed_at: state.confirmed_at,
                finalized_at: state.finalized_at,
                failed_at: state.failed_at,
            },
            batch: batch.map(BatchView::from),
            evidence: state.state_data,
        }))
    }

    /// Batch for a child transaction hash, or for a parent-chain batch
    /// submission hash.
    pub async fn get_batch_by_tx_hash(&self, hash: H256) -> FinalityResult<Option<BatchView>> {
        if let Some(state) = self.store.transaction_state_by_hash(hash).await? {
            if let Some(batch) = self.batch_for(&state).await? {
                return Ok(Some(batch.into()));
            }
        }
        Ok(self
            .store
            .batch_by_parent_tx(hash)
            .await?
            .map(BatchView::from))
    }

    pub async fn get_batch_statistics(&self, chain_id: u64) -> FinalityResult<BatchStatistics> {
        if self.store.get_chain(chain_id).await?.is_none() {
            return Err(FinalityError::Configuration(format!(
                "chain {} is not configured",
                chain_id
            )));
        }
        self.store.batch_statistics(chain_id).await
    }

    async fn batch_for(&self, state: &TransactionState) -> FinalityResult<Option<Batch>> {
        match state.batch_sequence_number {
            Some(sequence_number) => self.store.get_batch(state.chain_id, sequence_number).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{batch, parent_tx_hash, tracked_tx, Harness};
    use orbit_finality_core::types::MatchMethod;
    use orbit_finality_core::Clock;

    async fn sequenced(h: &Harness, id: u64, sequence_number: u64) -> TransactionState {
        let mut state = TransactionState::submitted(&tracked_tx(id, 1001, 10));
        h.store.create_transaction_state(&state).await.unwrap();
        state
            .advance(
                StateEvidence::Sequenced {
                    batch_sequence_number: sequence_number,
                    parent_tx_hash: parent_tx_hash(1001, sequence_number),
                    parent_block_number: 100,
                    matched_by: MatchMethod::BlockRange,
                },
                h.clock.now(),
            )
            .unwrap();
        h.store
            .save_transaction_state(&state, TxStatus::Submitted)
            .await
            .unwrap();
        state
    }

    #[tokio::test]
    async fn orbit_state_includes_progress_and_batch() {
        let h = Harness::new(1001).await;
        h.persist_batch(batch(1001, 4)).await;
        sequenced(&h, 1, 4).await;
        let service = FinalityQueryService::new(h.store.clone());

        let view = service.get_orbit_state(1).await.unwrap().unwrap();
        assert_eq!(view.status, TxStatus::Sequenced);
        assert_eq!(view.progress_percent, 25);
        assert_eq!(view.batch.as_ref().map(|b| b.sequence_number), Some(4));
        assert_eq!(view.evidence.len(), 2);
        assert!(view.timestamps.sequenced_at.is_some());

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["status"], "SEQUENCED");
        assert_eq!(json["progressPercent"], 25);
        assert_eq!(json["batch"]["gasCost"], "7500000000000000");

        assert!(service.get_orbit_state(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn batch_lookup_by_child_or_parent_hash() {
        let h = Harness::new(1001).await;
        h.persist_batch(batch(1001, 1)).await;
        h.persist_batch(batch(1001, 2)).await;
        let state = sequenced(&h, 1, 2).await;
        let service = FinalityQueryService::new(h.store.clone());

        let by_child = service.get_batch_by_tx_hash(state.tx_hash).await.unwrap();
        assert_eq!(by_child.map(|b| b.sequence_number), Some(2));

        let by_parent = service
            .get_batch_by_tx_hash(parent_tx_hash(1001, 1))
            .await
            .unwrap();
        assert_eq!(by_parent.map(|b| b.sequence_number), Some(1));

        assert!(service
            .get_batch_by_tx_hash(H256::repeat_byte(0xaa))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn statistics_require_a_configured_chain() {
        let h = Harness::new(1001).await;
        h.persist_batch(batch(1001, 0)).await;
        h.persist_batch(batch(1001, 1)).await;
        let service = FinalityQueryService::new(h.store.clone());

        let stats = service.get_batch_statistics(1001).await.unwrap();
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.latest_sequence_number, Some(1));
        assert!((stats.average_transactions_per_batch - 3.0).abs() < f64::EPSILON);

        let err = service.get_batch_statistics(7).await.unwrap_err();
        assert!(matches!(err, FinalityError::Configuration(_)));
    }
}
