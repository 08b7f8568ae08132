// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Persistence seams for batches, transaction states and the locally indexed
//! parent-chain ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, Log, H256, U256};
use orbit_finality_core::rpc::LogQuery;
use orbit_finality_core::types::{
    Batch, BatchStatistics, BatchStatus, InsertOutcome, TransactionState, TxStatus,
};
use orbit_finality_core::{ChainConfig, FinalityResult};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgFinalityStore;

/// Shared mutable state of the engine.
///
/// Batch writes are unique on (chain, sequence number); transaction state
/// writes are conditional on the status the writer last read.
#[async_trait]
pub trait FinalityStore: Send + Sync + 'static {
    async fn upsert_chain(&self, chain: &ChainConfig) -> FinalityResult<()>;

    async fn get_chain(&self, chain_id: u64) -> FinalityResult<Option<ChainConfig>>;

    async fn list_chains(&self) -> FinalityResult<Vec<ChainConfig>>;

    /// Removes the chain together with its batches and transaction states.
    async fn delete_chain(&self, chain_id: u64) -> FinalityResult<bool>;

    async fn insert_batch(&self, batch: &Batch) -> FinalityResult<InsertOutcome>;

    async fn get_batch(&self, chain_id: u64, sequence_number: u64)
        -> FinalityResult<Option<Batch>>;

    async fn latest_batch(&self, chain_id: u64) -> FinalityResult<Option<Batch>>;

    /// Sequence numbers missing below the latest persisted batch, ascending.
    async fn find_sequence_gaps(&self, chain_id: u64, limit: usize) -> FinalityResult<Vec<u64>>;

    /// Batches in any of `statuses`, ascending by sequence number.
    async fn batches_by_status(
        &self,
        chain_id: u64,
        statuses: &[BatchStatus],
        limit: usize,
    ) -> FinalityResult<Vec<Batch>>;

    /// Batches in `status` posted strictly before `before`, ascending by
    /// sequence number.
    async fn batches_posted_before(
        &self,
        chain_id: u64,
        status: BatchStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> FinalityResult<Vec<Batch>>;

    async fn find_batch_covering_block(
        &self,
        chain_id: u64,
        block_number: u64,
    ) -> FinalityResult<Option<Batch>>;

    /// Lowest-sequenced batch posted at or after `at`.
    async fn first_batch_posted_since(
        &self,
        chain_id: u64,
        at: DateTime<Utc>,
    ) -> FinalityResult<Option<Batch>>;

    async fn batch_by_parent_tx(&self, parent_tx_hash: H256) -> FinalityResult<Option<Batch>>;

    /// Moves a batch from `expected` to `next`, stamping the matching
    /// timestamp. Returns false when the batch was not in `expected`.
    async fn update_batch_status(
        &self,
        chain_id: u64,
        sequence_number: u64,
        expected: BatchStatus,
        next: BatchStatus,
        at: DateTime<Utc>,
    ) -> FinalityResult<bool>;

    async fn batch_statistics(&self, chain_id: u64) -> FinalityResult<BatchStatistics>;

    async fn get_transaction_state(
        &self,
        transaction_id: u64,
    ) -> FinalityResult<Option<TransactionState>>;

    async fn transaction_state_by_hash(
        &self,
        tx_hash: H256,
    ) -> FinalityResult<Option<TransactionState>>;

    /// Inserts `state` unless one already exists; returns the stored row.
    async fn create_transaction_state(
        &self,
        state: &TransactionState,
    ) -> FinalityResult<TransactionState>;

    /// Overwrites the stored state only if its status is still `expected`.
    async fn save_transaction_state(
        &self,
        state: &TransactionState,
        expected: TxStatus,
    ) -> FinalityResult<bool>;

    async fn transaction_states_for_batch(
        &self,
        chain_id: u64,
        sequence_number: u64,
        status: TxStatus,
    ) -> FinalityResult<Vec<TransactionState>>;

    /// Non-terminal states, oldest update first.
    async fn active_transaction_states(
        &self,
        chain_id: u64,
        limit: usize,
    ) -> FinalityResult<Vec<TransactionState>>;
}

/// Parent-chain transaction as recorded by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTransaction {
    pub hash: H256,
    pub block_number: u64,
    pub block_timestamp: DateTime<Utc>,
    pub to: Option<Address>,
    pub input: Bytes,
    pub gas_used: Option<U256>,
    pub gas_price: Option<U256>,
    pub effective_gas_price: Option<U256>,
}

/// Locally indexed parent-chain ledger, read by discovery's preferred path.
#[async_trait]
pub trait ParentLogIndex: Send + Sync + 'static {
    /// Whether any logs for this parent chain have been ingested.
    async fn is_indexed(&self, parent_chain_id: u64) -> FinalityResult<bool>;

    /// Matching logs ordered by (block, log index).
    async fn event_logs(
        &self,
        parent_chain_id: u64,
        query: &LogQuery,
        limit: usize,
    ) -> FinalityResult<Vec<Log>>;

    async fn transaction(
        &self,
        parent_chain_id: u64,
        hash: H256,
    ) -> FinalityResult<Option<IndexedTransaction>>;
}

/// Aggregates a chain's batches into statistics.
pub(crate) fn summarize<'a>(
    chain_id: u64,
    batches: impl IntoIterator<Item = &'a Batch>,
) -> BatchStatistics {
    let mut stats = BatchStatistics {
        chain_id,
        ..Default::default()
    };
    for batch in batches {
        stats.total_batches += 1;
        match batch.status {
            BatchStatus::Pending => stats.pending += 1,
            BatchStatus::Confirmed => stats.confirmed += 1,
            BatchStatus::Finalized => stats.finalized += 1,
        }
        stats.total_transactions += batch.transaction_count;
        stats.latest_sequence_number = stats.latest_sequence_number.max(Some(batch.sequence_number));
        stats.last_posted_at = stats.last_posted_at.max(Some(batch.posted_at));
    }
    if stats.total_batches > 0 {
        stats.average_transactions_per_batch =
            stats.total_transactions as f64 / stats.total_batches as f64;
    }
    stats
}

/// Timestamp column touched by a batch status change.
pub(crate) fn stamp_batch_status(batch: &mut Batch, next: BatchStatus, at: DateTime<Utc>) {
    match next {
        BatchStatus::Pending => {}
        BatchStatus::Confirmed => {
            batch.confirmed_at.get_or_insert(at);
        }
        BatchStatus::Finalized => {
            batch.confirmed_at.get_or_insert(at);
            batch.finalized_at.get_or_insert(at);
        }
    }
    batch.status = next;
}

/// Whether `log` satisfies `query` (address, topics and block window).
pub(crate) fn log_matches(log: &Log, query: &LogQuery) -> bool {
    let block = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
    log.address == query.address
        && log.topics.first() == Some(&query.topic0)
        && query
            .topic1
            .map_or(true, |t| log.topics.get(1) == Some(&t))
        && (query.from_block..=query.to_block).contains(&block)
}
