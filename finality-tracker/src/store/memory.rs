// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::{
    log_matches, stamp_batch_status, summarize, FinalityStore, IndexedTransaction, ParentLogIndex,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Log, H256};
use orbit_finality_core::rpc::LogQuery;
use orbit_finality_core::types::{
    Batch, BatchStatistics, BatchStatus, InsertOutcome, TransactionState, TxStatus,
};
use orbit_finality_core::{ChainConfig, FinalityError, FinalityResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    chains: BTreeMap<u64, ChainConfig>,
    batches: BTreeMap<(u64, u64), Batch>,
    states: BTreeMap<u64, TransactionState>,
    parent_logs: Vec<(u64, Log)>,
    parent_transactions: HashMap<(u64, H256), IndexedTransaction>,
}

/// Process-local store used by tests and `--store memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a parent-chain log as the ingestion pipeline would.
    pub fn index_parent_log(&self, parent_chain_id: u64, log: Log) {
        let mut tables = self.lock();
        tables.parent_logs.push((parent_chain_id, log));
        tables.parent_logs.sort_by_key(|(_, log)| {
            (
                log.block_number.map(|b| b.as_u64()).unwrap_or_default(),
                log.log_index.map(|i| i.as_u64()).unwrap_or_default(),
            )
        });
    }

    pub fn index_parent_transaction(&self, parent_chain_id: u64, tx: IndexedTransaction) {
        self.lock()
            .parent_transactions
            .insert((parent_chain_id, tx.hash), tx);
    }

    pub fn batch_count(&self, chain_id: u64) -> usize {
        self.lock()
            .batches
            .range((chain_id, 0)..=(chain_id, u64::MAX))
            .count()
    }

    fn require_chain(tables: &Tables, chain_id: u64) -> FinalityResult<()> {
        if tables.chains.contains_key(&chain_id) {
            Ok(())
        } else {
            Err(FinalityError::Store(format!(
                "chain {} is not configured",
                chain_id
            )))
        }
    }
}

fn chain_batches(tables: &Tables, chain_id: u64) -> impl Iterator<Item = &Batch> {
    tables
        .batches
        .range((chain_id, 0)..=(chain_id, u64::MAX))
        .map(|(_, batch)| batch)
}

#[async_trait]
impl FinalityStore for MemoryStore {
    async fn upsert_chain(&self, chain: &ChainConfig) -> FinalityResult<()> {
        self.lock().chains.insert(chain.chain_id, chain.clone());
        Ok(())
    }

    async fn get_chain(&self, chain_id: u64) -> FinalityResult<Option<ChainConfig>> {
        Ok(self.lock().chains.get(&chain_id).cloned())
    }

    async fn list_chains(&self) -> FinalityResult<Vec<ChainConfig>> {
        Ok(self.lock().chains.values().cloned().collect())
    }

    async fn delete_chain(&self, chain_id: u64) -> FinalityResult<bool> {
        let mut tables = self.lock();
        let existed = tables.chains.remove(&chain_id).is_some();
        tables.batches.retain(|(chain, _), _| *chain != chain_id);
        tables.states.retain(|_, state| state.chain_id != chain_id);
        Ok(existed)
    }

    async fn insert_batch(&self, batch: &Batch) -> FinalityResult<InsertOutcome> {
        let mut tables = self.lock();
        Self::require_chain(&tables, batch.chain_id)?;
        let key = (batch.chain_id, batch.sequence_number);
        if tables.batches.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables.batches.insert(key, batch.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_batch(
        &self,
        chain_id: u64,
        sequence_number: u64,
    ) -> FinalityResult<Option<Batch>> {
        Ok(self.lock().batches.get(&(chain_id, sequence_number)).cloned())
    }

    async fn latest_batch(&self, chain_id: u64) -> FinalityResult<Option<Batch>> {
        Ok(chain_batches(&self.lock(), chain_id).last().cloned())
    }

    async fn find_sequence_gaps(&self, chain_id: u64, limit: usize) -> FinalityResult<Vec<u64>> {
        let tables = self.lock();
        let mut gaps = Vec::new();
        let mut expected = 0u64;
        for batch in chain_batches(&tables, chain_id) {
            while expected < batch.sequence_number && gaps.len() < limit {
                gaps.push(expected);
                expected += 1;
            }
            if gaps.len() >= limit {
                break;
            }
            expected = batch.sequence_number + 1;
        }
        Ok(gaps)
    }

    async fn batches_by_status(
        &self,
        chain_id: u64,
        statuses: &[BatchStatus],
        limit: usize,
    ) -> FinalityResult<Vec<Batch>> {
        Ok(chain_batches(&self.lock(), chain_id)
            .filter(|b| statuses.contains(&b.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn batches_posted_before(
        &self,
        chain_id: u64,
        status: BatchStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> FinalityResult<Vec<Batch>> {
        Ok(chain_batches(&self.lock(), chain_id)
            .filter(|b| b.status == status && b.posted_at < before)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_batch_covering_block(
        &self,
        chain_id: u64,
        block_number: u64,
    ) -> FinalityResult<Option<Batch>> {
        Ok(chain_batches(&self.lock(), chain_id)
            .find(|b| b.covers_child_block(block_number) == Some(true))
            .cloned())
    }

    async fn first_batch_posted_since(
        &self,
        chain_id: u64,
        at: DateTime<Utc>,
    ) -> FinalityResult<Option<Batch>> {
        Ok(chain_batches(&self.lock(), chain_id)
            .find(|b| b.posted_at >= at)
            .cloned())
    }

    async fn batch_by_parent_tx(&self, parent_tx_hash: H256) -> FinalityResult<Option<Batch>> {
        Ok(self
            .lock()
            .batches
            .values()
            .find(|b| b.parent_tx_hash == parent_tx_hash)
            .cloned())
    }

    async fn update_batch_status(
        &self,
        chain_id: u64,
        sequence_number: u64,
        expected: BatchStatus,
        next: BatchStatus,
        at: DateTime<Utc>,
    ) -> FinalityResult<bool> {
        let mut tables = self.lock();
        match tables.batches.get_mut(&(chain_id, sequence_number)) {
            Some(batch) if batch.status == expected => {
                stamp_batch_status(batch, next, at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn batch_statistics(&self, chain_id: u64) -> FinalityResult<BatchStatistics> {
        Ok(summarize(chain_id, chain_batches(&self.lock(), chain_id)))
    }

    async fn get_transaction_state(
        &self,
        transaction_id: u64,
    ) -> FinalityResult<Option<TransactionState>> {
        Ok(self.lock().states.get(&transaction_id).cloned())
    }

    async fn transaction_state_by_hash(
        &self,
        tx_hash: H256,
    ) -> FinalityResult<Option<TransactionState>> {
        Ok(self
            .lock()
            .states
            .values()
            .find(|s| s.tx_hash == tx_hash)
            .cloned())
    }

    async fn create_transaction_state(
        &self,
        state: &TransactionState,
    ) -> FinalityResult<TransactionState> {
        let mut tables = self.lock();
        Self::require_chain(&tables, state.chain_id)?;
        Ok(tables
            .states
            .entry(state.transaction_id)
            .or_insert_with(|| state.clone())
            .clone())
    }

    async fn save_transaction_state(
        &self,
        state: &TransactionState,
        expected: TxStatus,
    ) -> FinalityResult<bool> {
        let mut tables = self.lock();
        match tables.states.get_mut(&state.transaction_id) {
            Some(stored) if stored.status == expected => {
                *stored = state.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transaction_states_for_batch(
        &self,
        chain_id: u64,
        sequence_number: u64,
        status: TxStatus,
    ) -> FinalityResult<Vec<TransactionState>> {
        Ok(self
            .lock()
            .states
            .values()
            .filter(|s| {
                s.chain_id == chain_id
                    && s.batch_sequence_number == Some(sequence_number)
                    && s.status == status
            })
            .cloned()
            .collect())
    }

    async fn active_transaction_states(
        &self,
        chain_id: u64,
        limit: usize,
    ) -> FinalityResult<Vec<TransactionState>> {
        let mut active: Vec<_> = self
            .lock()
            .states
            .values()
            .filter(|s| s.chain_id == chain_id && !s.status.is_terminal())
            .cloned()
            .collect();
        active.sort_by_key(|s| s.updated_at);
        active.truncate(limit);
        Ok(active)
    }
}

#[async_trait]
impl ParentLogIndex for MemoryStore {
    async fn is_indexed(&self, parent_chain_id: u64) -> FinalityResult<bool> {
        Ok(self
            .lock()
            .parent_logs
            .iter()
            .any(|(chain, _)| *chain == parent_chain_id))
    }

    async fn event_logs(
        &self,
        parent_chain_id: u64,
        query: &LogQuery,
        limit: usize,
    ) -> FinalityResult<Vec<Log>> {
        Ok(self
            .lock()
            .parent_logs
            .iter()
            .filter(|(chain, log)| *chain == parent_chain_id && log_matches(log, query))
            .take(limit)
            .map(|(_, log)| log.clone())
            .collect())
    }

    async fn transaction(
        &self,
        parent_chain_id: u64,
        hash: H256,
    ) -> FinalityResult<Option<IndexedTransaction>> {
        Ok(self
            .lock()
            .parent_transactions
            .get(&(parent_chain_id, hash))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{batch, chain_config, tracked_tx};

    #[tokio::test]
    async fn duplicate_batch_insert_is_reported() {
        let store = MemoryStore::new();
        store.upsert_chain(&chain_config(1001)).await.unwrap();
        let b = batch(1001, 3);
        assert_eq!(store.insert_batch(&b).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert_batch(&b).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(store.batch_count(1001), 1);
    }

    #[tokio::test]
    async fn batch_for_unknown_chain_is_rejected() {
        let store = MemoryStore::new();
        let err = store.insert_batch(&batch(7, 0)).await.unwrap_err();
        assert!(matches!(err, FinalityError::Store(_)));
    }

    #[tokio::test]
    async fn gaps_are_listed_in_order() {
        let store = MemoryStore::new();
        store.upsert_chain(&chain_config(1001)).await.unwrap();
        for seq in [0, 1, 4, 6] {
            store.insert_batch(&batch(1001, seq)).await.unwrap();
        }
        assert_eq!(store.find_sequence_gaps(1001, 10).await.unwrap(), vec![2, 3, 5]);
        assert_eq!(store.find_sequence_gaps(1001, 2).await.unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn status_update_is_conditional() {
        let store = MemoryStore::new();
        store.upsert_chain(&chain_config(1001)).await.unwrap();
        store.insert_batch(&batch(1001, 0)).await.unwrap();
        let now = Utc::now();
        assert!(store
            .update_batch_status(1001, 0, BatchStatus::Pending, BatchStatus::Confirmed, now)
            .await
            .unwrap());
        assert!(!store
            .update_batch_status(1001, 0, BatchStatus::Pending, BatchStatus::Confirmed, now)
            .await
            .unwrap());
        let stored = store.get_batch(1001, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Confirmed);
        assert_eq!(stored.confirmed_at, Some(now));
    }

    #[tokio::test]
    async fn deleting_a_chain_cascades() {
        let store = MemoryStore::new();
        store.upsert_chain(&chain_config(1001)).await.unwrap();
        store.upsert_chain(&chain_config(1002)).await.unwrap();
        store.insert_batch(&batch(1001, 0)).await.unwrap();
        store.insert_batch(&batch(1002, 0)).await.unwrap();
        store
            .create_transaction_state(&TransactionState::submitted(&tracked_tx(1, 1001, 10)))
            .await
            .unwrap();

        assert!(store.delete_chain(1001).await.unwrap());
        assert_eq!(store.batch_count(1001), 0);
        assert_eq!(store.batch_count(1002), 1);
        assert!(store.get_transaction_state(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transaction_state_save_requires_expected_status() {
        let store = MemoryStore::new();
        store.upsert_chain(&chain_config(1001)).await.unwrap();
        let initial = TransactionState::submitted(&tracked_tx(5, 1001, 10));
        store.create_transaction_state(&initial).await.unwrap();

        let mut failed = initial.clone();
        failed.fail("boom", Utc::now()).unwrap();
        assert!(store
            .save_transaction_state(&failed, TxStatus::Submitted)
            .await
            .unwrap());
        // a second writer still holding the SUBMITTED snapshot loses
        assert!(!store
            .save_transaction_state(&initial, TxStatus::Submitted)
            .await
            .unwrap());
        let stored = store.get_transaction_state(5).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Failed);
    }
}
