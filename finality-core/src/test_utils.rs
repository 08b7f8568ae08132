// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Scripted parent chain for tests.

use crate::error::{FinalityError, FinalityResult};
use crate::rpc::events::{encode_batch_submission, BatchDeliveredEvent};
use crate::rpc::provider::{LogQuery, ParentChainRpc};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, Log, Transaction, TransactionReceipt, H256, U256};
use ethers::utils::keccak256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
struct MockState {
    chain_id: u64,
    block_number: u64,
    code: HashMap<Address, Bytes>,
    call_results: HashMap<(Address, [u8; 4]), Bytes>,
    call_failure: Option<String>,
    logs: Vec<Log>,
    max_log_range: Option<u64>,
    log_failure: Option<String>,
    log_queries: Vec<LogQuery>,
    block_timestamps: HashMap<u64, DateTime<Utc>>,
    transactions: HashMap<H256, Transaction>,
    receipts: HashMap<H256, TransactionReceipt>,
}

#[derive(Debug, Default)]
pub struct MockParentChain {
    state: Mutex<MockState>,
    calls: AtomicUsize,
}

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

impl MockParentChain {
    pub fn new() -> Self {
        let mock = Self::default();
        mock.lock().chain_id = 1;
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_block_number(&self, number: u64) {
        self.lock().block_number = number;
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) {
        self.lock().code.insert(address, code.into());
    }

    /// Gives `address` non-empty bytecode.
    pub fn deploy(&self, address: Address) {
        self.set_code(address, vec![0x60, 0x80, 0x60, 0x40, 0x52]);
    }

    pub fn set_uint(&self, address: Address, signature: &str, value: U256) {
        let encoded = ethers::abi::encode(&[Token::Uint(value)]);
        self.lock()
            .call_results
            .insert((address, selector(signature)), encoded.into());
    }

    pub fn set_address(&self, address: Address, signature: &str, value: Address) {
        let encoded = ethers::abi::encode(&[Token::Address(value)]);
        self.lock()
            .call_results
            .insert((address, selector(signature)), encoded.into());
    }

    /// Makes every `call` fail with `message` until cleared with `None`.
    pub fn fail_calls_with(&self, message: Option<&str>) {
        self.lock().call_failure = message.map(str::to_string);
    }

    pub fn fail_logs_with(&self, message: Option<&str>) {
        self.lock().log_failure = message.map(str::to_string);
    }

    /// Rejects `get_logs` spanning more than `blocks` blocks.
    pub fn set_max_log_range(&self, blocks: Option<u64>) {
        self.lock().max_log_range = blocks;
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.lock().log_queries.clone()
    }

    pub fn push_log(&self, log: Log) {
        self.lock().logs.push(log);
    }

    pub fn set_block_timestamp(&self, block: u64, at: DateTime<Utc>) {
        self.lock().block_timestamps.insert(block, at);
    }

    pub fn add_transaction(&self, tx: Transaction) {
        self.lock().transactions.insert(tx.hash, tx);
    }

    pub fn add_receipt(&self, receipt: TransactionReceipt) {
        self.lock()
            .receipts
            .insert(receipt.transaction_hash, receipt);
    }

    /// Emits a full batch delivery: the event log, its submission
    /// transaction carrying `payload`, the receipt and the block timestamp.
    pub fn add_batch_delivery(
        &self,
        inbox: Address,
        event: &BatchDeliveredEvent,
        payload: &[u8],
        posted_at: DateTime<Utc>,
    ) {
        self.push_log(event.encode(inbox));
        self.add_transaction(Transaction {
            hash: event.transaction_hash,
            to: Some(inbox),
            block_number: Some(event.block_number.into()),
            input: encode_batch_submission(event.sequence_number, payload).into(),
            gas_price: Some(U256::from(30_000_000_000u64)),
            ..Default::default()
        });
        self.add_receipt(TransactionReceipt {
            transaction_hash: event.transaction_hash,
            block_number: Some(event.block_number.into()),
            gas_used: Some(U256::from(250_000u64)),
            effective_gas_price: Some(U256::from(30_000_000_000u64)),
            ..Default::default()
        });
        self.set_block_timestamp(event.block_number, posted_at);
        let mut state = self.lock();
        state.block_number = state.block_number.max(event.block_number);
    }
}

#[async_trait]
impl ParentChainRpc for MockParentChain {
    async fn chain_id(&self) -> FinalityResult<u64> {
        Ok(self.lock().chain_id)
    }

    async fn block_number(&self) -> FinalityResult<u64> {
        Ok(self.lock().block_number)
    }

    async fn get_code(&self, address: Address) -> FinalityResult<Bytes> {
        Ok(self.lock().code.get(&address).cloned().unwrap_or_default())
    }

    async fn call(&self, to: Address, data: Bytes) -> FinalityResult<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.lock();
        if let Some(message) = &state.call_failure {
            return Err(FinalityError::classify_rpc(message.clone()));
        }
        let key: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| FinalityError::Rpc("calldata shorter than a selector".into()))?;
        state
            .call_results
            .get(&(to, key))
            .cloned()
            .ok_or_else(|| FinalityError::Rpc("execution reverted".into()))
    }

    async fn get_logs(&self, query: &LogQuery) -> FinalityResult<Vec<Log>> {
        let mut state = self.lock();
        state.log_queries.push(query.clone());
        if let Some(message) = &state.log_failure {
            return Err(FinalityError::classify_rpc(message.clone()));
        }
        if let Some(max) = state.max_log_range {
            if query.to_block.saturating_sub(query.from_block) + 1 > max {
                return Err(FinalityError::classify_rpc(format!(
                    "block range is too large, max {}",
                    max
                )));
            }
        }
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.map(|b| b.as_u64()).unwrap_or_default();
                log.address == query.address
                    && log.topics.first() == Some(&query.topic0)
                    && query
                        .topic1
                        .map_or(true, |t| log.topics.get(1) == Some(&t))
                    && (query.from_block..=query.to_block).contains(&block)
            })
            .cloned()
            .collect())
    }

    async fn get_block_timestamp(&self, block: u64) -> FinalityResult<Option<DateTime<Utc>>> {
        Ok(self.lock().block_timestamps.get(&block).copied())
    }

    async fn get_transaction(&self, hash: H256) -> FinalityResult<Option<Transaction>> {
        Ok(self.lock().transactions.get(&hash).cloned())
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> FinalityResult<Option<TransactionReceipt>> {
        Ok(self.lock().receipts.get(&hash).cloned())
    }
}
