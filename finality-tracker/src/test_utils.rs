// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Fixtures shared by the tracker's unit tests.

use crate::chains::{ChainRegistry, RpcFactory};
use crate::store::{FinalityStore, IndexedTransaction, MemoryStore};
use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{Address, H256, U256};
use orbit_finality_core::chain::{ChainType, ContractAddresses};
use orbit_finality_core::rpc::events::encode_batch_submission;
use orbit_finality_core::rpc::{
    BatchDataLocation, BatchDeliveredEvent, ParentChainRpc, ResilientClientConfig, RetryPolicy,
};
use orbit_finality_core::test_utils::MockParentChain;
use orbit_finality_core::types::{
    Batch, BatchMetadata, BatchStatus, DataLocation, TimeBounds, TrackedTransaction,
};
use orbit_finality_core::{ChainConfig, FinalityMetrics, ManualClock};
use std::sync::Arc;
use std::time::Duration;

pub const PARENT_CHAIN_ID: u64 = 1;

/// Fixed instant every fixture timestamp is derived from.
pub fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn minutes(n: i64) -> chrono::Duration {
    chrono::Duration::minutes(n)
}

pub fn chain_config(chain_id: u64) -> ChainConfig {
    let addr = |n: u64| Address::from_low_u64_be((chain_id << 8) | n);
    ChainConfig {
        chain_id,
        name: format!("orbit-{}", chain_id),
        parent_chain_id: PARENT_CHAIN_ID,
        parent_rpc_url: "http://localhost:8545".into(),
        chain_type: ChainType::Rollup,
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
        confirm_period_blocks: 50,
        parent_block_time_secs: 12,
        finalization_window_secs: 7 * 24 * 60 * 60,
        deployment_block: 0,
    }
}

pub fn parent_tx_hash(chain_id: u64, sequence_number: u64) -> H256 {
    H256::from_low_u64_be((chain_id << 32) | (sequence_number + 1))
}

/// Pending batch #`sequence_number`, posted `sequence_number` minutes after the epoch.
pub fn batch(chain_id: u64, sequence_number: u64) -> Batch {
    Batch {
        chain_id,
        sequence_number,
        parent_block_number: 100 + sequence_number * 10,
        parent_tx_hash: parent_tx_hash(chain_id, sequence_number),
        parent_log_index: 0,
        before_acc: H256::repeat_byte(0x01),
        after_acc: H256::repeat_byte(0x02),
        delayed_acc: H256::repeat_byte(0x03),
        gas_used: Some(U256::from(250_000u64)),
        gas_price: Some(U256::from(30_000_000_000u64)),
        gas_cost: Some(U256::from(250_000u64) * U256::from(30_000_000_000u64)),
        posted_at: epoch() + minutes(sequence_number as i64),
        status: BatchStatus::Pending,
        confirmed_at: None,
        finalized_at: None,
        transaction_count: 3,
        batch_size_bytes: 128,
        data_hash: H256::repeat_byte(0x04),
        data_location: DataLocation::Onchain,
        metadata: BatchMetadata::default(),
    }
}

pub fn tracked_tx(id: u64, chain_id: u64, block_number: u64) -> TrackedTransaction {
    TrackedTransaction {
        id,
        hash: H256::from_low_u64_be(0xfeed_0000 + id),
        chain_id,
        block_number,
        timestamp: epoch(),
    }
}

/// Delivery event for batch `sequence_number` at parent block `block`.
pub fn delivered_event(chain_id: u64, sequence_number: u64, block: u64) -> BatchDeliveredEvent {
    BatchDeliveredEvent {
        sequence_number,
        before_acc: H256::repeat_byte(0x11),
        after_acc: H256::repeat_byte(0x12),
        delayed_acc: H256::repeat_byte(0x13),
        after_delayed_messages_read: sequence_number * 2,
        time_bounds: TimeBounds::default(),
        data_location: BatchDataLocation::TxInput,
        block_number: block,
        transaction_hash: parent_tx_hash(chain_id, sequence_number),
        log_index: 0,
    }
}

pub fn mock_factory(rpc: Arc<MockParentChain>) -> RpcFactory {
    Arc::new(move |_: &ChainConfig| Ok(rpc.clone() as Arc<dyn ParentChainRpc>))
}

/// Client settings that fail fast instead of sleeping between retries.
pub fn fast_client_config() -> ResilientClientConfig {
    ResilientClientConfig {
        max_requests_per_window: 1_000,
        rate_window: Duration::from_secs(1),
        failure_threshold: 5,
        reset_timeout: Duration::from_secs(60),
        success_threshold: 3,
        call_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
    }
}

/// One configured chain backed by a scripted parent chain and an in-memory store.
pub struct Harness {
    pub chain: ChainConfig,
    pub rpc: Arc<MockParentChain>,
    pub store: Arc<MemoryStore>,
    pub registry: Arc<ChainRegistry>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<FinalityMetrics>,
}

impl Harness {
    pub async fn new(chain_id: u64) -> Self {
        let chain = chain_config(chain_id);
        let rpc = Arc::new(MockParentChain::new());
        for (_, address) in chain.contracts.required() {
            rpc.deploy(address);
        }
        rpc.set_uint(chain.contracts.sequencer_inbox, "batchCount()", U256::zero());
        rpc.set_uint(chain.contracts.rollup, "latestConfirmed()", U256::zero());

        let store = Arc::new(MemoryStore::new());
        store.upsert_chain(&chain).await.unwrap();
        let metrics = Arc::new(FinalityMetrics::new_for_testing());
        let registry = Arc::new(ChainRegistry::new(
            store.clone(),
            mock_factory(rpc.clone()),
            fast_client_config(),
            Some(metrics.clone()),
        ));
        Self {
            chain,
            rpc,
            store,
            registry,
            clock: Arc::new(ManualClock::new(epoch())),
            metrics,
        }
    }

    pub fn set_batch_count(&self, count: u64) {
        self.rpc.set_uint(
            self.chain.contracts.sequencer_inbox,
            "batchCount()",
            U256::from(count),
        );
    }

    pub fn set_latest_confirmed(&self, sequence_number: u64) {
        self.rpc.set_uint(
            self.chain.contracts.rollup,
            "latestConfirmed()",
            U256::from(sequence_number),
        );
    }

    /// Puts batch `sequence_number` on the scripted parent chain at `block`.
    pub fn deliver_on_chain(&self, sequence_number: u64, block: u64, payload: &[u8]) {
        let event = delivered_event(self.chain.chain_id, sequence_number, block);
        self.rpc.add_batch_delivery(
            self.chain.contracts.sequencer_inbox,
            &event,
            payload,
            epoch() + minutes(sequence_number as i64),
        );
    }

    /// Records batch `sequence_number` in the local parent-chain index.
    pub fn deliver_indexed(&self, sequence_number: u64, block: u64, payload: &[u8]) {
        let event = delivered_event(self.chain.chain_id, sequence_number, block);
        self.store
            .index_parent_log(PARENT_CHAIN_ID, event.encode(self.chain.contracts.sequencer_inbox));
        self.store.index_parent_transaction(
            PARENT_CHAIN_ID,
            IndexedTransaction {
                hash: event.transaction_hash,
                block_number: block,
                block_timestamp: epoch() + minutes(sequence_number as i64),
                to: Some(self.chain.contracts.sequencer_inbox),
                input: encode_batch_submission(sequence_number, payload).into(),
                gas_used: Some(U256::from(200_000u64)),
                gas_price: Some(U256::from(20_000_000_000u64)),
                effective_gas_price: None,
            },
        );
    }

    pub async fn persist_batch(&self, batch: Batch) {
        self.store.insert_batch(&batch).await.unwrap();
    }
}
