// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Row types for the finality tables. Hashes and addresses are raw bytes,
//! 256-bit quantities are decimal strings.

use crate::schema::{
    batches, chain_configs, child_chain_transactions, parent_chain_logs,
    parent_chain_transactions, transaction_states,
};
use chrono::{DateTime, Utc};
use diesel::{AsChangeset, Insertable, Queryable, Selectable};
use serde_json::Value;

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = chain_configs, check_for_backend(diesel::pg::Pg))]
pub struct ChainConfigRow {
    pub chain_id: i64,
    pub name: String,
    pub parent_chain_id: i64,
    pub parent_rpc_url: String,
    pub chain_type: String,
    pub contracts: Value,
    pub confirm_period_blocks: i64,
    pub parent_block_time_secs: i64,
    pub finalization_window_secs: i64,
    pub deployment_block: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = batches, check_for_backend(diesel::pg::Pg))]
pub struct BatchRow {
    pub chain_id: i64,
    pub sequence_number: i64,
    pub parent_block_number: i64,
    pub parent_tx_hash: Vec<u8>,
    pub parent_log_index: i64,
    pub before_acc: Vec<u8>,
    pub after_acc: Vec<u8>,
    pub delayed_acc: Vec<u8>,
    pub gas_used: Option<String>,
    pub gas_price: Option<String>,
    pub gas_cost: Option<String>,
    pub posted_at: DateTime<Utc>,
    pub status: String,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub transaction_count: i64,
    pub batch_size_bytes: i64,
    pub data_hash: Vec<u8>,
    pub data_location: String,
    pub metadata: Value,
}

/// Confirmation-status update applied by the monitor.
#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = batches)]
pub struct BatchStatusChange {
    pub status: String,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug, Clone, PartialEq)]
#[diesel(
    table_name = transaction_states,
    primary_key(transaction_id),
    check_for_backend(diesel::pg::Pg),
    treat_none_as_null = true
)]
pub struct TransactionStateRow {
    pub transaction_id: i64,
    pub tx_hash: Vec<u8>,
    pub chain_id: i64,
    pub block_number: i64,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
    pub sequenced_at: Option<DateTime<Utc>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub batch_sequence_number: Option<i64>,
    pub state_data: Value,
    pub failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = parent_chain_logs, check_for_backend(diesel::pg::Pg))]
pub struct ParentChainLogRow {
    pub parent_chain_id: i64,
    pub block_number: i64,
    pub log_index: i64,
    pub tx_hash: Vec<u8>,
    pub address: Vec<u8>,
    pub topic0: Option<Vec<u8>>,
    pub topic1: Option<Vec<u8>>,
    pub topic2: Option<Vec<u8>>,
    pub topic3: Option<Vec<u8>>,
    pub data: Vec<u8>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = parent_chain_transactions, check_for_backend(diesel::pg::Pg))]
pub struct ParentChainTransactionRow {
    pub parent_chain_id: i64,
    pub hash: Vec<u8>,
    pub block_number: i64,
    pub block_timestamp: DateTime<Utc>,
    pub to_address: Option<Vec<u8>>,
    pub input: Vec<u8>,
    pub gas_used: Option<String>,
    pub gas_price: Option<String>,
    pub effective_gas_price: Option<String>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = child_chain_transactions, check_for_backend(diesel::pg::Pg))]
pub struct ChildChainTransactionRow {
    pub id: i64,
    pub chain_id: i64,
    pub hash: Vec<u8>,
    pub block_number: i64,
    pub block_timestamp: DateTime<Utc>,
}
