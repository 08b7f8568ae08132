// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resolution of tracked child-chain transactions from the upstream ledger.

use crate::store::postgres::{h256, store_err, to_i64, to_u64};
use async_trait::async_trait;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::RunQueryDsl;
use orbit_finality_core::types::TrackedTransaction;
use orbit_finality_core::FinalityResult;
use orbit_finality_pg_db::Db;
use orbit_finality_schema::models::ChildChainTransactionRow;
use orbit_finality_schema::schema::child_chain_transactions;
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait TransactionLookup: Send + Sync + 'static {
    async fn transaction(&self, transaction_id: u64) -> FinalityResult<Option<TrackedTransaction>>;
}

#[derive(Debug, Default)]
pub struct MemoryTransactionLookup {
    transactions: Mutex<HashMap<u64, TrackedTransaction>>,
}

impl MemoryTransactionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tx: TrackedTransaction) {
        self.transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tx.id, tx);
    }
}

#[async_trait]
impl TransactionLookup for MemoryTransactionLookup {
    async fn transaction(&self, transaction_id: u64) -> FinalityResult<Option<TrackedTransaction>> {
        Ok(self
            .transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&transaction_id)
            .cloned())
    }
}

/// Reads the child-chain ledger table maintained by the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct PgTransactionLookup {
    db: Db,
}

impl PgTransactionLookup {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TransactionLookup for PgTransactionLookup {
    async fn transaction(&self, transaction_id: u64) -> FinalityResult<Option<TrackedTransaction>> {
        use child_chain_transactions::dsl;
        let mut conn = self.db.connect().await.map_err(store_err)?;
        let row = dsl::child_chain_transactions
            .filter(dsl::id.eq(to_i64(transaction_id)))
            .select(ChildChainTransactionRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?;
        row.map(|row| {
            Ok(TrackedTransaction {
                id: to_u64(row.id),
                hash: h256(&row.hash)?,
                chain_id: to_u64(row.chain_id),
                block_number: to_u64(row.block_number),
                timestamp: row.block_timestamp,
            })
        })
        .transpose()
    }
}
