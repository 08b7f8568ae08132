// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! `FinalityStore` and `ParentLogIndex` on Postgres.

use super::{stamp_batch_status, FinalityStore, IndexedTransaction, ParentLogIndex};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::{exists, sql};
use diesel::sql_types::{BigInt, Bool, Nullable, Timestamptz};
use diesel::upsert::excluded;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, QueryableByName, SelectableHelper};
use diesel_async::RunQueryDsl;
use ethers::types::{Address, Bytes, Log, H256, U256, U64};
use orbit_finality_core::rpc::LogQuery;
use orbit_finality_core::types::{
    Batch, BatchMetadata, BatchStatistics, BatchStatus, InsertOutcome, TransactionState, TxStatus,
};
use orbit_finality_core::{ChainConfig, FinalityError, FinalityResult};
use orbit_finality_pg_db::{Connection, Db};
use orbit_finality_schema::models::{
    BatchRow, BatchStatusChange, ChainConfigRow, ParentChainLogRow, ParentChainTransactionRow,
    TransactionStateRow,
};
use orbit_finality_schema::schema::{
    batches, chain_configs, parent_chain_logs, parent_chain_transactions, transaction_states,
};
use std::fmt::Display;

#[derive(Clone, Debug)]
pub struct PgFinalityStore {
    db: Db,
}

impl PgFinalityStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn conn(&self) -> FinalityResult<Connection<'_>> {
        self.db.connect().await.map_err(store_err)
    }
}

pub(crate) fn store_err(e: impl Display) -> FinalityError {
    FinalityError::Store(e.to_string())
}

pub(crate) fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn h256(bytes: &[u8]) -> FinalityResult<H256> {
    if bytes.len() != 32 {
        return Err(FinalityError::Decode(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    Ok(H256::from_slice(bytes))
}

fn address(bytes: &[u8]) -> FinalityResult<Address> {
    if bytes.len() != 20 {
        return Err(FinalityError::Decode(format!(
            "expected 20-byte address, got {} bytes",
            bytes.len()
        )));
    }
    Ok(Address::from_slice(bytes))
}

fn u256(value: Option<&str>) -> FinalityResult<Option<U256>> {
    value
        .map(|v| U256::from_dec_str(v).map_err(|e| FinalityError::Decode(format!("{v}: {e}"))))
        .transpose()
}

fn chain_to_row(chain: &ChainConfig, now: DateTime<Utc>) -> FinalityResult<ChainConfigRow> {
    Ok(ChainConfigRow {
        chain_id: to_i64(chain.chain_id),
        name: chain.name.clone(),
        parent_chain_id: to_i64(chain.parent_chain_id),
        parent_rpc_url: chain.parent_rpc_url.clone(),
        chain_type: chain.chain_type.to_string(),
        contracts: serde_json::to_value(&chain.contracts).map_err(store_err)?,
        confirm_period_blocks: to_i64(chain.confirm_period_blocks),
        parent_block_time_secs: to_i64(chain.parent_block_time_secs),
        finalization_window_secs: to_i64(chain.finalization_window_secs),
        deployment_block: to_i64(chain.deployment_block),
        created_at: now,
        updated_at: now,
    })
}

fn chain_from_row(row: ChainConfigRow) -> FinalityResult<ChainConfig> {
    Ok(ChainConfig {
        chain_id: to_u64(row.chain_id),
        name: row.name,
        parent_chain_id: to_u64(row.parent_chain_id),
        parent_rpc_url: row.parent_rpc_url,
        chain_type: row.chain_type.parse()?,
        contracts: serde_json::from_value(row.contracts)
            .map_err(|e| FinalityError::Decode(format!("contracts: {e}")))?,
        confirm_period_blocks: to_u64(row.confirm_period_blocks),
        parent_block_time_secs: to_u64(row.parent_block_time_secs),
        finalization_window_secs: to_u64(row.finalization_window_secs),
        deployment_block: to_u64(row.deployment_block),
    })
}

fn batch_to_row(batch: &Batch) -> FinalityResult<BatchRow> {
    Ok(BatchRow {
        chain_id: to_i64(batch.chain_id),
        sequence_number: to_i64(batch.sequence_number),
        parent_block_number: to_i64(batch.parent_block_number),
        parent_tx_hash: batch.parent_tx_hash.as_bytes().to_vec(),
        parent_log_index: to_i64(batch.parent_log_index),
        before_acc: batch.before_acc.as_bytes().to_vec(),
        after_acc: batch.after_acc.as_bytes().to_vec(),
        delayed_acc: batch.delayed_acc.as_bytes().to_vec(),
        gas_used: batch.gas_used.map(|v| v.to_string()),
        gas_price: batch.gas_price.map(|v| v.to_string()),
        gas_cost: batch.gas_cost.map(|v| v.to_string()),
        posted_at: batch.posted_at,
        status: batch.status.as_str().to_string(),
        confirmed_at: batch.confirmed_at,
        finalized_at: batch.finalized_at,
        transaction_count: to_i64(batch.transaction_count),
        batch_size_bytes: to_i64(batch.batch_size_bytes),
        data_hash: batch.data_hash.as_bytes().to_vec(),
        data_location: batch.data_location.as_str().to_string(),
        metadata: serde_json::to_value(&batch.metadata).map_err(store_err)?,
    })
}

fn batch_from_row(row: BatchRow) -> FinalityResult<Batch> {
    let metadata: BatchMetadata = serde_json::from_value(row.metadata)
        .map_err(|e| FinalityError::Decode(format!("batch metadata: {e}")))?;
    Ok(Batch {
        chain_id: to_u64(row.chain_id),
        sequence_number: to_u64(row.sequence_number),
        parent_block_number: to_u64(row.parent_block_number),
        parent_tx_hash: h256(&row.parent_tx_hash)?,
        parent_log_index: to_u64(row.parent_log_index),
        before_acc: h256(&row.before_acc)?,
        after_acc: h256(&row.after_acc)?,
        delayed_acc: h256(&row.delayed_acc)?,
        gas_used: u256(row.gas_used.as_deref())?,
        gas_price: u256(row.gas_price.as_deref())?,
        gas_cost: u256(row.gas_cost.as_deref())?,
        posted_at: row.posted_at,
        status: row.status.parse()?,
        confirmed_at: row.confirmed_at,
        finalized_at: row.finalized_at,
        transaction_count: to_u64(row.transaction_count),
        batch_size_bytes: to_u64(row.batch_size_bytes),
        data_hash: h256(&row.data_hash)?,
        data_location: row.data_location.parse()?,
        metadata,
    })
}

fn state_to_row(state: &TransactionState) -> FinalityResult<TransactionStateRow> {
    Ok(TransactionStateRow {
        transaction_id: to_i64(state.transaction_id),
        tx_hash: state.tx_hash.as_bytes().to_vec(),
        chain_id: to_i64(state.chain_id),
        block_number: to_i64(state.block_number),
        status: state.status.as_str().to_string(),
        submitted_at: state.submitted_at,
        sequenced_at: state.sequenced_at,
        posted_at: state.posted_at,
        confirmed_at: state.confirmed_at,
        finalized_at: state.finalized_at,
        failed_at: state.failed_at,
        batch_sequence_number: state.batch_sequence_number.map(to_i64),
        state_data: serde_json::to_value(&state.state_data).map_err(store_err)?,
        failure_reason: state.failure_reason.clone(),
        updated_at: state.updated_at,
    })
}

fn state_from_row(row: TransactionStateRow) -> FinalityResult<TransactionState> {
    Ok(TransactionState {
        transaction_id: to_u64(row.transaction_id),
        tx_hash: h256(&row.tx_hash)?,
        chain_id: to_u64(row.chain_id),
        block_number: to_u64(row.block_number),
        status: row.status.parse()?,
        submitted_at: row.submitted_at,
        sequenced_at: row.sequenced_at,
        posted_at: row.posted_at,
        confirmed_at: row.confirmed_at,
        finalized_at: row.finalized_at,
        failed_at: row.failed_at,
        batch_sequence_number: row.batch_sequence_number.map(to_u64),
        state_data: serde_json::from_value(row.state_data)
            .map_err(|e| FinalityError::Decode(format!("state data: {e}")))?,
        failure_reason: row.failure_reason,
        updated_at: row.updated_at,
    })
}

fn log_from_row(row: ParentChainLogRow) -> FinalityResult<Log> {
    let topics = [row.topic0, row.topic1, row.topic2, row.topic3]
        .into_iter()
        .flatten()
        .map(|t| h256(&t))
        .collect::<FinalityResult<Vec<_>>>()?;
    Ok(Log {
        address: address(&row.address)?,
        topics,
        data: Bytes::from(row.data),
        block_number: Some(U64::from(to_u64(row.block_number))),
        transaction_hash: Some(h256(&row.tx_hash)?),
        log_index: Some(U256::from(to_u64(row.log_index))),
        ..Default::default()
    })
}

fn transaction_from_row(row: ParentChainTransactionRow) -> FinalityResult<IndexedTransaction> {
    Ok(IndexedTransaction {
        hash: h256(&row.hash)?,
        block_number: to_u64(row.block_number),
        block_timestamp: row.block_timestamp,
        to: row.to_address.as_deref().map(address).transpose()?,
        input: Bytes::from(row.input),
        gas_used: u256(row.gas_used.as_deref())?,
        gas_price: u256(row.gas_price.as_deref())?,
        effective_gas_price: u256(row.effective_gas_price.as_deref())?,
    })
}

fn batches_from_rows(rows: Vec<BatchRow>) -> FinalityResult<Vec<Batch>> {
    rows.into_iter().map(batch_from_row).collect()
}

fn states_from_rows(rows: Vec<TransactionStateRow>) -> FinalityResult<Vec<TransactionState>> {
    rows.into_iter().map(state_from_row).collect()
}

#[derive(QueryableByName)]
struct GapRow {
    #[diesel(sql_type = BigInt)]
    seq: i64,
}

#[derive(QueryableByName)]
struct StatisticsRow {
    #[diesel(sql_type = BigInt)]
    total: i64,
    #[diesel(sql_type = BigInt)]
    pending: i64,
    #[diesel(sql_type = BigInt)]
    confirmed: i64,
    #[diesel(sql_type = BigInt)]
    finalized: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    latest: Option<i64>,
    #[diesel(sql_type = BigInt)]
    transactions: i64,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    last_posted: Option<DateTime<Utc>>,
}

const GAPS_QUERY: &str = "
    SELECT s.seq AS seq
    FROM generate_series(
        0,
        (SELECT COALESCE(MAX(sequence_number), -1) FROM batches WHERE chain_id = $1)
    ) AS s(seq)
    LEFT JOIN batches b ON b.chain_id = $1 AND b.sequence_number = s.seq
    WHERE b.sequence_number IS NULL
    ORDER BY s.seq
    LIMIT $2";

const STATISTICS_QUERY: &str = "
    SELECT COUNT(*)::BIGINT AS total,
           COUNT(*) FILTER (WHERE status = 'pending')::BIGINT AS pending,
           COUNT(*) FILTER (WHERE status = 'confirmed')::BIGINT AS confirmed,
           COUNT(*) FILTER (WHERE status = 'finalized')::BIGINT AS finalized,
           MAX(sequence_number) AS latest,
           COALESCE(SUM(transaction_count), 0)::BIGINT AS transactions,
           MAX(posted_at) AS last_posted
    FROM batches
    WHERE chain_id = $1";

#[async_trait]
impl FinalityStore for PgFinalityStore {
    async fn upsert_chain(&self, chain: &ChainConfig) -> FinalityResult<()> {
        use chain_configs::dsl;
        let row = chain_to_row(chain, Utc::now())?;
        let mut conn = self.conn().await?;
        diesel::insert_into(chain_configs::table)
            .values(&row)
            .on_conflict(dsl::chain_id)
            .do_update()
            .set((
                dsl::name.eq(excluded(dsl::name)),
                dsl::parent_chain_id.eq(excluded(dsl::parent_chain_id)),
                dsl::parent_rpc_url.eq(excluded(dsl::parent_rpc_url)),
                dsl::chain_type.eq(excluded(dsl::chain_type)),
                dsl::contracts.eq(excluded(dsl::contracts)),
                dsl::confirm_period_blocks.eq(excluded(dsl::confirm_period_blocks)),
                dsl::parent_block_time_secs.eq(excluded(dsl::parent_block_time_secs)),
                dsl::finalization_window_secs.eq(excluded(dsl::finalization_window_secs)),
                dsl::deployment_block.eq(excluded(dsl::deployment_block)),
                dsl::updated_at.eq(excluded(dsl::updated_at)),
            ))
            .execute(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn get_chain(&self, chain_id: u64) -> FinalityResult<Option<ChainConfig>> {
        use chain_configs::dsl;
        let mut conn = self.conn().await?;
        dsl::chain_configs
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .select(ChainConfigRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(chain_from_row)
            .transpose()
    }

    async fn list_chains(&self) -> FinalityResult<Vec<ChainConfig>> {
        use chain_configs::dsl;
        let mut conn = self.conn().await?;
        let rows: Vec<ChainConfigRow> = dsl::chain_configs
            .order(dsl::chain_id.asc())
            .select(ChainConfigRow::as_select())
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(chain_from_row).collect()
    }

    async fn delete_chain(&self, chain_id: u64) -> FinalityResult<bool> {
        use chain_configs::dsl;
        let mut conn = self.conn().await?;
        // batches and transaction_states cascade through their foreign keys
        let deleted = diesel::delete(dsl::chain_configs.filter(dsl::chain_id.eq(to_i64(chain_id))))
            .execute(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(deleted > 0)
    }

    async fn insert_batch(&self, batch: &Batch) -> FinalityResult<InsertOutcome> {
        let row = batch_to_row(batch)?;
        let mut conn = self.conn().await?;
        let inserted = diesel::insert_into(batches::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(if inserted == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn get_batch(
        &self,
        chain_id: u64,
        sequence_number: u64,
    ) -> FinalityResult<Option<Batch>> {
        use batches::dsl;
        let mut conn = self.conn().await?;
        dsl::batches
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(dsl::sequence_number.eq(to_i64(sequence_number)))
            .select(BatchRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(batch_from_row)
            .transpose()
    }

    async fn latest_batch(&self, chain_id: u64) -> FinalityResult<Option<Batch>> {
        use batches::dsl;
        let mut conn = self.conn().await?;
        dsl::batches
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .order(dsl::sequence_number.desc())
            .select(BatchRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(batch_from_row)
            .transpose()
    }

    async fn find_sequence_gaps(&self, chain_id: u64, limit: usize) -> FinalityResult<Vec<u64>> {
        let mut conn = self.conn().await?;
        let rows: Vec<GapRow> = diesel::sql_query(GAPS_QUERY)
            .bind::<BigInt, _>(to_i64(chain_id))
            .bind::<BigInt, _>(to_i64(limit as u64))
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(rows.into_iter().map(|r| to_u64(r.seq)).collect())
    }

    async fn batches_by_status(
        &self,
        chain_id: u64,
        statuses: &[BatchStatus],
        limit: usize,
    ) -> FinalityResult<Vec<Batch>> {
        use batches::dsl;
        let statuses: Vec<&str> = statuses.iter().map(BatchStatus::as_str).collect();
        let mut conn = self.conn().await?;
        let rows = dsl::batches
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(dsl::status.eq_any(statuses))
            .order(dsl::sequence_number.asc())
            .limit(to_i64(limit as u64))
            .select(BatchRow::as_select())
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        batches_from_rows(rows)
    }

    async fn batches_posted_before(
        &self,
        chain_id: u64,
        status: BatchStatus,
        before: DateTime<Utc>,
        limit: usize,
    ) -> FinalityResult<Vec<Batch>> {
        use batches::dsl;
        let mut conn = self.conn().await?;
        let rows = dsl::batches
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(dsl::status.eq(status.as_str()))
            .filter(dsl::posted_at.lt(before))
            .order(dsl::sequence_number.asc())
            .limit(to_i64(limit as u64))
            .select(BatchRow::as_select())
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        batches_from_rows(rows)
    }

    async fn find_batch_covering_block(
        &self,
        chain_id: u64,
        block_number: u64,
    ) -> FinalityResult<Option<Batch>> {
        use batches::dsl;
        let block = to_i64(block_number);
        let mut conn = self.conn().await?;
        dsl::batches
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(
                sql::<Bool>("(metadata->'child_blocks'->>'first')::bigint <= ")
                    .bind::<BigInt, _>(block)
                    .sql(" AND (metadata->'child_blocks'->>'last')::bigint >= ")
                    .bind::<BigInt, _>(block),
            )
            .order(dsl::sequence_number.asc())
            .select(BatchRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(batch_from_row)
            .transpose()
    }

    async fn first_batch_posted_since(
        &self,
        chain_id: u64,
        at: DateTime<Utc>,
    ) -> FinalityResult<Option<Batch>> {
        use batches::dsl;
        let mut conn = self.conn().await?;
        dsl::batches
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(dsl::posted_at.ge(at))
            .order(dsl::sequence_number.asc())
            .select(BatchRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(batch_from_row)
            .transpose()
    }

    async fn batch_by_parent_tx(&self, parent_tx_hash: H256) -> FinalityResult<Option<Batch>> {
        use batches::dsl;
        let mut conn = self.conn().await?;
        dsl::batches
            .filter(dsl::parent_tx_hash.eq(parent_tx_hash.as_bytes().to_vec()))
            .order(dsl::sequence_number.asc())
            .select(BatchRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(batch_from_row)
            .transpose()
    }

    async fn update_batch_status(
        &self,
        chain_id: u64,
        sequence_number: u64,
        expected: BatchStatus,
        next: BatchStatus,
        at: DateTime<Utc>,
    ) -> FinalityResult<bool> {
        use batches::dsl;
        let Some(mut batch) = self.get_batch(chain_id, sequence_number).await? else {
            return Ok(false);
        };
        if batch.status != expected {
            return Ok(false);
        }
        stamp_batch_status(&mut batch, next, at);
        let change = BatchStatusChange {
            status: next.as_str().to_string(),
            confirmed_at: batch.confirmed_at,
            finalized_at: batch.finalized_at,
        };
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            dsl::batches
                .filter(dsl::chain_id.eq(to_i64(chain_id)))
                .filter(dsl::sequence_number.eq(to_i64(sequence_number)))
                .filter(dsl::status.eq(expected.as_str())),
        )
        .set(&change)
        .execute(&mut conn)
        .await
        .map_err(store_err)?;
        Ok(updated == 1)
    }

    async fn batch_statistics(&self, chain_id: u64) -> FinalityResult<BatchStatistics> {
        let mut conn = self.conn().await?;
        let row: StatisticsRow = diesel::sql_query(STATISTICS_QUERY)
            .bind::<BigInt, _>(to_i64(chain_id))
            .get_result(&mut conn)
            .await
            .map_err(store_err)?;
        let total = to_u64(row.total);
        let transactions = to_u64(row.transactions);
        Ok(BatchStatistics {
            chain_id,
            total_batches: total,
            pending: to_u64(row.pending),
            confirmed: to_u64(row.confirmed),
            finalized: to_u64(row.finalized),
            latest_sequence_number: row.latest.map(to_u64),
            total_transactions: transactions,
            average_transactions_per_batch: if total == 0 {
                0.0
            } else {
                transactions as f64 / total as f64
            },
            last_posted_at: row.last_posted,
        })
    }

    async fn get_transaction_state(
        &self,
        transaction_id: u64,
    ) -> FinalityResult<Option<TransactionState>> {
        use transaction_states::dsl;
        let mut conn = self.conn().await?;
        dsl::transaction_states
            .filter(dsl::transaction_id.eq(to_i64(transaction_id)))
            .select(TransactionStateRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(state_from_row)
            .transpose()
    }

    async fn transaction_state_by_hash(
        &self,
        tx_hash: H256,
    ) -> FinalityResult<Option<TransactionState>> {
        use transaction_states::dsl;
        let mut conn = self.conn().await?;
        dsl::transaction_states
            .filter(dsl::tx_hash.eq(tx_hash.as_bytes().to_vec()))
            .select(TransactionStateRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(state_from_row)
            .transpose()
    }

    async fn create_transaction_state(
        &self,
        state: &TransactionState,
    ) -> FinalityResult<TransactionState> {
        let row = state_to_row(state)?;
        {
            let mut conn = self.conn().await?;
            diesel::insert_into(transaction_states::table)
                .values(&row)
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .await
                .map_err(store_err)?;
        }
        self.get_transaction_state(state.transaction_id)
            .await?
            .ok_or_else(|| {
                FinalityError::Store(format!(
                    "transaction state {} vanished after insert",
                    state.transaction_id
                ))
            })
    }

    async fn save_transaction_state(
        &self,
        state: &TransactionState,
        expected: TxStatus,
    ) -> FinalityResult<bool> {
        use transaction_states::dsl;
        let row = state_to_row(state)?;
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            dsl::transaction_states
                .filter(dsl::transaction_id.eq(row.transaction_id))
                .filter(dsl::status.eq(expected.as_str())),
        )
        .set(&row)
        .execute(&mut conn)
        .await
        .map_err(store_err)?;
        Ok(updated == 1)
    }

    async fn transaction_states_for_batch(
        &self,
        chain_id: u64,
        sequence_number: u64,
        status: TxStatus,
    ) -> FinalityResult<Vec<TransactionState>> {
        use transaction_states::dsl;
        let mut conn = self.conn().await?;
        let rows = dsl::transaction_states
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(dsl::batch_sequence_number.eq(to_i64(sequence_number)))
            .filter(dsl::status.eq(status.as_str()))
            .order(dsl::transaction_id.asc())
            .select(TransactionStateRow::as_select())
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        states_from_rows(rows)
    }

    async fn active_transaction_states(
        &self,
        chain_id: u64,
        limit: usize,
    ) -> FinalityResult<Vec<TransactionState>> {
        use transaction_states::dsl;
        let terminal = [TxStatus::Finalized.as_str(), TxStatus::Failed.as_str()];
        let mut conn = self.conn().await?;
        let rows = dsl::transaction_states
            .filter(dsl::chain_id.eq(to_i64(chain_id)))
            .filter(dsl::status.ne_all(terminal))
            .order(dsl::updated_at.asc())
            .limit(to_i64(limit as u64))
            .select(TransactionStateRow::as_select())
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        states_from_rows(rows)
    }
}

#[async_trait]
impl ParentLogIndex for PgFinalityStore {
    async fn is_indexed(&self, parent_chain_id: u64) -> FinalityResult<bool> {
        use parent_chain_logs::dsl;
        let mut conn = self.conn().await?;
        diesel::select(exists(
            dsl::parent_chain_logs.filter(dsl::parent_chain_id.eq(to_i64(parent_chain_id))),
        ))
        .get_result(&mut conn)
        .await
        .map_err(store_err)
    }

    async fn event_logs(
        &self,
        parent_chain_id: u64,
        query: &LogQuery,
        limit: usize,
    ) -> FinalityResult<Vec<Log>> {
        use parent_chain_logs::dsl;
        let mut conn = self.conn().await?;
        let mut select = dsl::parent_chain_logs
            .select(ParentChainLogRow::as_select())
            .filter(dsl::parent_chain_id.eq(to_i64(parent_chain_id)))
            .filter(dsl::address.eq(query.address.as_bytes().to_vec()))
            .filter(dsl::topic0.eq(query.topic0.as_bytes().to_vec()))
            .filter(dsl::block_number.between(to_i64(query.from_block), to_i64(query.to_block)))
            .into_boxed();
        if let Some(topic1) = query.topic1 {
            select = select.filter(dsl::topic1.eq(topic1.as_bytes().to_vec()));
        }
        let rows: Vec<ParentChainLogRow> = select
            .order((dsl::block_number.asc(), dsl::log_index.asc()))
            .limit(to_i64(limit as u64))
            .load(&mut conn)
            .await
            .map_err(store_err)?;
        rows.into_iter().map(log_from_row).collect()
    }

    async fn transaction(
        &self,
        parent_chain_id: u64,
        hash: H256,
    ) -> FinalityResult<Option<IndexedTransaction>> {
        use parent_chain_transactions::dsl;
        let mut conn = self.conn().await?;
        dsl::parent_chain_transactions
            .filter(dsl::parent_chain_id.eq(to_i64(parent_chain_id)))
            .filter(dsl::hash.eq(hash.as_bytes().to_vec()))
            .select(ParentChainTransactionRow::as_select())
            .first(&mut conn)
            .await
            .optional()
            .map_err(store_err)?
            .map(transaction_from_row)
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{batch, chain_config};
    use orbit_finality_core::types::BlockRange;
    use orbit_finality_pg_db::DbArgs;
    use url::Url;

    #[test]
    fn batch_row_round_trip() {
        let mut original = batch(1001, 12);
        original.gas_used = Some(U256::from(21_000u64));
        original.gas_price = Some(U256::exp10(10));
        original.metadata.child_blocks = Some(BlockRange { first: 5, last: 9 });
        let restored = batch_from_row(batch_to_row(&original).unwrap()).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn malformed_hash_bytes_are_decode_errors() {
        let mut row = batch_to_row(&batch(1001, 1)).unwrap();
        row.data_hash = vec![1, 2, 3];
        assert!(matches!(
            batch_from_row(row).unwrap_err(),
            FinalityError::Decode(_)
        ));
    }

    #[test]
    fn chain_row_round_trip() {
        let chain = chain_config(42_170);
        let restored = chain_from_row(chain_to_row(&chain, Utc::now()).unwrap()).unwrap();
        assert_eq!(restored, chain);
    }

    async fn test_store() -> PgFinalityStore {
        let url: Url = std::env::var("TEST_DATABASE_URL")
            .expect("TEST_DATABASE_URL environment variable must be set")
            .parse()
            .expect("Invalid database URL format");
        let db = Db::for_write(url, DbArgs::default()).await.unwrap();
        db.run_migrations(&orbit_finality_schema::MIGRATIONS)
            .await
            .unwrap();
        PgFinalityStore::new(db)
    }

    #[tokio::test]
    #[ignore] // Requires TEST_DATABASE_URL environment variable
    async fn pg_batch_lifecycle() {
        let store = test_store().await;
        let chain = chain_config(990_001);
        store.delete_chain(chain.chain_id).await.unwrap();
        store.upsert_chain(&chain).await.unwrap();

        for seq in [0, 1, 3] {
            let mut b = batch(chain.chain_id, seq);
            b.metadata.child_blocks = Some(BlockRange {
                first: seq * 10,
                last: seq * 10 + 9,
            });
            assert_eq!(store.insert_batch(&b).await.unwrap(), InsertOutcome::Inserted);
        }
        assert_eq!(
            store.insert_batch(&batch(chain.chain_id, 1)).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(store.find_sequence_gaps(chain.chain_id, 10).await.unwrap(), vec![2]);
        let covering = store
            .find_batch_covering_block(chain.chain_id, 14)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(covering.sequence_number, 1);

        assert!(store
            .update_batch_status(
                chain.chain_id,
                0,
                BatchStatus::Pending,
                BatchStatus::Confirmed,
                Utc::now()
            )
            .await
            .unwrap());
        let stats = store.batch_statistics(chain.chain_id).await.unwrap();
        assert_eq!(stats.total_batches, 3);
        assert_eq!(stats.confirmed, 1);
        assert_eq!(stats.latest_sequence_number, Some(3));

        assert!(store.delete_chain(chain.chain_id).await.unwrap());
        assert!(store.latest_batch(chain.chain_id).await.unwrap().is_none());
    }
}
