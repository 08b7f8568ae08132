// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batch Discovery
//!
//! Finds `SequencerBatchDelivered` events for a chain and persists them as
//! batches.
//!
//! ## Paths
//!
//! 1. **Local index** (parent chain logs already ingested):
//!    - Read delivery logs from the block of the last persisted batch onward
//!    - Resolve the submitting transaction from the index, never over RPC
//!
//! 2. **RPC** (no local index):
//!    - Read `batchCount()` from the sequencer inbox
//!    - Retry sequence gaps first, searching only between their neighbours
//!    - Scan forward in block chunks, halving the chunk on range-limit errors
//!
//! Batches are persisted in ascending order and a run stops at the first
//! batch it cannot resolve, so a failure never leaves a hole behind it.

use crate::chains::{ChainRegistry, ChainRuntime};
use crate::store::{FinalityStore, ParentLogIndex};
use chrono::{DateTime, Utc};
use ethers::types::{Log, H256, U256};
use orbit_finality_core::parser::{BatchParser, ParseContext};
use orbit_finality_core::rpc::events::{
    extract_batch_payload, extract_separate_event_payload, sequencer_batch_data_topic,
    sequencer_batch_delivered_topic,
};
use orbit_finality_core::rpc::{BatchDataLocation, BatchDeliveredEvent, LogQuery, ParentChainRpc};
use orbit_finality_core::types::{Batch, BatchMetadata, BatchStatus, BlockRange, InsertOutcome};
use orbit_finality_core::{FinalityError, FinalityMetrics, FinalityResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for batch discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Upper bound on batches persisted by one run
    pub max_batches_per_run: usize,
    /// Blocks per `eth_getLogs` request on the RPC path
    pub chunk_size: u64,
    /// Chunk size below which range-limit errors are no longer absorbed
    pub min_chunk_size: u64,
    /// Gaps retried per run before scanning forward
    pub max_gap_retries: usize,
    /// Logs read from the local index per run
    pub local_log_limit: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_batches_per_run: 100,
            chunk_size: 500,
            min_chunk_size: 8,
            max_gap_retries: 20,
            local_log_limit: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPath {
    LocalIndex,
    Rpc,
}

impl DiscoveryPath {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DiscoveryPath::LocalIndex => "local_index",
            DiscoveryPath::Rpc => "rpc",
        }
    }
}

/// Outcome of one discovery run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryReport {
    pub chain_id: u64,
    pub path: DiscoveryPath,
    pub start_from: u64,
    pub latest_on_chain: Option<u64>,
    pub batches_processed: u64,
    pub batches_indexed: u64,
    pub batches_skipped: u64,
    pub errors: Vec<String>,
    pub has_more: bool,
}

impl DiscoveryReport {
    fn new(chain_id: u64, path: DiscoveryPath, start_from: u64) -> Self {
        Self {
            chain_id,
            path,
            start_from,
            latest_on_chain: None,
            batches_processed: 0,
            batches_indexed: 0,
            batches_skipped: 0,
            errors: Vec::new(),
            has_more: false,
        }
    }
}

/// Everything needed to persist one batch.
#[derive(Debug, Clone)]
struct ResolvedDelivery {
    event: BatchDeliveredEvent,
    payload: Vec<u8>,
    posted_at: DateTime<Utc>,
    gas_used: Option<U256>,
    gas_price: Option<U256>,
}

pub struct BatchDiscovery {
    registry: Arc<ChainRegistry>,
    store: Arc<dyn FinalityStore>,
    log_index: Arc<dyn ParentLogIndex>,
    parser: BatchParser,
    config: DiscoveryConfig,
    metrics: Option<Arc<FinalityMetrics>>,
}

impl std::fmt::Debug for BatchDiscovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDiscovery")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchDiscovery {
    pub fn new(
        registry: Arc<ChainRegistry>,
        log_index: Arc<dyn ParentLogIndex>,
        parser: BatchParser,
        config: DiscoveryConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            store: registry.store().clone(),
            registry,
            log_index,
            parser,
            config,
            metrics,
        }
    }

    pub async fn discover(&self, chain_id: u64) -> FinalityResult<DiscoveryReport> {
        let runtime = self.registry.runtime(chain_id).await?;
        let latest = self.store.latest_batch(chain_id).await?;
        let start_from = latest.as_ref().map_or(0, |b| b.sequence_number + 1);

        let report = if self
            .log_index
            .is_indexed(runtime.config.parent_chain_id)
            .await?
        {
            self.discover_from_index(&runtime, latest, start_from).await?
        } else {
            self.discover_from_rpc(&runtime, latest, start_from).await?
        };

        info!(
            "[Discovery] {} via {}: processed={} indexed={} skipped={} errors={} has_more={}",
            runtime.config.display_name(),
            report.path.as_str(),
            report.batches_processed,
            report.batches_indexed,
            report.batches_skipped,
            report.errors.len(),
            report.has_more
        );
        Ok(report)
    }

    /// Whether the inbox has delivered batches this store has not seen yet.
    pub async fn is_behind(&self, chain_id: u64) -> FinalityResult<bool> {
        let runtime = self.registry.runtime(chain_id).await?;
        let on_chain = runtime.contracts.sequencer_inbox.batch_count().await?;
        let local = self
            .store
            .latest_batch(chain_id)
            .await?
            .map_or(0, |b| b.sequence_number + 1);
        Ok(on_chain > local)
    }

    // ========================================================================
    // Local index path
    // ========================================================================

    async fn discover_from_index(
        &self,
        runtime: &ChainRuntime,
        latest: Option<Batch>,
        start_from: u64,
    ) -> FinalityResult<DiscoveryReport> {
        let chain = &runtime.config;
        let mut report =
            DiscoveryReport::new(chain.chain_id, DiscoveryPath::LocalIndex, start_from);
        let query = LogQuery {
            address: chain.contracts.sequencer_inbox,
            topic0: sequencer_batch_delivered_topic(),
            topic1: None,
            from_block: latest
                .as_ref()
                .map_or(chain.deployment_block, |b| b.parent_block_number),
            to_block: u64::MAX,
        };
        let logs = self
            .log_index
            .event_logs(chain.parent_chain_id, &query, self.config.local_log_limit)
            .await?;
        let events = self.decode_events(chain.chain_id, &logs, &mut report);
        report.latest_on_chain = events.keys().next_back().copied();

        let mut previous = latest;
        let mut expected = start_from;
        for (sequence_number, event) in events.into_iter().filter(|(seq, _)| *seq >= start_from) {
            if report.batches_processed as usize >= self.config.max_batches_per_run {
                report.has_more = true;
                break;
            }
            if sequence_number != expected {
                let e = FinalityError::Store(format!(
                    "delivery of batch {} is missing from the local index",
                    expected
                ));
                self.record_error(&mut report, expected, &e);
                report.has_more = true;
                break;
            }
            expected += 1;
            if self.store.get_batch(chain.chain_id, sequence_number).await?.is_some() {
                self.record_skip(&mut report);
                continue;
            }
            let resolved = match self.resolve_from_index(runtime, event).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    self.record_error(&mut report, sequence_number, &e);
                    report.has_more = true;
                    break;
                }
            };
            let path = DiscoveryPath::LocalIndex;
            match self
                .persist(runtime, resolved, previous.as_ref(), path, &mut report)
                .await
            {
                Ok(batch) => previous = Some(batch),
                Err(e) => {
                    self.record_error(&mut report, sequence_number, &e);
                    report.has_more = true;
                    break;
                }
            }
        }
        if logs.len() >= self.config.local_log_limit {
            report.has_more = true;
        }
        Ok(report)
    }

    async fn resolve_from_index(
        &self,
        runtime: &ChainRuntime,
        event: BatchDeliveredEvent,
    ) -> FinalityResult<ResolvedDelivery> {
        let chain = &runtime.config;
        let tx = self
            .log_index
            .transaction(chain.parent_chain_id, event.transaction_hash)
            .await?
            .ok_or_else(|| {
                FinalityError::Store(format!(
                    "parent transaction {:?} of batch {} is not indexed",
                    event.transaction_hash, event.sequence_number
                ))
            })?;
        let payload = match event.data_location {
            BatchDataLocation::TxInput => extract_batch_payload(&tx.input).unwrap_or_default(),
            BatchDataLocation::SeparateBatchEvent => {
                let logs = self
                    .log_index
                    .event_logs(
                        chain.parent_chain_id,
                        &separate_data_query(runtime, &event),
                        1,
                    )
                    .await?;
                separate_payload(&logs, event.sequence_number)
            }
            BatchDataLocation::NoData | BatchDataLocation::Blob => Vec::new(),
        };
        Ok(ResolvedDelivery {
            payload,
            posted_at: tx.block_timestamp,
            gas_used: tx.gas_used,
            gas_price: tx.effective_gas_price.or(tx.gas_price),
            event,
        })
    }

    // ========================================================================
    // RPC path
    // ========================================================================

    async fn discover_from_rpc(
        &self,
        runtime: &ChainRuntime,
        latest: Option<Batch>,
        start_from: u64,
    ) -> FinalityResult<DiscoveryReport> {
        let chain = &runtime.config;
        let mut report = DiscoveryReport::new(chain.chain_id, DiscoveryPath::Rpc, start_from);
        let batch_count = runtime.contracts.sequencer_inbox.batch_count().await?;
        report.latest_on_chain = batch_count.checked_sub(1);

        self.recover_gaps(runtime, latest.as_ref(), &mut report).await?;
        if !report.errors.is_empty() {
            report.has_more = true;
            return Ok(report);
        }

        let budget = self
            .config
            .max_batches_per_run
            .saturating_sub(report.batches_processed as usize) as u64;
        let target_end = batch_count.min(start_from.saturating_add(budget));
        if start_from >= target_end {
            report.has_more = start_from < batch_count;
            return Ok(report);
        }

        let head = runtime.rpc.block_number().await?;
        let from_block = latest
            .as_ref()
            .map_or(chain.deployment_block, |b| b.parent_block_number);
        let wanted = target_end - start_from;
        let targeted = |log: &Log| {
            log.topics.get(1).map_or(false, |topic| {
                let seq = U256::from_big_endian(topic.as_bytes());
                seq >= U256::from(start_from) && seq < U256::from(target_end)
            })
        };
        let query = delivered_query(runtime, None, from_block, head);
        let logs = self
            .scan_logs(runtime.rpc.as_ref(), query, |logs| {
                logs.iter().filter(|log| targeted(log)).count() as u64 >= wanted
            })
            .await;
        let logs = match logs {
            Ok(logs) => logs,
            Err(e) if e.is_transient() => return Err(e),
            Err(e) => {
                self.record_error(&mut report, start_from, &e);
                report.has_more = true;
                return Ok(report);
            }
        };
        let events = self.decode_events(chain.chain_id, &logs, &mut report);

        let mut previous = latest;
        for sequence_number in start_from..target_end {
            let Some(event) = events.get(&sequence_number).cloned() else {
                let e = FinalityError::Rpc(format!(
                    "delivery event for batch {} not found in blocks {}..={}",
                    sequence_number, from_block, head
                ));
                self.record_error(&mut report, sequence_number, &e);
                break;
            };
            let resolved = match self.resolve_from_rpc(runtime, event).await {
                Ok(resolved) => resolved,
                Err(e) if e.is_transient() && report.batches_processed == 0 => return Err(e),
                Err(e) => {
                    self.record_error(&mut report, sequence_number, &e);
                    break;
                }
            };
            let persisted = self
                .persist(runtime, resolved, previous.as_ref(), DiscoveryPath::Rpc, &mut report)
                .await;
            match persisted {
                Ok(batch) => previous = Some(batch),
                Err(e) => {
                    self.record_error(&mut report, sequence_number, &e);
                    break;
                }
            }
        }

        let next = previous.map_or(0, |b| b.sequence_number + 1);
        report.has_more = next < batch_count;
        Ok(report)
    }

    /// Retries sequence numbers missing below the latest persisted batch.
    async fn recover_gaps(
        &self,
        runtime: &ChainRuntime,
        latest: Option<&Batch>,
        report: &mut DiscoveryReport,
    ) -> FinalityResult<()> {
        let chain = &runtime.config;
        let Some(latest) = latest else {
            return Ok(());
        };
        let gaps = self
            .store
            .find_sequence_gaps(chain.chain_id, self.config.max_gap_retries)
            .await?;
        if gaps.is_empty() {
            return Ok(());
        }
        warn!(
            "[Discovery] {} has {} sequence gaps: {:?}",
            chain.display_name(),
            gaps.len(),
            &gaps[..gaps.len().min(10)]
        );

        for sequence_number in gaps {
            match self
                .recover_gap(runtime, sequence_number, latest.parent_block_number, report)
                .await
            {
                Ok(_) => info!(
                    "[Discovery] Recovered gap batch {} for {}",
                    sequence_number,
                    chain.display_name()
                ),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    self.record_error(report, sequence_number, &e);
                    break;
                }
            }
        }
        Ok(())
    }

    /// Searches between the gap's lower neighbour and `upper_block` for the
    /// delivery of `sequence_number`.
    async fn recover_gap(
        &self,
        runtime: &ChainRuntime,
        sequence_number: u64,
        upper_block: u64,
        report: &mut DiscoveryReport,
    ) -> FinalityResult<Batch> {
        let chain = &runtime.config;
        let previous = match sequence_number.checked_sub(1) {
            Some(prev) => self.store.get_batch(chain.chain_id, prev).await?,
            None => None,
        };
        let from_block = previous
            .as_ref()
            .map_or(chain.deployment_block, |b| b.parent_block_number);
        let query = delivered_query(
            runtime,
            Some(sequence_topic(sequence_number)),
            from_block,
            upper_block,
        );
        let logs = self
            .scan_logs(runtime.rpc.as_ref(), query, |logs| !logs.is_empty())
            .await?;
        let log = logs.first().ok_or_else(|| {
            FinalityError::Rpc(format!(
                "delivery event for gap batch {} not found in blocks {}..={}",
                sequence_number, from_block, upper_block
            ))
        })?;
        let event = BatchDeliveredEvent::decode(log)?;
        let resolved = self.resolve_from_rpc(runtime, event).await?;
        self.persist(runtime, resolved, previous.as_ref(), DiscoveryPath::Rpc, report)
            .await
    }

    async fn resolve_from_rpc(
        &self,
        runtime: &ChainRuntime,
        event: BatchDeliveredEvent,
    ) -> FinalityResult<ResolvedDelivery> {
        let rpc = runtime.rpc.as_ref();
        let tx = rpc
            .get_transaction(event.transaction_hash)
            .await?
            .ok_or_else(|| {
                FinalityError::Rpc(format!(
                    "parent transaction {:?} of batch {} not available",
                    event.transaction_hash, event.sequence_number
                ))
            })?;
        let receipt = rpc.get_transaction_receipt(event.transaction_hash).await?;
        let posted_at = rpc
            .get_block_timestamp(event.block_number)
            .await?
            .ok_or_else(|| {
                FinalityError::Rpc(format!("block {} not available", event.block_number))
            })?;
        let payload = match event.data_location {
            BatchDataLocation::TxInput => extract_batch_payload(&tx.input).unwrap_or_default(),
            BatchDataLocation::SeparateBatchEvent => {
                let logs = rpc.get_logs(&separate_data_query(runtime, &event)).await?;
                separate_payload(&logs, event.sequence_number)
            }
            BatchDataLocation::NoData | BatchDataLocation::Blob => Vec::new(),
        };
        Ok(ResolvedDelivery {
            payload,
            posted_at,
            gas_used: receipt.as_ref().and_then(|r| r.gas_used),
            gas_price: receipt
                .as_ref()
                .and_then(|r| r.effective_gas_price)
                .or(tx.gas_price),
            event,
        })
    }

    /// Reads logs over `[query.from_block, query.to_block]` in chunks until
    /// `done` is satisfied or the range is exhausted.
    async fn scan_logs(
        &self,
        rpc: &dyn ParentChainRpc,
        query: LogQuery,
        done: impl Fn(&[Log]) -> bool,
    ) -> FinalityResult<Vec<Log>> {
        let mut chunk = self.config.chunk_size.max(1);
        let mut start = query.from_block;
        let mut logs = Vec::new();
        while start <= query.to_block {
            let end = start.saturating_add(chunk - 1).min(query.to_block);
            let window = LogQuery {
                from_block: start,
                to_block: end,
                ..query.clone()
            };
            match rpc.get_logs(&window).await {
                Ok(found) => {
                    logs.extend(found);
                    if done(&logs) || end == u64::MAX {
                        break;
                    }
                    start = end + 1;
                }
                Err(e) if e.is_block_range_limit() && chunk > self.config.min_chunk_size => {
                    chunk = (chunk / 2).max(self.config.min_chunk_size);
                    debug!(
                        "[Discovery] Range limit at {}..={}, shrinking chunk to {}",
                        start, end, chunk
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(logs)
    }

    // ========================================================================
    // Shared
    // ========================================================================

    fn decode_events(
        &self,
        chain_id: u64,
        logs: &[Log],
        report: &mut DiscoveryReport,
    ) -> BTreeMap<u64, BatchDeliveredEvent> {
        let mut events = BTreeMap::new();
        for log in logs {
            match BatchDeliveredEvent::decode(log) {
                Ok(event) => {
                    events.entry(event.sequence_number).or_insert(event);
                }
                Err(e) => {
                    warn!(
                        "[Discovery] Undecodable delivery log in tx {:?} for chain {}: {}",
                        log.transaction_hash, chain_id, e
                    );
                    report.errors.push(format!("log {:?}: {}", log.transaction_hash, e));
                    self.count_error(chain_id, &e);
                }
            }
        }
        events
    }

    async fn persist(
        &self,
        runtime: &ChainRuntime,
        delivery: ResolvedDelivery,
        previous: Option<&Batch>,
        path: DiscoveryPath,
        report: &mut DiscoveryReport,
    ) -> FinalityResult<Batch> {
        let batch = self.build_batch(runtime, delivery, previous);
        report.batches_processed += 1;
        let chain_label = batch.chain_id.to_string();
        match self.store.insert_batch(&batch).await? {
            InsertOutcome::Inserted => {
                report.batches_indexed += 1;
                if let Some(m) = &self.metrics {
                    m.batches_discovered
                        .with_label_values(&[&chain_label, path.as_str()])
                        .inc();
                    m.last_discovered_sequence
                        .with_label_values(&[&chain_label])
                        .set(batch.sequence_number as i64);
                }
                debug!(
                    "[Discovery] Persisted batch {} for chain {} ({} txs, {})",
                    batch.sequence_number,
                    batch.chain_id,
                    batch.transaction_count,
                    batch.data_location
                );
            }
            InsertOutcome::Duplicate => self.record_skip(report),
        }
        Ok(batch)
    }

    fn build_batch(
        &self,
        runtime: &ChainRuntime,
        delivery: ResolvedDelivery,
        previous: Option<&Batch>,
    ) -> Batch {
        let ResolvedDelivery {
            event,
            payload,
            posted_at,
            gas_used,
            gas_price,
        } = delivery;
        let chain_id = runtime.config.chain_id;
        let location = event.data_location.resolve(&payload);
        let parsed = self.parser.parse(
            &payload,
            location,
            &ParseContext {
                chain_id,
                sequence_number: event.sequence_number,
            },
        );
        // Ranges are extended only from decoder-reported block counts.
        let child_blocks = parsed.child_block_range().or_else(|| {
            if parsed.is_heuristic() {
                return None;
            }
            let count = parsed.block_count.filter(|c| *c > 0)?;
            let prev = previous
                .filter(|p| p.sequence_number + 1 == event.sequence_number)?
                .metadata
                .child_blocks?;
            let first = prev.last + 1;
            Some(BlockRange {
                first,
                last: first + count - 1,
            })
        });
        let gas_cost = match (gas_used, gas_price) {
            (Some(used), Some(price)) => used.checked_mul(price),
            _ => None,
        };
        Batch {
            chain_id,
            sequence_number: event.sequence_number,
            parent_block_number: event.block_number,
            parent_tx_hash: event.transaction_hash,
            parent_log_index: event.log_index,
            before_acc: event.before_acc,
            after_acc: event.after_acc,
            delayed_acc: event.delayed_acc,
            gas_used,
            gas_price,
            gas_cost,
            posted_at,
            status: BatchStatus::Pending,
            confirmed_at: None,
            finalized_at: None,
            transaction_count: parsed.transaction_count_estimate,
            batch_size_bytes: parsed.batch_size_bytes,
            data_hash: parsed.data_hash,
            data_location: location,
            metadata: BatchMetadata {
                time_bounds: Some(event.time_bounds),
                after_delayed_messages_read: Some(event.after_delayed_messages_read),
                child_blocks,
                parse: Some(parsed.metadata),
            },
        }
    }

    fn record_skip(&self, report: &mut DiscoveryReport) {
        report.batches_skipped += 1;
        if let Some(m) = &self.metrics {
            m.batches_skipped
                .with_label_values(&[&report.chain_id.to_string()])
                .inc();
        }
    }

    fn record_error(&self, report: &mut DiscoveryReport, sequence_number: u64, e: &FinalityError) {
        warn!(
            "[Discovery] Chain {} batch {}: {}",
            report.chain_id, sequence_number, e
        );
        report.errors.push(format!("batch {}: {}", sequence_number, e));
        self.count_error(report.chain_id, e);
    }

    fn count_error(&self, chain_id: u64, e: &FinalityError) {
        if let Some(m) = &self.metrics {
            m.discovery_errors
                .with_label_values(&[&chain_id.to_string(), e.error_type()])
                .inc();
        }
    }
}

fn sequence_topic(sequence_number: u64) -> H256 {
    H256::from_low_u64_be(sequence_number)
}

fn delivered_query(
    runtime: &ChainRuntime,
    topic1: Option<H256>,
    from_block: u64,
    to_block: u64,
) -> LogQuery {
    LogQuery {
        address: runtime.config.contracts.sequencer_inbox,
        topic0: sequencer_batch_delivered_topic(),
        topic1,
        from_block,
        to_block,
    }
}

fn separate_data_query(runtime: &ChainRuntime, event: &BatchDeliveredEvent) -> LogQuery {
    LogQuery {
        address: runtime.config.contracts.sequencer_inbox,
        topic0: sequencer_batch_data_topic(),
        topic1: Some(sequence_topic(event.sequence_number)),
        from_block: event.block_number,
        to_block: event.block_number,
    }
}

fn separate_payload(logs: &[Log], sequence_number: u64) -> Vec<u8> {
    logs.iter()
        .find_map(|log| extract_separate_event_payload(log, sequence_number))
        .unwrap_or_default()
}
