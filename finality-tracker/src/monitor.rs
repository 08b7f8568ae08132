// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Batch Monitor
//!
//! Re-checks pending and confirmed batches against the rollup contract:
//!
//! - `pending -> confirmed` once the sequence number is at or below
//!   `latestConfirmed()`
//! - `confirmed -> finalized` once the batch is older than the chain's
//!   finalization window
//!
//! Pending batches and confirmed batches past the window are read as two
//! separately bounded sets, each in ascending sequence order. Every status change is
//! followed by advancing the transactions recorded against the batch
//! (`SEQUENCED -> POSTED` on confirmation, `POSTED -> CONFIRMED` on
//! finalization).

use crate::chains::ChainRegistry;
use crate::store::{stamp_batch_status, FinalityStore};
use orbit_finality_core::clock::elapsed_between;
use orbit_finality_core::types::{Batch, BatchStatus, StateEvidence, TxStatus};
use orbit_finality_core::{ChainConfig, Clock, FinalityError, FinalityMetrics, FinalityResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Pending/confirmed batches examined per run
    pub max_batches_per_run: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_batches_per_run: 500,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorReport {
    pub chain_id: u64,
    pub latest_confirmed: Option<u64>,
    pub batches_checked: u64,
    pub batches_updated: u64,
    pub batches_confirmed: u64,
    pub batches_finalized: u64,
    pub transactions_updated: u64,
    pub errors: Vec<String>,
}

pub struct BatchMonitor {
    registry: Arc<ChainRegistry>,
    store: Arc<dyn FinalityStore>,
    clock: Arc<dyn Clock>,
    config: MonitorConfig,
    metrics: Option<Arc<FinalityMetrics>>,
}

impl std::fmt::Debug for BatchMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchMonitor {
    pub fn new(
        registry: Arc<ChainRegistry>,
        clock: Arc<dyn Clock>,
        config: MonitorConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            store: registry.store().clone(),
            registry,
            clock,
            config,
            metrics,
        }
    }

    pub async fn monitor(&self, chain_id: u64) -> FinalityResult<MonitorReport> {
        let runtime = self.registry.runtime(chain_id).await?;
        let chain = &runtime.config;
        let mut report = MonitorReport {
            chain_id,
            ..Default::default()
        };

        // Confirmed batches are bounded by age so a long tail still inside
        // the finalization window cannot crowd out pending batches.
        let cutoff = self.clock.now()
            - chrono::Duration::from_std(chain.finalization_window())
                .map_err(|e| FinalityError::Configuration(e.to_string()))?;
        let aged = self
            .store
            .batches_posted_before(
                chain_id,
                BatchStatus::Confirmed,
                cutoff,
                self.config.max_batches_per_run,
            )
            .await?;
        let pending = self
            .store
            .batches_by_status(
                chain_id,
                &[BatchStatus::Pending],
                self.config.max_batches_per_run,
            )
            .await?;
        if pending.is_empty() && aged.is_empty() {
            debug!("[Monitor] No open batches for {}", chain.display_name());
            return Ok(report);
        }

        if !pending.is_empty() {
            // Without the pointer, finalization by age can still proceed.
            report.latest_confirmed = match runtime.contracts.rollup.latest_confirmed().await {
                Ok(latest) => Some(latest),
                Err(e) => {
                    warn!(
                        "[Monitor] latestConfirmed() failed for {}: {}",
                        chain.display_name(),
                        e
                    );
                    report.errors.push(format!("latestConfirmed: {}", e));
                    None
                }
            };
        }

        for batch in pending.into_iter().chain(aged) {
            report.batches_checked += 1;
            let sequence_number = batch.sequence_number;
            if let Err(e) = self.check_batch(chain, batch, &mut report).await {
                warn!(
                    "[Monitor] Chain {} batch {}: {}",
                    chain_id, sequence_number, e
                );
                report
                    .errors
                    .push(format!("batch {}: {}", sequence_number, e));
            }
        }

        info!(
            "[Monitor] {}: checked={} confirmed={} finalized={} transactions={} errors={}",
            chain.display_name(),
            report.batches_checked,
            report.batches_confirmed,
            report.batches_finalized,
            report.transactions_updated,
            report.errors.len()
        );
        Ok(report)
    }

    async fn check_batch(
        &self,
        chain: &ChainConfig,
        mut batch: Batch,
        report: &mut MonitorReport,
    ) -> FinalityResult<()> {
        let now = self.clock.now();

        if batch.status == BatchStatus::Pending
            && report
                .latest_confirmed
                .is_some_and(|latest| batch.sequence_number <= latest)
        {
            if self
                .transition(&mut batch, BatchStatus::Pending, BatchStatus::Confirmed)
                .await?
            {
                report.batches_updated += 1;
                report.batches_confirmed += 1;
            }
            report.transactions_updated += self
                .advance_transactions_for_batch(&batch, TxStatus::Sequenced)
                .await?;
        }

        if batch.status == BatchStatus::Confirmed
            && elapsed_between(batch.posted_at, now) > chain.finalization_window()
        {
            if self
                .transition(&mut batch, BatchStatus::Confirmed, BatchStatus::Finalized)
                .await?
            {
                report.batches_updated += 1;
                report.batches_finalized += 1;
            }
            report.transactions_updated += self
                .advance_transactions_for_batch(&batch, TxStatus::Posted)
                .await?;
        }
        Ok(())
    }

    /// Applies `expected -> next` to the stored batch and refreshes `batch`
    /// from the store. Returns whether this call made the change.
    async fn transition(
        &self,
        batch: &mut Batch,
        expected: BatchStatus,
        next: BatchStatus,
    ) -> FinalityResult<bool> {
        let now = self.clock.now();
        let applied = self
            .store
            .update_batch_status(batch.chain_id, batch.sequence_number, expected, next, now)
            .await?;
        if applied {
            stamp_batch_status(batch, next, now);
            info!(
                "[Monitor] Batch {} of chain {} is now {}",
                batch.sequence_number, batch.chain_id, next
            );
            if let Some(m) = &self.metrics {
                m.batch_status_transitions
                    .with_label_values(&[&batch.chain_id.to_string(), next.as_str()])
                    .inc();
            }
        } else {
            *batch = self
                .store
                .get_batch(batch.chain_id, batch.sequence_number)
                .await?
                .ok_or_else(|| {
                    FinalityError::Store(format!(
                        "batch {} of chain {} disappeared",
                        batch.sequence_number, batch.chain_id
                    ))
                })?;
        }
        Ok(applied)
    }

    /// Moves transactions recorded against `batch` in state `from` one step
    /// forward, as implied by the batch's current status. Returns the number
    /// of transactions advanced.
    pub async fn advance_transactions_for_batch(
        &self,
        batch: &Batch,
        from: TxStatus,
    ) -> FinalityResult<u64> {
        let evidence = match (from, batch.status) {
            (TxStatus::Sequenced, BatchStatus::Confirmed | BatchStatus::Finalized) => {
                StateEvidence::Posted {
                    batch_sequence_number: batch.sequence_number,
                    batch_confirmed_at: batch.confirmed_at,
                }
            }
            (TxStatus::Posted, BatchStatus::Finalized) => StateEvidence::Confirmed {
                batch_sequence_number: batch.sequence_number,
                batch_finalized_at: batch.finalized_at,
            },
            _ => return Ok(0),
        };
        let to = evidence.status();

        let states = self
            .store
            .transaction_states_for_batch(batch.chain_id, batch.sequence_number, from)
            .await?;
        let mut advanced = 0;
        for state in states {
            let mut next = state.clone();
            next.advance(evidence.clone(), self.clock.now())?;
            if self.store.save_transaction_state(&next, from).await? {
                advanced += 1;
                if let Some(m) = &self.metrics {
                    m.transaction_transitions
                        .with_label_values(&[from.as_str(), to.as_str()])
                        .inc();
                }
            }
        }
        if advanced > 0 {
            debug!(
                "[Monitor] Advanced {} transactions {} -> {} for batch {}",
                advanced, from, to, batch.sequence_number
            );
        }
        Ok(advanced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{batch, tracked_tx, Harness};
    use chrono::Duration as ChronoDuration;
    use ethers::types::H256;
    use orbit_finality_core::types::{MatchMethod, TransactionState};
    use std::time::Duration;

    fn monitor(h: &Harness) -> BatchMonitor {
        BatchMonitor::new(
            h.registry.clone(),
            h.clock.clone(),
            MonitorConfig::default(),
            Some(h.metrics.clone()),
        )
    }

    async fn sequenced_state(h: &Harness, id: u64, sequence_number: u64) -> TransactionState {
        let mut state = TransactionState::submitted(&tracked_tx(id, h.chain.chain_id, 10));
        h.store.create_transaction_state(&state).await.unwrap();
        state
            .advance(
                StateEvidence::Sequenced {
                    batch_sequence_number: sequence_number,
                    parent_tx_hash: H256::zero(),
                    parent_block_number: 100,
                    matched_by: MatchMethod::Timestamp,
                },
                h.clock.now(),
            )
            .unwrap();
        assert!(h
            .store
            .save_transaction_state(&state, TxStatus::Submitted)
            .await
            .unwrap());
        state
    }

    #[tokio::test]
    async fn confirmation_pointer_confirms_batch_and_posts_transactions() {
        let h = Harness::new(1001).await;
        h.persist_batch(batch(1001, 40)).await;
        h.persist_batch(batch(1001, 51)).await;
        sequenced_state(&h, 7, 40).await;
        sequenced_state(&h, 8, 51).await;
        h.set_latest_confirmed(50);

        let report = monitor(&h).monitor(1001).await.unwrap();
        assert_eq!(report.latest_confirmed, Some(50));
        assert_eq!(report.batches_checked, 2);
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(report.transactions_updated, 1);

        let confirmed = h.store.get_batch(1001, 40).await.unwrap().unwrap();
        assert_eq!(confirmed.status, BatchStatus::Confirmed);
        assert_eq!(confirmed.confirmed_at, Some(h.clock.now()));
        let pending = h.store.get_batch(1001, 51).await.unwrap().unwrap();
        assert_eq!(pending.status, BatchStatus::Pending);

        let posted = h.store.get_transaction_state(7).await.unwrap().unwrap();
        assert_eq!(posted.status, TxStatus::Posted);
        assert!(matches!(
            posted.evidence_for(TxStatus::Posted),
            Some(StateEvidence::Posted {
                batch_sequence_number: 40,
                ..
            })
        ));
        let untouched = h.store.get_transaction_state(8).await.unwrap().unwrap();
        assert_eq!(untouched.status, TxStatus::Sequenced);
    }

    #[tokio::test]
    async fn old_confirmed_batches_finalize() {
        let h = Harness::new(1001).await;
        h.persist_batch(batch(1001, 0)).await;
        sequenced_state(&h, 1, 0).await;
        h.set_latest_confirmed(0);
        let monitor = monitor(&h);

        monitor.monitor(1001).await.unwrap();
        h.clock.advance(Duration::from_secs(7 * 24 * 60 * 60 + 1));
        let report = monitor.monitor(1001).await.unwrap();
        assert_eq!(report.batches_finalized, 1);

        let stored = h.store.get_batch(1001, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Finalized);
        let state = h.store.get_transaction_state(1).await.unwrap().unwrap();
        assert_eq!(state.status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn both_transitions_can_happen_in_one_run() {
        let h = Harness::new(1001).await;
        let mut old = batch(1001, 3);
        old.posted_at = h.clock.now() - ChronoDuration::days(8);
        h.persist_batch(old).await;
        h.set_latest_confirmed(3);

        let report = monitor(&h).monitor(1001).await.unwrap();
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(report.batches_finalized, 1);
        assert_eq!(report.batches_updated, 2);
        let stored = h.store.get_batch(1001, 3).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Finalized);
        assert!(stored.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn rpc_failure_still_finalizes_by_age() {
        let h = Harness::new(1001).await;
        let mut confirmed = batch(1001, 1);
        confirmed.status = BatchStatus::Confirmed;
        confirmed.confirmed_at = Some(h.clock.now());
        confirmed.posted_at = h.clock.now() - ChronoDuration::days(10);
        h.persist_batch(confirmed).await;
        h.persist_batch(batch(1001, 2)).await;
        h.rpc.fail_calls_with(Some("502 Bad Gateway"));

        let report = monitor(&h).monitor(1001).await.unwrap();
        assert_eq!(report.latest_confirmed, None);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.batches_finalized, 1);
        let pending = h.store.get_batch(1001, 2).await.unwrap().unwrap();
        assert_eq!(pending.status, BatchStatus::Pending);
    }

    #[tokio::test]
    async fn rerun_is_a_no_op() {
        let h = Harness::new(1001).await;
        h.persist_batch(batch(1001, 5)).await;
        h.set_latest_confirmed(9);
        let monitor = monitor(&h);

        assert_eq!(monitor.monitor(1001).await.unwrap().batches_updated, 1);
        let again = monitor.monitor(1001).await.unwrap();
        assert_eq!(again.batches_updated, 0);
        assert_eq!(again.transactions_updated, 0);
        assert_eq!(
            h.metrics
                .batch_status_transitions
                .with_label_values(&["1001", "confirmed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn finalization_requires_age_past_the_window() {
        let h = Harness::new(1001).await;
        let mut confirmed = batch(1001, 0);
        confirmed.status = BatchStatus::Confirmed;
        confirmed.confirmed_at = Some(h.clock.now());
        confirmed.posted_at = h.clock.now();
        h.persist_batch(confirmed).await;
        let monitor = monitor(&h);

        h.clock.advance(h.chain.finalization_window());
        let report = monitor.monitor(1001).await.unwrap();
        assert_eq!(report.batches_finalized, 0);
        let stored = h.store.get_batch(1001, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Confirmed);

        h.clock.advance(Duration::from_secs(1));
        let report = monitor.monitor(1001).await.unwrap();
        assert_eq!(report.batches_finalized, 1);
        let stored = h.store.get_batch(1001, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Finalized);
    }

    #[tokio::test]
    async fn recent_confirmed_batches_do_not_starve_pending_ones() {
        let h = Harness::new(1001).await;
        for sequence_number in 0..2 {
            let mut confirmed = batch(1001, sequence_number);
            confirmed.status = BatchStatus::Confirmed;
            confirmed.confirmed_at = Some(h.clock.now());
            h.persist_batch(confirmed).await;
        }
        h.persist_batch(batch(1001, 2)).await;
        sequenced_state(&h, 9, 2).await;
        h.set_latest_confirmed(5);
        let monitor = BatchMonitor::new(
            h.registry.clone(),
            h.clock.clone(),
            MonitorConfig {
                max_batches_per_run: 2,
            },
            Some(h.metrics.clone()),
        );

        let report = monitor.monitor(1001).await.unwrap();
        assert_eq!(report.batches_confirmed, 1);
        assert_eq!(report.batches_checked, 1);
        let stored = h.store.get_batch(1001, 2).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::Confirmed);
        let state = h.store.get_transaction_state(9).await.unwrap().unwrap();
        assert_eq!(state.status, TxStatus::Posted);
    }
}
