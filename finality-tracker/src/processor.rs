// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction finality state machine.
//!
//! Each invocation re-reads the stored state, validates the chain's
//! contracts and then walks forward as far as the persisted batch data
//! allows:
//!
//! ```text
//! SUBMITTED -> SEQUENCED -> POSTED -> CONFIRMED -> FINALIZED
//!      \___________\___________\__________\______-> FAILED
//! ```
//!
//! Transient failures leave the stored state untouched so the job queue can
//! retry later. State timeouts and non-retryable errors are persisted as
//! `FAILED` with the error message as the reason.

use crate::chains::{ChainRegistry, ChainRuntime};
use crate::discovery::BatchDiscovery;
use crate::lookup::TransactionLookup;
use crate::store::FinalityStore;
use crate::validation::ContractValidator;
use orbit_finality_core::clock::elapsed_between;
use orbit_finality_core::duration_secs;
use orbit_finality_core::types::{
    Batch, BatchStatus, MatchMethod, StateEvidence, TrackedTransaction, TransactionState, TxStatus,
};
use orbit_finality_core::{Clock, FinalityError, FinalityMetrics, FinalityResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    #[serde(with = "duration_secs")]
    pub sequencing_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub posting_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub confirmation_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub finalization_timeout: Duration,
    /// Upper bound on an inline discovery run triggered by an unmatched
    /// transaction.
    #[serde(with = "duration_secs")]
    pub eager_discovery_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sequencing_timeout: Duration::from_secs(10 * 60),
            posting_timeout: Duration::from_secs(60 * 60),
            confirmation_timeout: Duration::from_secs(7 * DAY),
            finalization_timeout: Duration::from_secs(7 * DAY),
            eager_discovery_timeout: Duration::from_secs(30),
        }
    }
}

impl ProcessorConfig {
    fn timeout_for(&self, status: TxStatus) -> Option<(Duration, &'static str)> {
        match status {
            TxStatus::Submitted => Some((self.sequencing_timeout, "sequenced")),
            TxStatus::Sequenced => Some((self.posting_timeout, "posted")),
            TxStatus::Posted => Some((self.confirmation_timeout, "confirmed")),
            TxStatus::Confirmed => Some((self.finalization_timeout, "finalized")),
            TxStatus::Finalized | TxStatus::Failed => None,
        }
    }
}

/// Result of one `processTransaction` job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessOutcome {
    pub transaction_id: u64,
    pub previous_status: TxStatus,
    pub status: TxStatus,
    pub changed: bool,
    pub message: String,
    pub state: TransactionState,
}

pub struct TransactionProcessor {
    registry: Arc<ChainRegistry>,
    store: Arc<dyn FinalityStore>,
    lookup: Arc<dyn TransactionLookup>,
    discovery: Arc<BatchDiscovery>,
    validator: Arc<ContractValidator>,
    clock: Arc<dyn Clock>,
    config: ProcessorConfig,
    metrics: Option<Arc<FinalityMetrics>>,
}

impl std::fmt::Debug for TransactionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TransactionProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ChainRegistry>,
        lookup: Arc<dyn TransactionLookup>,
        discovery: Arc<BatchDiscovery>,
        validator: Arc<ContractValidator>,
        clock: Arc<dyn Clock>,
        config: ProcessorConfig,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            store: registry.store().clone(),
            registry,
            lookup,
            discovery,
            validator,
            clock,
            config,
            metrics,
        }
    }

    pub async fn process(&self, transaction_id: u64) -> FinalityResult<ProcessOutcome> {
        let tx = self
            .lookup
            .transaction(transaction_id)
            .await?
            .ok_or_else(|| {
                FinalityError::Validation(format!("transaction {} not found", transaction_id))
            })?;
        let runtime = self.registry.runtime(tx.chain_id).await?;
        self.validator.ensure_valid(&runtime).await?;

        let stored = self
            .store
            .create_transaction_state(&TransactionState::submitted(&tx))
            .await?;
        let previous = stored.status;
        if previous.is_terminal() {
            return Ok(self.outcome(previous, stored, "already terminal".into()));
        }

        let mut state = stored;
        let mut steps = Vec::new();
        loop {
            let from = state.status;
            match self.check(&runtime, &tx, &state).await {
                Ok(Some(evidence)) => {
                    state.advance(evidence, self.clock.now())?;
                    steps.push((from, state.status));
                    if state.status.is_terminal() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_transient() || matches!(e, FinalityError::Store(_)) => {
                    self.record_error(&e);
                    if steps.is_empty() {
                        warn!(
                            "[Processor] Transaction {} left in {}: {}",
                            transaction_id, from, e
                        );
                        return Err(e);
                    }
                    warn!(
                        "[Processor] Transaction {} stopped at {} after progress: {}",
                        transaction_id, from, e
                    );
                    break;
                }
                Err(e) => {
                    self.record_error(&e);
                    warn!("[Processor] Transaction {} failed in {}: {}", transaction_id, from, e);
                    state.fail(e.to_string(), self.clock.now())?;
                    steps.push((from, TxStatus::Failed));
                    break;
                }
            }
        }

        if steps.is_empty() {
            debug!("[Processor] Transaction {} remains {}", transaction_id, previous);
            return Ok(self.outcome(previous, state, format!("still {}", previous)));
        }

        if !self.store.save_transaction_state(&state, previous).await? {
            // Another writer moved the state since we read it.
            let current = self
                .store
                .get_transaction_state(transaction_id)
                .await?
                .unwrap_or(state);
            info!(
                "[Processor] Transaction {} was updated concurrently, now {}",
                transaction_id, current.status
            );
            return Ok(self.outcome(previous, current, "updated concurrently".into()));
        }

        if let Some(m) = &self.metrics {
            for (from, to) in &steps {
                m.transaction_transitions
                    .with_label_values(&[from.as_str(), to.as_str()])
                    .inc();
            }
        }
        let message = match &state.failure_reason {
            Some(reason) => format!("{} -> FAILED: {}", previous, reason),
            None => format!("{} -> {}", previous, state.status),
        };
        info!("[Processor] Transaction {}: {}", transaction_id, message);
        Ok(self.outcome(previous, state, message))
    }

    async fn check(
        &self,
        runtime: &ChainRuntime,
        tx: &TrackedTransaction,
        state: &TransactionState,
    ) -> FinalityResult<Option<StateEvidence>> {
        let evidence = match state.status {
            TxStatus::Submitted => self.check_sequenced(tx).await?,
            TxStatus::Sequenced => {
                let batch = self.matched_batch(state).await?;
                (batch.status >= BatchStatus::Confirmed).then(|| StateEvidence::Posted {
                    batch_sequence_number: batch.sequence_number,
                    batch_confirmed_at: batch.confirmed_at,
                })
            }
            TxStatus::Posted => {
                let batch = self.matched_batch(state).await?;
                (batch.status == BatchStatus::Finalized).then(|| StateEvidence::Confirmed {
                    batch_sequence_number: batch.sequence_number,
                    batch_finalized_at: batch.finalized_at,
                })
            }
            TxStatus::Confirmed => {
                let batch = self.matched_batch(state).await?;
                let challenge_period = runtime.config.challenge_period();
                let since = batch
                    .confirmed_at
                    .or(state.confirmed_at)
                    .unwrap_or(batch.posted_at);
                (elapsed_between(since, self.clock.now()) >= challenge_period).then(|| {
                    StateEvidence::Finalized {
                        challenge_period_secs: challenge_period.as_secs(),
                    }
                })
            }
            TxStatus::Finalized | TxStatus::Failed => None,
        };
        if evidence.is_some() {
            return Ok(evidence);
        }
        self.check_timeout(state)?;
        Ok(None)
    }

    /// Looks for the batch carrying `tx`, running discovery inline when the
    /// chain's counter is ahead of what has been persisted.
    async fn check_sequenced(&self, tx: &TrackedTransaction) -> FinalityResult<Option<StateEvidence>> {
        if let Some(evidence) = self.match_batch(tx).await? {
            return Ok(Some(evidence));
        }
        if !self.discovery.is_behind(tx.chain_id).await? {
            return Ok(None);
        }

        info!(
            "[Processor] Transaction {} unmatched and chain {} is behind, running discovery",
            tx.id, tx.chain_id
        );
        match tokio::time::timeout(
            self.config.eager_discovery_timeout,
            self.discovery.discover(tx.chain_id),
        )
        .await
        {
            Ok(Ok(report)) => debug!(
                "[Processor] Inline discovery indexed {} batches for chain {}",
                report.batches_indexed, tx.chain_id
            ),
            Ok(Err(e)) => warn!("[Processor] Inline discovery for chain {} failed: {}", tx.chain_id, e),
            Err(_) => warn!(
                "[Processor] Inline discovery for chain {} exceeded {:?}",
                tx.chain_id, self.config.eager_discovery_timeout
            ),
        }
        self.match_batch(tx).await
    }

    async fn match_batch(&self, tx: &TrackedTransaction) -> FinalityResult<Option<StateEvidence>> {
        let sequenced = |batch: Batch, matched_by| StateEvidence::Sequenced {
            batch_sequence_number: batch.sequence_number,
            parent_tx_hash: batch.parent_tx_hash,
            parent_block_number: batch.parent_block_number,
            matched_by,
        };

        if let Some(batch) = self
            .store
            .find_batch_covering_block(tx.chain_id, tx.block_number)
            .await?
        {
            return Ok(Some(sequenced(batch, MatchMethod::BlockRange)));
        }
        // A batch with a known block range that misses the block is not a match.
        Ok(self
            .store
            .first_batch_posted_since(tx.chain_id, tx.timestamp)
            .await?
            .filter(|batch| batch.covers_child_block(tx.block_number) != Some(false))
            .map(|batch| sequenced(batch, MatchMethod::Timestamp)))
    }

    async fn matched_batch(&self, state: &TransactionState) -> FinalityResult<Batch> {
        let sequence_number = state.batch_sequence_number.ok_or_else(|| {
            FinalityError::Internal(format!(
                "transaction {} is {} without a batch",
                state.transaction_id, state.status
            ))
        })?;
        self.store
            .get_batch(state.chain_id, sequence_number)
            .await?
            .ok_or_else(|| {
                FinalityError::Internal(format!(
                    "batch {} of chain {} is no longer stored",
                    sequence_number, state.chain_id
                ))
            })
    }

    fn check_timeout(&self, state: &TransactionState) -> FinalityResult<()> {
        let Some((timeout, next)) = self.config.timeout_for(state.status) else {
            return Ok(());
        };
        if elapsed_between(state.current_state_entered_at(), self.clock.now()) > timeout {
            return Err(FinalityError::Timeout(format!(
                "not {} within timeout of {}s",
                next,
                timeout.as_secs()
            )));
        }
        Ok(())
    }

    fn record_error(&self, error: &FinalityError) {
        if let Some(m) = &self.metrics {
            m.processor_errors
                .with_label_values(&[error.error_type()])
                .inc();
        }
    }

    fn outcome(&self, previous: TxStatus, state: TransactionState, message: String) -> ProcessOutcome {
        ProcessOutcome {
            transaction_id: state.transaction_id,
            previous_status: previous,
            status: state.status,
            changed: previous != state.status,
            message,
            state,
        }
    }
}
