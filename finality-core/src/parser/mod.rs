// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Best-effort decoding of batch payloads.
//!
//! `BatchParser::parse` never fails. When a payload cannot be decoded the
//! result carries `transaction_count_estimate = 0` and
//! `metadata.parse_error`, and the caller still persists the batch.

pub mod compression;
pub mod heuristic;
pub mod strategies;

#[cfg(test)]
mod tests;

use crate::metrics::FinalityMetrics;
use crate::types::{BlockRange, DataLocation};
use compression::Compression;
use ethers::types::H256;
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use strategies::{BatchFormatStrategy, DecodedBatch, PreparedPayload};
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParserLimits {
    pub max_decompressed_bytes: usize,
    pub max_segments: usize,
    pub max_pattern_hits: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_decompressed_bytes: 16 * 1024 * 1024,
            max_segments: 100_000,
            max_pattern_hits: 1000,
        }
    }
}

/// Identifies the batch being parsed, for diagnostics only.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseContext {
    pub chain_id: u64,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsedTxKind {
    Signed,
    Unsigned,
    Delayed,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTransaction {
    pub offset: u64,
    pub kind: ParsedTxKind,
    pub hash: Option<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedBlock {
    pub offset: u64,
    pub number: Option<u64>,
    pub transaction_count: u64,
}

/// Format-specific findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FormatDetails {
    Segments {
        segments: u64,
        l2_messages: u64,
        delayed_messages: u64,
        timestamp_advances: u64,
        l1_block_advances: u64,
    },
    DasCertificate {
        flag: u8,
        tree: bool,
        keyset_hash: H256,
        data_hash: H256,
        timeout: u64,
    },
    BlobHashes {
        hashes: Vec<H256>,
    },
    Heuristic {
        selectors: u64,
        addresses: u64,
        hashes: u64,
        block_headers: u64,
        truncated: bool,
    },
}

/// Parse diagnostics persisted with the batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseMetadata {
    /// Which decoder produced the result
    #[serde(default)]
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_flag: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<Compression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decompressed_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entropy: Option<f64>,
    /// Payload held off-chain; only its reference was inspected
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<FormatDetails>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub transaction_count_estimate: u64,
    pub batch_size_bytes: u64,
    pub data_hash: H256,
    pub transactions: Vec<ParsedTransaction>,
    pub blocks: Vec<ParsedBlock>,
    /// Number of child blocks the payload carries, when known
    pub block_count: Option<u64>,
    pub metadata: ParseMetadata,
}

impl ParseResult {
    fn new(raw: &[u8]) -> Self {
        Self {
            transaction_count_estimate: 0,
            batch_size_bytes: raw.len() as u64,
            data_hash: H256::from(keccak256(raw)),
            transactions: Vec::new(),
            blocks: Vec::new(),
            block_count: None,
            metadata: ParseMetadata::default(),
        }
    }

    /// Output of the pattern scan rather than a decoder. Its block headers
    /// are advisory and never define a child block range.
    pub fn is_heuristic(&self) -> bool {
        self.metadata.format == "heuristic"
    }

    /// Child block range implied by numbered block headers, if any.
    pub fn child_block_range(&self) -> Option<BlockRange> {
        if self.is_heuristic() {
            return None;
        }
        let numbers = self.blocks.iter().filter_map(|b| b.number);
        let first = numbers.clone().min()?;
        let last = numbers.max()?;
        Some(BlockRange { first, last })
    }

    fn apply(&mut self, decoded: DecodedBatch, format: &str) {
        self.transaction_count_estimate = decoded.transaction_count;
        self.transactions = decoded.transactions;
        self.block_count = Some(decoded.block_count).filter(|c| *c > 0);
        self.metadata.format = format.to_string();
        self.metadata.limited = decoded.offchain;
        self.metadata.details = Some(decoded.details);
    }

    fn degrade(&mut self, reason: String) {
        self.transaction_count_estimate = 0;
        self.transactions.clear();
        self.blocks.clear();
        self.block_count = None;
        if self.metadata.format.is_empty() {
            self.metadata.format = "degraded".to_string();
        }
        self.metadata.parse_error = Some(reason);
    }
}

pub struct BatchParser {
    strategies: Vec<Box<dyn BatchFormatStrategy>>,
    limits: ParserLimits,
    metrics: Option<Arc<FinalityMetrics>>,
}

impl std::fmt::Debug for BatchParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchParser")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("limits", &self.limits)
            .finish()
    }
}

impl Default for BatchParser {
    fn default() -> Self {
        Self::new(ParserLimits::default(), None)
    }
}

impl BatchParser {
    pub fn new(limits: ParserLimits, metrics: Option<Arc<FinalityMetrics>>) -> Self {
        Self::with_strategies(strategies::default_strategies(), limits, metrics)
    }

    pub fn with_strategies(
        strategies: Vec<Box<dyn BatchFormatStrategy>>,
        limits: ParserLimits,
        metrics: Option<Arc<FinalityMetrics>>,
    ) -> Self {
        Self {
            strategies,
            limits,
            metrics,
        }
    }

    /// Parses a `0x`-prefixed (or bare) hex payload.
    pub fn parse_hex(&self, raw: &str, location: DataLocation, ctx: &ParseContext) -> ParseResult {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        match hex::decode(digits) {
            Ok(bytes) => self.parse(&bytes, location, ctx),
            Err(e) => {
                let mut result = ParseResult::new(trimmed.as_bytes());
                result.degrade(format!("invalid hex payload: {}", e));
                self.record_degradation(ctx, "invalid_hex", &result);
                result
            }
        }
    }

    pub fn parse(&self, raw: &[u8], location: DataLocation, ctx: &ParseContext) -> ParseResult {
        let mut result = ParseResult::new(raw);
        result.metadata.header_flag = raw.first().copied();
        if raw.is_empty() {
            result.metadata.format = "empty".to_string();
            return result;
        }

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            if location == DataLocation::Onchain {
                self.decode_onchain(raw, &mut result)
            } else {
                self.describe_offchain(raw, location, &mut result);
                Ok(())
            }
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                result.degrade(reason);
                self.record_degradation(ctx, "decompression", &result);
            }
            Err(_) => {
                result.degrade("parser panicked".to_string());
                self.record_degradation(ctx, "panic", &result);
            }
        }
        debug!(
            "[Parser] chain {} batch {}: format={} txs={} size={}",
            ctx.chain_id,
            ctx.sequence_number,
            result.metadata.format,
            result.transaction_count_estimate,
            result.batch_size_bytes
        );
        result
    }

    /// Only the reference is inspected; no off-chain data is fetched.
    fn describe_offchain(&self, raw: &[u8], location: DataLocation, result: &mut ParseResult) {
        result.metadata.limited = true;
        result.metadata.format = location.to_string();
        let prepared = PreparedPayload {
            raw,
            compression: None,
            body: Cow::Borrowed(raw),
        };
        for strategy in &self.strategies {
            if !strategy.recognizes(&prepared) {
                continue;
            }
            if let Ok(decoded) = strategy.decode(&prepared, &self.limits) {
                if decoded.offchain {
                    result.metadata.details = Some(decoded.details);
                    return;
                }
            }
        }
    }

    fn decode_onchain(&self, raw: &[u8], result: &mut ParseResult) -> Result<(), String> {
        let detection = compression::detect(raw);
        result.metadata.entropy = Some(detection.entropy);
        let by_magic = detection.candidates.len() == 1;

        let mut prepared = PreparedPayload {
            raw,
            compression: None,
            body: Cow::Borrowed(raw),
        };
        let mut failures = Vec::new();
        for algo in &detection.candidates {
            match algo.decompress(&raw[detection.body_offset..], self.limits.max_decompressed_bytes) {
                Ok(body) => {
                    result.metadata.compression = Some(*algo);
                    result.metadata.decompressed_size = Some(body.len() as u64);
                    prepared.compression = Some(*algo);
                    prepared.body = Cow::Owned(body);
                    break;
                }
                Err(e) => failures.push(format!("{}: {}", algo, e)),
            }
        }
        if prepared.compression.is_none() && !detection.candidates.is_empty() {
            let reason = format!("decompression failed ({})", failures.join("; "));
            if by_magic {
                return Err(reason);
            }
            result.metadata.fallback_reasons.push(reason);
        }

        for strategy in &self.strategies {
            if !strategy.recognizes(&prepared) {
                continue;
            }
            match strategy.decode(&prepared, &self.limits) {
                Ok(decoded) => {
                    result.apply(decoded, strategy.name());
                    return Ok(());
                }
                Err(e) => {
                    debug!("[Parser] {} strategy rejected payload: {}", strategy.name(), e);
                    result
                        .metadata
                        .fallback_reasons
                        .push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        let report = heuristic::scan(&prepared.body, self.limits.max_pattern_hits);
        if report.truncated {
            warn!(
                "[Parser] heuristic scan capped at {} hits",
                self.limits.max_pattern_hits
            );
        }
        result.transaction_count_estimate = report.transaction_estimate();
        result.blocks = report.blocks();
        result.transactions = report
            .hits
            .iter()
            .filter(|(_, kind)| matches!(kind, heuristic::PatternKind::Selector))
            .map(|(offset, _)| ParsedTransaction {
                offset: *offset as u64,
                kind: ParsedTxKind::Pattern,
                hash: None,
            })
            .collect();
        result.metadata.format = "heuristic".to_string();
        result.metadata.details = Some(FormatDetails::Heuristic {
            selectors: report.selectors(),
            addresses: report.addresses(),
            hashes: report.hashes(),
            block_headers: result.blocks.len() as u64,
            truncated: report.truncated,
        });
        Ok(())
    }

    fn record_degradation(&self, ctx: &ParseContext, reason: &str, result: &ParseResult) {
        warn!(
            "[Parser] chain {} batch {} degraded: {}",
            ctx.chain_id,
            ctx.sequence_number,
            result.metadata.parse_error.as_deref().unwrap_or(reason)
        );
        if let Some(m) = &self.metrics {
            m.parser_degradations.with_label_values(&[reason]).inc();
        }
    }
}
