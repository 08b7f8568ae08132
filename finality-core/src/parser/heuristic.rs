// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Last-resort byte-pattern scan for payloads no structured format accepts.
//!
//! Output is advisory: counts may be high or low for any given batch.

use super::ParsedBlock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const WORD: usize = 32;
/// Largest value accepted as a plausible block number.
const MAX_BLOCK_NUMBER: u64 = 1 << 40;
/// Largest value accepted as a plausible per-block transaction count.
const MAX_TXS_PER_BLOCK: u64 = 10_000;
const MIN_DISTINCT_HASH_BYTES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Selector,
    Address,
    Hash,
    BlockHeader { number: u64, transaction_count: u64 },
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct HeuristicReport {
    /// Hits keyed by offset; one hit per offset.
    pub hits: BTreeMap<usize, PatternKind>,
    pub truncated: bool,
}

impl HeuristicReport {
    fn count(&self, pred: impl Fn(&PatternKind) -> bool) -> u64 {
        self.hits.values().filter(|k| pred(k)).count() as u64
    }

    pub fn selectors(&self) -> u64 {
        self.count(|k| matches!(k, PatternKind::Selector))
    }

    pub fn addresses(&self) -> u64 {
        self.count(|k| matches!(k, PatternKind::Address))
    }

    pub fn hashes(&self) -> u64 {
        self.count(|k| matches!(k, PatternKind::Hash))
    }

    pub fn blocks(&self) -> Vec<ParsedBlock> {
        self.hits
            .iter()
            .filter_map(|(offset, kind)| match kind {
                PatternKind::BlockHeader {
                    number,
                    transaction_count,
                } => Some(ParsedBlock {
                    offset: *offset as u64,
                    number: Some(*number),
                    transaction_count: *transaction_count,
                }),
                _ => None,
            })
            .collect()
    }

    /// Larger of selector hits and the summed block-header counts.
    pub fn transaction_estimate(&self) -> u64 {
        let from_blocks: u64 = self.blocks().iter().map(|b| b.transaction_count).sum();
        self.selectors().max(from_blocks)
    }
}

struct Collector {
    report: HeuristicReport,
    max_hits: usize,
}

impl Collector {
    /// Returns false once the cap is reached.
    fn record(&mut self, offset: usize, kind: PatternKind) -> bool {
        if self.report.hits.len() >= self.max_hits {
            self.report.truncated = true;
            return false;
        }
        self.report.hits.entry(offset).or_insert(kind);
        true
    }
}

fn leading_zeros(word: &[u8]) -> usize {
    word.iter().take_while(|b| **b == 0).count()
}

fn word_value(word: &[u8]) -> Option<u64> {
    if leading_zeros(word) < WORD - 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[WORD - 8..]);
    Some(u64::from_be_bytes(buf))
}

fn looks_like_address_word(word: &[u8]) -> bool {
    word[..12].iter().all(|b| *b == 0) && word[12..].iter().filter(|b| **b != 0).count() >= 10
}

fn looks_like_hash(word: &[u8]) -> bool {
    let mut seen = [false; 256];
    let mut distinct = 0;
    for b in word {
        if !seen[*b as usize] {
            seen[*b as usize] = true;
            distinct += 1;
        }
    }
    distinct >= MIN_DISTINCT_HASH_BYTES && !word.windows(4).any(|w| w == [0, 0, 0, 0])
}

fn block_header_at(data: &[u8], offset: usize) -> Option<PatternKind> {
    let number = word_value(data.get(offset..offset + WORD)?)?;
    let count = word_value(data.get(offset + WORD..offset + 2 * WORD)?)?;
    ((1..=MAX_BLOCK_NUMBER).contains(&number) && (1..=MAX_TXS_PER_BLOCK).contains(&count)).then_some(
        PatternKind::BlockHeader {
            number,
            transaction_count: count,
        },
    )
}

/// Scans `data` for selector-, address-, hash- and header-shaped runs,
/// stopping after `max_hits` distinct offsets.
pub fn scan(data: &[u8], max_hits: usize) -> HeuristicReport {
    let mut collector = Collector {
        report: HeuristicReport::default(),
        max_hits,
    };

    // ABI-style call: four non-zero selector bytes followed by a left-padded word.
    for offset in 0..data.len().saturating_sub(4 + WORD - 1) {
        let selector = &data[offset..offset + 4];
        let word = &data[offset + 4..offset + 4 + WORD];
        if selector.iter().all(|b| *b != 0)
            && leading_zeros(word) >= 12
            && leading_zeros(word) < WORD
            && !collector.record(offset, PatternKind::Selector)
        {
            return collector.report;
        }
    }

    let mut offset = 0;
    while offset + WORD <= data.len() {
        let word = &data[offset..offset + WORD];
        let kind = if let Some(header) = block_header_at(data, offset) {
            Some(header)
        } else if looks_like_address_word(word) {
            Some(PatternKind::Address)
        } else if looks_like_hash(word) {
            Some(PatternKind::Hash)
        } else {
            None
        };
        if let Some(kind) = kind {
            if !collector.record(offset, kind) {
                break;
            }
        }
        offset += WORD;
    }
    collector.report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(value: u64) -> Vec<u8> {
        let mut w = vec![0u8; WORD];
        w[WORD - 8..].copy_from_slice(&value.to_be_bytes());
        w
    }

    #[test]
    fn empty_and_tiny_inputs_have_no_hits() {
        assert!(scan(&[], 1000).hits.is_empty());
        assert!(scan(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 1000).hits.is_empty());
    }

    #[test]
    fn finds_block_headers() {
        let mut data = word(123_456);
        data.extend(word(7));
        let report = scan(&data, 1000);
        let blocks = report.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].number, Some(123_456));
        assert_eq!(report.transaction_estimate(), 7);
    }

    #[test]
    fn finds_selectors_and_addresses() {
        let mut data = vec![0xa9, 0x05, 0x9c, 0xbb];
        let mut addr = vec![0u8; 12];
        addr.extend((1..=20u8).collect::<Vec<_>>());
        data.extend(&addr);
        let report = scan(&data, 1000);
        assert_eq!(report.selectors(), 1);
        assert_eq!(report.transaction_estimate(), 1);
    }

    #[test]
    fn hashes_are_detected_on_word_boundaries() {
        let hash: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(37).wrapping_add(11)).collect();
        let report = scan(&hash, 1000);
        assert_eq!(report.hashes(), 1);
    }

    #[test]
    fn caps_hits() {
        let mut data = Vec::new();
        for i in 0..50u64 {
            data.extend(word(1000 + i));
            data.extend(word(1));
        }
        let report = scan(&data, 10);
        assert_eq!(report.hits.len(), 10);
        assert!(report.truncated);
    }
}
