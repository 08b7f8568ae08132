// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Structured batch formats, tried in order before the heuristic scan.

use super::compression::{Compression, BROTLI_HEADER_FLAG};
use super::{FormatDetails, ParsedTransaction, ParsedTxKind, ParserLimits};
use ethers::types::H256;
use ethers::utils::keccak256;
use ethers::utils::rlp::Rlp;
use thiserror::Error;

pub const DAS_HEADER_FLAG: u8 = 0x80;
pub const DAS_TREE_FLAG: u8 = 0x08;
pub const BLOB_HASHES_HEADER_FLAG: u8 = 0x50;

const SEGMENT_L2_MESSAGE: u8 = 0;
const SEGMENT_L2_MESSAGE_BROTLI: u8 = 1;
const SEGMENT_DELAYED_MESSAGES: u8 = 2;
const SEGMENT_ADVANCE_TIMESTAMP: u8 = 3;
const SEGMENT_ADVANCE_L1_BLOCK: u8 = 4;

const L2_KIND_UNSIGNED_TX: u8 = 0;
const L2_KIND_CONTRACT_TX: u8 = 1;
const L2_KIND_BATCH: u8 = 3;
const L2_KIND_SIGNED_TX: u8 = 4;
const L2_KIND_SIGNED_COMPRESSED_TX: u8 = 7;

const MAX_NESTING: usize = 16;
/// keyset hash + data hash + timeout
const DAS_CERT_MIN_BODY: usize = 32 + 32 + 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StrategyError {
    #[error("truncated at offset {0}")]
    Truncated(usize),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("limit exceeded: {0}")]
    Limit(String),
}

/// Payload after header inspection and decompression.
#[derive(Debug, Clone)]
pub struct PreparedPayload<'a> {
    pub raw: &'a [u8],
    pub compression: Option<Compression>,
    /// Decompressed bytes, or `raw` itself when nothing was decompressed
    pub body: std::borrow::Cow<'a, [u8]>,
}

impl PreparedPayload<'_> {
    pub fn header(&self) -> Option<u8> {
        self.raw.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    pub transaction_count: u64,
    pub block_count: u64,
    pub transactions: Vec<ParsedTransaction>,
    pub details: FormatDetails,
    /// The payload only references data held elsewhere.
    pub offchain: bool,
}

/// One recognisable batch encoding.
pub trait BatchFormatStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognizes(&self, payload: &PreparedPayload<'_>) -> bool;

    fn decode(
        &self,
        payload: &PreparedPayload<'_>,
        limits: &ParserLimits,
    ) -> Result<DecodedBatch, StrategyError>;
}

pub fn default_strategies() -> Vec<Box<dyn BatchFormatStrategy>> {
    vec![
        Box::new(SegmentStream),
        Box::new(DasCertificate),
        Box::new(BlobHashes),
    ]
}

/// Brotli-compressed stream of RLP-framed segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmentStream;

#[derive(Debug, Default)]
struct SegmentTally {
    segments: u64,
    l2_messages: u64,
    delayed_messages: u64,
    timestamp_advances: u64,
    l1_block_advances: u64,
    transactions: Vec<ParsedTransaction>,
}

impl BatchFormatStrategy for SegmentStream {
    fn name(&self) -> &'static str {
        "segments"
    }

    fn recognizes(&self, payload: &PreparedPayload<'_>) -> bool {
        match payload.compression {
            Some(_) => true,
            None => payload.header() == Some(BROTLI_HEADER_FLAG),
        }
    }

    fn decode(
        &self,
        payload: &PreparedPayload<'_>,
        limits: &ParserLimits,
    ) -> Result<DecodedBatch, StrategyError> {
        let body = payload.body.as_ref();
        let mut tally = SegmentTally::default();
        let mut offset = 0usize;
        while offset < body.len() {
            if tally.segments as usize >= limits.max_segments {
                return Err(StrategyError::Limit(format!(
                    "more than {} segments",
                    limits.max_segments
                )));
            }
            let item = Rlp::new(&body[offset..]);
            let info = item
                .payload_info()
                .map_err(|_| StrategyError::Truncated(offset))?;
            let total = info.header_len + info.value_len;
            if total == 0 || offset + total > body.len() || !item.is_data() {
                return Err(StrategyError::Truncated(offset));
            }
            let segment = item
                .data()
                .map_err(|e| StrategyError::Malformed(format!("segment at {}: {}", offset, e)))?;
            let (kind, content) = segment
                .split_first()
                .ok_or_else(|| StrategyError::Malformed(format!("empty segment at {}", offset)))?;
            let content_offset = offset + info.header_len + 1;
            match *kind {
                SEGMENT_L2_MESSAGE => {
                    tally.l2_messages += 1;
                    count_l2_message(content, content_offset, 0, &mut tally.transactions)?;
                }
                SEGMENT_L2_MESSAGE_BROTLI => {
                    tally.l2_messages += 1;
                    let inner = Compression::Brotli
                        .decompress(content, limits.max_decompressed_bytes)
                        .map_err(|e| StrategyError::Malformed(e.to_string()))?;
                    count_l2_message(&inner, content_offset, 0, &mut tally.transactions)?;
                }
                SEGMENT_DELAYED_MESSAGES => {
                    tally.delayed_messages += 1;
                    tally.transactions.push(ParsedTransaction {
                        offset: content_offset as u64,
                        kind: ParsedTxKind::Delayed,
                        hash: None,
                    });
                }
                SEGMENT_ADVANCE_TIMESTAMP => tally.timestamp_advances += 1,
                SEGMENT_ADVANCE_L1_BLOCK => tally.l1_block_advances += 1,
                other => {
                    return Err(StrategyError::Malformed(format!(
                        "unknown segment kind {} at {}",
                        other, offset
                    )))
                }
            }
            tally.segments += 1;
            offset += total;
        }
        if tally.segments == 0 {
            return Err(StrategyError::Malformed("no segments".into()));
        }

        Ok(DecodedBatch {
            transaction_count: tally.transactions.len() as u64,
            block_count: tally.l2_messages + tally.delayed_messages,
            details: FormatDetails::Segments {
                segments: tally.segments,
                l2_messages: tally.l2_messages,
                delayed_messages: tally.delayed_messages,
                timestamp_advances: tally.timestamp_advances,
                l1_block_advances: tally.l1_block_advances,
            },
            transactions: tally.transactions,
            offchain: false,
        })
    }
}

fn count_l2_message(
    message: &[u8],
    offset: usize,
    depth: usize,
    out: &mut Vec<ParsedTransaction>,
) -> Result<(), StrategyError> {
    if depth > MAX_NESTING {
        return Err(StrategyError::Limit(format!("nesting deeper than {}", MAX_NESTING)));
    }
    let Some((kind, rest)) = message.split_first() else {
        return Ok(());
    };
    match *kind {
        L2_KIND_SIGNED_TX => out.push(ParsedTransaction {
            offset: offset as u64,
            kind: ParsedTxKind::Signed,
            hash: Some(H256::from(keccak256(rest))),
        }),
        L2_KIND_SIGNED_COMPRESSED_TX => out.push(ParsedTransaction {
            offset: offset as u64,
            kind: ParsedTxKind::Signed,
            hash: None,
        }),
        L2_KIND_UNSIGNED_TX | L2_KIND_CONTRACT_TX => out.push(ParsedTransaction {
            offset: offset as u64,
            kind: ParsedTxKind::Unsigned,
            hash: None,
        }),
        L2_KIND_BATCH => {
            let mut cursor = 0usize;
            while cursor < rest.len() {
                let len_bytes = rest
                    .get(cursor..cursor + 8)
                    .ok_or(StrategyError::Truncated(offset + 1 + cursor))?;
                let mut len = [0u8; 8];
                len.copy_from_slice(len_bytes);
                let len = usize::try_from(u64::from_be_bytes(len))
                    .map_err(|_| StrategyError::Malformed("nested length overflow".into()))?;
                let start = cursor + 8;
                let end = start
                    .checked_add(len)
                    .filter(|end| *end <= rest.len())
                    .ok_or(StrategyError::Truncated(offset + 1 + cursor))?;
                count_l2_message(&rest[start..end], offset + 1 + start, depth + 1, out)?;
                cursor = end;
            }
        }
        // heartbeats, non-mutating calls and unknown kinds carry no transaction
        _ => {}
    }
    Ok(())
}

/// AnyTrust data availability certificate.
#[derive(Debug, Clone, Copy)]
pub struct DasCertificate;

impl BatchFormatStrategy for DasCertificate {
    fn name(&self) -> &'static str {
        "das_certificate"
    }

    fn recognizes(&self, payload: &PreparedPayload<'_>) -> bool {
        payload.compression.is_none()
            && payload
                .header()
                .is_some_and(|flag| flag & DAS_HEADER_FLAG != 0)
    }

    fn decode(
        &self,
        payload: &PreparedPayload<'_>,
        _limits: &ParserLimits,
    ) -> Result<DecodedBatch, StrategyError> {
        let (flag, body) = payload
            .raw
            .split_first()
            .ok_or(StrategyError::Truncated(0))?;
        if body.len() < DAS_CERT_MIN_BODY {
            return Err(StrategyError::Truncated(payload.raw.len()));
        }
        let mut timeout = [0u8; 8];
        timeout.copy_from_slice(&body[64..72]);
        Ok(DecodedBatch {
            transaction_count: 0,
            block_count: 0,
            transactions: Vec::new(),
            details: FormatDetails::DasCertificate {
                flag: *flag,
                tree: flag & DAS_TREE_FLAG != 0,
                keyset_hash: H256::from_slice(&body[..32]),
                data_hash: H256::from_slice(&body[32..64]),
                timeout: u64::from_be_bytes(timeout),
            },
            offchain: true,
        })
    }
}

/// List of EIP-4844 blob versioned hashes.
#[derive(Debug, Clone, Copy)]
pub struct BlobHashes;

impl BatchFormatStrategy for BlobHashes {
    fn name(&self) -> &'static str {
        "blob_hashes"
    }

    fn recognizes(&self, payload: &PreparedPayload<'_>) -> bool {
        payload.compression.is_none() && payload.header() == Some(BLOB_HASHES_HEADER_FLAG)
    }

    fn decode(
        &self,
        payload: &PreparedPayload<'_>,
        _limits: &ParserLimits,
    ) -> Result<DecodedBatch, StrategyError> {
        let body = &payload.raw[1..];
        if body.is_empty() || body.len() % 32 != 0 {
            return Err(StrategyError::Malformed(format!(
                "blob hash list of {} bytes is not a multiple of 32",
                body.len()
            )));
        }
        Ok(DecodedBatch {
            transaction_count: 0,
            block_count: 0,
            transactions: Vec::new(),
            details: FormatDetails::BlobHashes {
                hashes: body.chunks_exact(32).map(H256::from_slice).collect(),
            },
            offchain: true,
        })
    }
}
