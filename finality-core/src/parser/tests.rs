// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use super::*;
use ethers::utils::rlp::RlpStream;
use std::io::{Cursor, Write};

fn ctx() -> ParseContext {
    ParseContext {
        chain_id: 42_170,
        sequence_number: 40,
    }
}

fn segment(kind: u8, content: &[u8]) -> Vec<u8> {
    let mut data = vec![kind];
    data.extend_from_slice(content);
    let mut stream = RlpStream::new();
    stream.append(&data);
    stream.out().to_vec()
}

/// Sequencer-style payload: brotli header flag, then a compressed segment stream.
fn brotli_batch(signed_txs: usize) -> Vec<u8> {
    let mut stream = Vec::new();
    for i in 0..signed_txs {
        stream.extend(segment(0, &[4, 0xf8, i as u8, 0x01, 0x02]));
    }
    stream.extend(segment(3, &[0x10]));
    let mut compressed = Vec::new();
    let params = brotli::enc::BrotliEncoderParams::default();
    brotli::BrotliCompress(&mut Cursor::new(&stream), &mut compressed, &params).unwrap();
    let mut payload = vec![compression::BROTLI_HEADER_FLAG];
    payload.extend(compressed);
    payload
}

#[test]
fn empty_hex_payload_yields_zero() {
    let parser = BatchParser::default();
    let result = parser.parse_hex("0x", DataLocation::Onchain, &ctx());
    assert_eq!(result.transaction_count_estimate, 0);
    assert_eq!(result.batch_size_bytes, 0);
    assert_eq!(result.metadata.parse_error, None);
    assert_eq!(result.data_hash, H256::from(keccak256(b"")));
}

#[test]
fn mismatched_compression_degrades() {
    let parser = BatchParser::new(
        ParserLimits::default(),
        Some(Arc::new(FinalityMetrics::new_for_testing())),
    );
    // zlib header followed by bytes no inflater accepts
    let bogus = [0x78, 0x9c, 0xff, 0xee, 0xdd, 0xcc, 0xbb, 0xaa, 0x99, 0x88];
    let result = parser.parse(&bogus, DataLocation::Onchain, &ctx());
    assert_eq!(result.transaction_count_estimate, 0);
    let error = result.metadata.parse_error.expect("parse error recorded");
    assert!(error.contains("zlib"), "{error}");
    assert_eq!(result.batch_size_bytes, 10);
}

#[test]
fn invalid_hex_degrades() {
    let result = BatchParser::default().parse_hex("0xzz", DataLocation::Onchain, &ctx());
    assert_eq!(result.transaction_count_estimate, 0);
    assert!(result.metadata.parse_error.is_some());
}

#[test]
fn decodes_brotli_segment_stream() {
    let payload = brotli_batch(3);
    let result = BatchParser::default().parse(&payload, DataLocation::Onchain, &ctx());
    assert_eq!(result.metadata.format, "segments");
    assert_eq!(result.metadata.compression, Some(Compression::Brotli));
    assert_eq!(result.transaction_count_estimate, 3);
    assert_eq!(result.block_count, Some(3));
    assert!(result.transactions.iter().all(|t| t.hash.is_some()));
    assert_eq!(result.metadata.parse_error, None);
}

#[test]
fn zlib_wrapped_stream_is_decoded() {
    let stream = segment(0, &[4, 0xaa, 0xbb]);
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
    enc.write_all(&stream).unwrap();
    let payload = enc.finish().unwrap();
    let result = BatchParser::default().parse(&payload, DataLocation::Onchain, &ctx());
    assert_eq!(result.metadata.compression, Some(Compression::Zlib));
    assert_eq!(result.transaction_count_estimate, 1);
}

#[test]
fn offchain_locations_are_limited() {
    let mut cert = vec![0x88];
    cert.extend_from_slice(&[0x01; 32]);
    cert.extend_from_slice(&[0x02; 32]);
    cert.extend_from_slice(&1_700_000_000u64.to_be_bytes());
    let result = BatchParser::default().parse(&cert, DataLocation::Das, &ctx());
    assert!(result.metadata.limited);
    assert_eq!(result.metadata.format, "das");
    assert_eq!(result.transaction_count_estimate, 0);
    assert!(matches!(
        result.metadata.details,
        Some(FormatDetails::DasCertificate { timeout: 1_700_000_000, .. })
    ));

    let result = BatchParser::default().parse(&[0x50], DataLocation::External, &ctx());
    assert!(result.metadata.limited);
    assert_eq!(result.metadata.details, None);
}

#[test]
fn unstructured_payload_falls_back_to_heuristic() {
    let mut payload = vec![0x07; 3];
    let mut number = [0u8; 32];
    number[24..].copy_from_slice(&5_000u64.to_be_bytes());
    let mut count = [0u8; 32];
    count[24..].copy_from_slice(&12u64.to_be_bytes());
    payload.extend_from_slice(&number);
    payload.extend_from_slice(&count);
    let result = BatchParser::default().parse(&payload, DataLocation::Onchain, &ctx());
    assert_eq!(result.metadata.format, "heuristic");
    assert_eq!(result.metadata.parse_error, None);
    assert!(result.transaction_count_estimate <= 1000);
    assert!(result.is_heuristic());
    assert!(!result.blocks.is_empty());
    assert_eq!(result.block_count, None);
    assert_eq!(result.child_block_range(), None);
}

#[test]
fn random_garbage_never_panics() {
    let parser = BatchParser::default();
    let mut state = 0x2545_f491_4f6c_dd1du64;
    for len in [1usize, 2, 7, 31, 64, 257, 4096] {
        let bytes: Vec<u8> = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect();
        for location in [DataLocation::Onchain, DataLocation::Das, DataLocation::External] {
            let result = parser.parse(&bytes, location, &ctx());
            assert_eq!(result.batch_size_bytes, len as u64);
            assert!(result.transactions.len() <= ParserLimits::default().max_pattern_hits);
        }
    }
}

#[test]
fn metadata_round_trips_through_json() {
    let result = BatchParser::default().parse(&brotli_batch(1), DataLocation::Onchain, &ctx());
    let json = serde_json::to_value(&result.metadata).unwrap();
    assert_eq!(json["details"]["kind"], "segments");
    let back: ParseMetadata = serde_json::from_value(json).unwrap();
    assert_eq!(back.format, result.metadata.format);
    assert_eq!(back.details, result.metadata.details);
    assert_eq!(back.compression, Some(Compression::Brotli));
}
