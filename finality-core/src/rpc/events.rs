// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Decoding of sequencer-inbox batch delivery events and the calldata that
//! carries their payload.

use crate::error::{FinalityError, FinalityResult};
use crate::types::{DataLocation, TimeBounds};
use ethers::abi::{ParamType, Token};
use ethers::types::{Log, H256, U256};
use ethers::utils::keccak256;

pub const SEQUENCER_BATCH_DELIVERED_SIGNATURE: &str =
    "SequencerBatchDelivered(uint256,bytes32,bytes32,bytes32,uint256,(uint64,uint64,uint64,uint64),uint8)";

pub const SEQUENCER_BATCH_DATA_SIGNATURE: &str = "SequencerBatchData(uint256,bytes)";

/// Calldata entrypoints that carry a batch payload as their second argument.
const BATCH_SUBMISSION_SIGNATURES: &[&str] = &[
    "addSequencerL2BatchFromOrigin(uint256,bytes,uint256,address,uint256,uint256)",
    "addSequencerL2BatchFromOrigin(uint256,bytes,uint256,address)",
    "addSequencerL2Batch(uint256,bytes,uint256,address,uint256,uint256)",
];

/// Payload header flag marking an AnyTrust data availability certificate.
pub const DAS_MESSAGE_HEADER_FLAG: u8 = 0x80;
/// Header flag marking a blob-hash batch.
pub const BLOB_HASHES_HEADER_FLAG: u8 = 0x50;

pub fn sequencer_batch_delivered_topic() -> H256 {
    H256::from(keccak256(SEQUENCER_BATCH_DELIVERED_SIGNATURE))
}

pub fn sequencer_batch_data_topic() -> H256 {
    H256::from(keccak256(SEQUENCER_BATCH_DATA_SIGNATURE))
}

/// `dataLocation` enum as emitted by the sequencer inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDataLocation {
    TxInput,
    SeparateBatchEvent,
    NoData,
    Blob,
}

impl BatchDataLocation {
    pub fn from_u8(value: u8) -> FinalityResult<Self> {
        match value {
            0 => Ok(BatchDataLocation::TxInput),
            1 => Ok(BatchDataLocation::SeparateBatchEvent),
            2 => Ok(BatchDataLocation::NoData),
            3 => Ok(BatchDataLocation::Blob),
            other => Err(FinalityError::Decode(format!(
                "unknown batch data location {}",
                other
            ))),
        }
    }

    /// Storage location of the payload, refined by its header byte.
    pub fn resolve(&self, payload: &[u8]) -> DataLocation {
        match self {
            BatchDataLocation::Blob => DataLocation::External,
            BatchDataLocation::NoData => DataLocation::Onchain,
            BatchDataLocation::TxInput | BatchDataLocation::SeparateBatchEvent => {
                match payload.first() {
                    Some(flag) if flag & DAS_MESSAGE_HEADER_FLAG != 0 => DataLocation::Das,
                    _ => DataLocation::Onchain,
                }
            }
        }
    }
}

/// Decoded `SequencerBatchDelivered` log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchDeliveredEvent {
    pub sequence_number: u64,
    pub before_acc: H256,
    pub after_acc: H256,
    pub delayed_acc: H256,
    pub after_delayed_messages_read: u64,
    pub time_bounds: TimeBounds,
    pub data_location: BatchDataLocation,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
}

fn u256_to_u64(field: &str, value: U256) -> FinalityResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(FinalityError::Decode(format!("{} overflows u64: {}", field, value)));
    }
    Ok(value.as_u64())
}

fn token_u64(field: &str, token: Option<Token>) -> FinalityResult<u64> {
    match token {
        Some(Token::Uint(v)) => u256_to_u64(field, v),
        other => Err(FinalityError::Decode(format!("{}: expected uint, got {:?}", field, other))),
    }
}

impl BatchDeliveredEvent {
    pub fn decode(log: &Log) -> FinalityResult<Self> {
        if log.topics.first() != Some(&sequencer_batch_delivered_topic()) {
            return Err(FinalityError::Decode("not a SequencerBatchDelivered log".into()));
        }
        if log.topics.len() != 4 {
            return Err(FinalityError::Decode(format!(
                "SequencerBatchDelivered expects 4 topics, got {}",
                log.topics.len()
            )));
        }
        let sequence_number = u256_to_u64(
            "batchSequenceNumber",
            U256::from_big_endian(log.topics[1].as_bytes()),
        )?;

        let tokens = ethers::abi::decode(
            &[
                ParamType::FixedBytes(32),
                ParamType::Uint(256),
                ParamType::Tuple(vec![ParamType::Uint(64); 4]),
                ParamType::Uint(8),
            ],
            &log.data,
        )
        .map_err(|e| FinalityError::Decode(format!("SequencerBatchDelivered data: {}", e)))?;
        let mut tokens = tokens.into_iter();

        let delayed_acc = match tokens.next() {
            Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => H256::from_slice(&bytes),
            other => {
                return Err(FinalityError::Decode(format!("delayedAcc: {:?}", other)));
            }
        };
        let after_delayed_messages_read = token_u64("afterDelayedMessagesRead", tokens.next())?;
        let time_bounds = match tokens.next() {
            Some(Token::Tuple(fields)) => {
                let mut fields = fields.into_iter();
                TimeBounds {
                    min_timestamp: token_u64("minTimestamp", fields.next())?,
                    max_timestamp: token_u64("maxTimestamp", fields.next())?,
                    min_block_number: token_u64("minBlockNumber", fields.next())?,
                    max_block_number: token_u64("maxBlockNumber", fields.next())?,
                }
            }
            other => return Err(FinalityError::Decode(format!("timeBounds: {:?}", other))),
        };
        let location = token_u64("dataLocation", tokens.next())?;
        let data_location = BatchDataLocation::from_u8(location as u8)?;

        Ok(Self {
            sequence_number,
            before_acc: log.topics[2],
            after_acc: log.topics[3],
            delayed_acc,
            after_delayed_messages_read,
            time_bounds,
            data_location,
            block_number: log.block_number.map(|n| n.as_u64()).unwrap_or_default(),
            transaction_hash: log.transaction_hash.unwrap_or_default(),
            log_index: log.log_index.map(|i| i.low_u64()).unwrap_or_default(),
        })
    }

    /// Builds the log a sequencer inbox would emit; used by fixtures.
    pub fn encode(&self, emitter: ethers::types::Address) -> Log {
        let data = ethers::abi::encode(&[
            Token::FixedBytes(self.delayed_acc.as_bytes().to_vec()),
            Token::Uint(self.after_delayed_messages_read.into()),
            Token::Tuple(vec![
                Token::Uint(self.time_bounds.min_timestamp.into()),
                Token::Uint(self.time_bounds.max_timestamp.into()),
                Token::Uint(self.time_bounds.min_block_number.into()),
                Token::Uint(self.time_bounds.max_block_number.into()),
            ]),
            Token::Uint((self.data_location as u8).into()),
        ]);
        let mut seq = [0u8; 32];
        U256::from(self.sequence_number).to_big_endian(&mut seq);
        Log {
            address: emitter,
            topics: vec![
                sequencer_batch_delivered_topic(),
                H256::from(seq),
                self.before_acc,
                self.after_acc,
            ],
            data: data.into(),
            block_number: Some(self.block_number.into()),
            transaction_hash: Some(self.transaction_hash),
            log_index: Some(self.log_index.into()),
            ..Default::default()
        }
    }
}

/// Extracts the batch payload from sequencer-inbox submission calldata.
///
/// Returns `None` when the calldata is not a known submission call.
pub fn extract_batch_payload(calldata: &[u8]) -> Option<Vec<u8>> {
    if calldata.len() < 4 {
        return None;
    }
    let (selector, args) = calldata.split_at(4);
    let signature = BATCH_SUBMISSION_SIGNATURES
        .iter()
        .find(|sig| &keccak256(sig.as_bytes())[..4] == selector)?;
    let params = parse_params(signature);
    let tokens = ethers::abi::decode(&params, args).ok()?;
    match tokens.into_iter().nth(1) {
        Some(Token::Bytes(payload)) => Some(payload),
        _ => None,
    }
}

/// Extracts the payload of a `SequencerBatchData` log for `sequence_number`.
pub fn extract_separate_event_payload(log: &Log, sequence_number: u64) -> Option<Vec<u8>> {
    if log.topics.first() != Some(&sequencer_batch_data_topic()) || log.topics.len() < 2 {
        return None;
    }
    if U256::from_big_endian(log.topics[1].as_bytes()) != U256::from(sequence_number) {
        return None;
    }
    match ethers::abi::decode(&[ParamType::Bytes], &log.data).ok()?.into_iter().next() {
        Some(Token::Bytes(payload)) => Some(payload),
        _ => None,
    }
}

fn parse_params(signature: &str) -> Vec<ParamType> {
    let inner = signature
        .split_once('(')
        .and_then(|(_, rest)| rest.strip_suffix(')'))
        .unwrap_or_default();
    inner
        .split(',')
        .filter_map(|kind| match kind {
            "uint256" => Some(ParamType::Uint(256)),
            "bytes" => Some(ParamType::Bytes),
            "address" => Some(ParamType::Address),
            _ => None,
        })
        .collect()
}

/// Encodes a submission call; used by fixtures and tests.
pub fn encode_batch_submission(sequence_number: u64, payload: &[u8]) -> Vec<u8> {
    let signature = BATCH_SUBMISSION_SIGNATURES[0];
    let mut out = keccak256(signature.as_bytes())[..4].to_vec();
    out.extend(ethers::abi::encode(&[
        Token::Uint(sequence_number.into()),
        Token::Bytes(payload.to_vec()),
        Token::Uint(U256::zero()),
        Token::Address(ethers::types::Address::zero()),
        Token::Uint(U256::zero()),
        Token::Uint(U256::zero()),
    ]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;
    use rstest::rstest;

    fn event(location: BatchDataLocation) -> BatchDeliveredEvent {
        BatchDeliveredEvent {
            sequence_number: 40,
            before_acc: H256::repeat_byte(1),
            after_acc: H256::repeat_byte(2),
            delayed_acc: H256::repeat_byte(3),
            after_delayed_messages_read: 17,
            time_bounds: TimeBounds {
                min_timestamp: 1,
                max_timestamp: 2,
                min_block_number: 3,
                max_block_number: 4,
            },
            data_location: location,
            block_number: 1000,
            transaction_hash: H256::repeat_byte(9),
            log_index: 4,
        }
    }

    #[test]
    fn decodes_emitted_log() {
        let expected = event(BatchDataLocation::TxInput);
        let log = expected.encode(Address::repeat_byte(0x33));
        assert_eq!(BatchDeliveredEvent::decode(&log).unwrap(), expected);
    }

    #[test]
    fn rejects_foreign_topic() {
        let mut log = event(BatchDataLocation::TxInput).encode(Address::zero());
        log.topics[0] = H256::zero();
        assert!(BatchDeliveredEvent::decode(&log).is_err());
    }

    #[test]
    fn extracts_payload_from_calldata() {
        let payload = vec![0x00, 0xde, 0xad, 0xbe, 0xef];
        let calldata = encode_batch_submission(40, &payload);
        assert_eq!(extract_batch_payload(&calldata), Some(payload));
        assert_eq!(extract_batch_payload(&[0xaa, 0xbb, 0xcc, 0xdd, 0x00]), None);
        assert_eq!(extract_batch_payload(&[0x01]), None);
    }

    #[rstest]
    #[case(BatchDataLocation::TxInput, &[0x00, 0x01], DataLocation::Onchain)]
    #[case(BatchDataLocation::TxInput, &[0x80, 0x01], DataLocation::Das)]
    #[case(BatchDataLocation::SeparateBatchEvent, &[0x88], DataLocation::Das)]
    #[case(BatchDataLocation::Blob, &[0x50], DataLocation::External)]
    #[case(BatchDataLocation::NoData, &[], DataLocation::Onchain)]
    fn maps_data_location(
        #[case] location: BatchDataLocation,
        #[case] payload: &[u8],
        #[case] expected: DataLocation,
    ) {
        assert_eq!(location.resolve(payload), expected);
    }

    #[test]
    fn separate_event_payload_matches_sequence() {
        let mut seq = [0u8; 32];
        U256::from(5u64).to_big_endian(&mut seq);
        let log = Log {
            topics: vec![sequencer_batch_data_topic(), H256::from(seq)],
            data: ethers::abi::encode(&[Token::Bytes(vec![1, 2, 3])]).into(),
            ..Default::default()
        };
        assert_eq!(extract_separate_event_payload(&log, 5), Some(vec![1, 2, 3]));
        assert_eq!(extract_separate_event_payload(&log, 6), None);
    }
}
