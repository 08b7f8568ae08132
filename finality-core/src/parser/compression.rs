// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Compression detection and size-capped decompression of batch payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Cursor, Read};
use thiserror::Error;

/// Sequencer header byte announcing a brotli-compressed segment stream.
pub const BROTLI_HEADER_FLAG: u8 = 0x00;

/// Bytes sampled for the entropy test.
pub const ENTROPY_SAMPLE: usize = 256;
/// Bits per byte above which a payload is treated as compressed.
pub const ENTROPY_THRESHOLD: f64 = 7.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Brotli,
    Zlib,
    Gzip,
    Zstd,
}

impl Compression {
    pub const ALL: [Compression; 4] = [
        Compression::Brotli,
        Compression::Zlib,
        Compression::Gzip,
        Compression::Zstd,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Compression::Brotli => "brotli",
            Compression::Zlib => "zlib",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }

    pub fn decompress(&self, data: &[u8], limit: usize) -> Result<Vec<u8>, DecompressError> {
        let out = match self {
            Compression::Brotli => {
                read_capped(brotli::Decompressor::new(Cursor::new(data), 4096), limit)?
            }
            Compression::Zlib => read_capped(flate2::read::ZlibDecoder::new(data), limit)?,
            Compression::Gzip => read_capped(flate2::read::GzDecoder::new(data), limit)?,
            Compression::Zstd => zstd::bulk::decompress(data, limit)
                .map_err(|e| DecompressError::Corrupted(e.to_string()))?,
        };
        if out.is_empty() && !data.is_empty() {
            return Err(DecompressError::Corrupted("decompressed to nothing".into()));
        }
        Ok(out)
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecompressError {
    #[error("corrupted input: {0}")]
    Corrupted(String),
    #[error("decompressed size exceeds {0} bytes")]
    TooLarge(usize),
}

fn read_capped(reader: impl Read, limit: usize) -> Result<Vec<u8>, DecompressError> {
    let mut out = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecompressError::Corrupted(e.to_string()))?;
    if out.len() > limit {
        return Err(DecompressError::TooLarge(limit));
    }
    Ok(out)
}

/// What the first bytes and byte distribution say about a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Algorithms to try in order. A magic match yields exactly one; high
    /// entropy yields all of them; a plain payload yields none.
    pub candidates: Vec<Compression>,
    /// Bytes to hand to the decompressor (header flag stripped).
    pub body_offset: usize,
    pub entropy: f64,
}

pub fn detect(payload: &[u8]) -> Detection {
    let entropy = shannon_entropy(&payload[..payload.len().min(ENTROPY_SAMPLE)]);
    let by_magic = |algo: Compression, body_offset: usize| Detection {
        candidates: vec![algo],
        body_offset,
        entropy,
    };

    match payload {
        [BROTLI_HEADER_FLAG, _, ..] => by_magic(Compression::Brotli, 1),
        [0x1f, 0x8b, ..] => by_magic(Compression::Gzip, 0),
        [0x28, 0xb5, 0x2f, 0xfd, ..] => by_magic(Compression::Zstd, 0),
        [0x78, 0x01 | 0x5e | 0x9c | 0xda, ..] => by_magic(Compression::Zlib, 0),
        _ if entropy > ENTROPY_THRESHOLD => Detection {
            candidates: Compression::ALL.to_vec(),
            body_offset: 0,
            entropy,
        },
        _ => Detection {
            candidates: Vec::new(),
            body_offset: 0,
            entropy,
        },
    }
}

/// Shannon entropy in bits per byte.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0usize; 256];
    for byte in data {
        counts[*byte as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|c| **c > 0)
        .map(|c| {
            let p = *c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    fn brotli_compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let params = brotli::enc::BrotliEncoderParams {
            quality: 5,
            ..Default::default()
        };
        brotli::BrotliCompress(&mut Cursor::new(data), &mut out, &params).unwrap();
        out
    }

    #[test]
    fn entropy_bounds() {
        assert_eq!(shannon_entropy(&[]), 0.0);
        assert_eq!(shannon_entropy(&[7u8; 64]), 0.0);
        let all: Vec<u8> = (0..=255u8).collect();
        assert!((shannon_entropy(&all) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn detects_by_magic() {
        let z = zlib(b"hello hello hello");
        let d = detect(&z);
        assert_eq!(d.candidates[0], Compression::Zlib);
        assert_eq!(d.body_offset, 0);

        let d = detect(&[0x28, 0xb5, 0x2f, 0xfd, 1, 2]);
        assert_eq!(d.candidates[0], Compression::Zstd);

        let d = detect(&[0x00, 0x1b, 0x02]);
        assert_eq!(d.candidates[0], Compression::Brotli);
        assert_eq!(d.body_offset, 1);
    }

    #[test]
    fn plain_text_is_not_compressed() {
        assert!(detect(b"plain old bytes, nothing to see").candidates.is_empty());
    }

    #[test]
    fn decompresses_each_algorithm() {
        let data = b"batch batch batch batch batch".repeat(8);
        assert_eq!(Compression::Zlib.decompress(&zlib(&data), 1 << 20).unwrap(), data);
        assert_eq!(
            Compression::Brotli
                .decompress(&brotli_compress(&data), 1 << 20)
                .unwrap(),
            data
        );
        let zst = zstd::bulk::compress(&data, 3).unwrap();
        assert_eq!(Compression::Zstd.decompress(&zst, 1 << 20).unwrap(), data);
    }

    #[test]
    fn caps_decompressed_size() {
        let data = vec![0u8; 10_000];
        assert_eq!(
            Compression::Zlib.decompress(&zlib(&data), 1000),
            Err(DecompressError::TooLarge(1000))
        );
    }

    #[test]
    fn garbage_behind_magic_fails() {
        let zstd_garbage = [0x28, 0xb5, 0x2f, 0xfd, 0x13, 0x37, 0xca, 0xfe, 0xba, 0xbe];
        assert_eq!(detect(&zstd_garbage).candidates, vec![Compression::Zstd]);
        assert!(Compression::Zstd.decompress(&zstd_garbage, 1 << 16).is_err());

        let zlib_garbage = [0x78, 0x9c, 0xff, 0xff, 0xff, 0x00, 0x13, 0x37, 0x42, 0x42];
        assert!(Compression::Zlib.decompress(&zlib_garbage, 1 << 16).is_err());
    }
}
