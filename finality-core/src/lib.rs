// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Core of the rollup finality tracker: domain types, the error taxonomy,
//! resilient parent-chain access and the batch payload parser.

pub mod chain;
pub mod clock;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod rpc;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use chain::{ChainConfig, ChainType, ContractAddresses};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{FinalityError, FinalityResult, TransientKind};
pub use metrics::FinalityMetrics;

/// Serde adapter for `Duration` fields written as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Serde adapter for `Duration` fields written as integer seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
