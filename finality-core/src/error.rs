// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy shared by every finality component.
//!
//! Parse degradation and duplicate batch writes are *outcomes*, not errors:
//! see `ParseMetadata::parse_error` and `InsertOutcome::Duplicate`.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for finality operations
pub type FinalityResult<T> = Result<T, FinalityError>;

/// Sub-kind of a transient RPC failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    RateLimited,
    BlockRangeLimit,
    Network,
    Server,
    CircuitOpen,
    Timeout,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransientKind::RateLimited => "rate limited",
            TransientKind::BlockRangeLimit => "block range limit",
            TransientKind::Network => "network",
            TransientKind::Server => "server",
            TransientKind::CircuitOpen => "circuit breaker open",
            TransientKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum FinalityError {
    /// Missing or invalid chain configuration. Fatal, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed address or parameter, rejected before any state mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Retried by re-invocation later; never marks a transaction failed.
    #[error("Transient RPC error ({kind}): {message}")]
    TransientRpc { kind: TransientKind, message: String },

    /// Unauthorized, not-found, invalid address/ABI, insufficient funds.
    #[error("Non-retryable RPC error: {0}")]
    NonRetryableRpc(String),

    /// Unclassified RPC failure (e.g. execution reverted).
    #[error("RPC error: {0}")]
    Rpc(String),

    /// A per-state timeout elapsed.
    #[error("{0}")]
    Timeout(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for FinalityError {
    fn from(e: anyhow::Error) -> Self {
        FinalityError::Internal(e.to_string())
    }
}

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "invalid address",
    "invalid abi",
    "unauthorized",
    "not found",
    "insufficient funds",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "429",
    "too many requests",
    "quota exceeded",
    "-32005",
];

const BLOCK_RANGE_PATTERNS: &[&str] = &[
    "block range",
    "query returned more than",
    "limit exceeded",
    "range is too large",
    "exceed maximum block range",
];

const NETWORK_PATTERNS: &[&str] = &[
    "connection",
    "timed out",
    "timeout",
    "broken pipe",
    "eof",
    "dns",
    "network",
    "error sending request",
];

const SERVER_PATTERNS: &[&str] = &[
    "500",
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "internal server error",
];

impl FinalityError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        FinalityError::TransientRpc {
            kind,
            message: message.into(),
        }
    }

    pub fn circuit_open(name: &str, resume_in: Duration) -> Self {
        Self::transient(
            TransientKind::CircuitOpen,
            format!(
                "circuit breaker for {} is open, retry in {}ms",
                name,
                resume_in.as_millis()
            ),
        )
    }

    /// Maps raw provider error text onto the taxonomy.
    ///
    /// Block-range markers are checked before the non-retryable list because
    /// some providers phrase range errors as "limit exceeded ... not found".
    pub fn classify_rpc(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

        if matches(BLOCK_RANGE_PATTERNS) {
            Self::transient(TransientKind::BlockRangeLimit, message)
        } else if matches(RATE_LIMIT_PATTERNS) {
            Self::transient(TransientKind::RateLimited, message)
        } else if matches(NON_RETRYABLE_PATTERNS) {
            FinalityError::NonRetryableRpc(message)
        } else if matches(NETWORK_PATTERNS) {
            Self::transient(TransientKind::Network, message)
        } else if matches(SERVER_PATTERNS) {
            Self::transient(TransientKind::Server, message)
        } else {
            FinalityError::Rpc(message)
        }
    }

    /// Errors that must leave transaction state untouched.
    pub const fn is_transient(&self) -> bool {
        matches!(self, FinalityError::TransientRpc { .. })
    }

    /// Errors worth another attempt inside the RPC retry loop.
    pub const fn is_retryable(&self) -> bool {
        match self {
            FinalityError::TransientRpc { kind, .. } => !matches!(kind, TransientKind::CircuitOpen),
            FinalityError::Rpc(_) => true,
            _ => false,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            FinalityError::TransientRpc {
                kind: TransientKind::CircuitOpen,
                ..
            }
        )
    }

    pub fn is_block_range_limit(&self) -> bool {
        matches!(
            self,
            FinalityError::TransientRpc {
                kind: TransientKind::BlockRangeLimit,
                ..
            }
        )
    }

    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            FinalityError::Configuration(_) => "configuration",
            FinalityError::Validation(_) => "validation",
            FinalityError::TransientRpc { kind, .. } => match kind {
                TransientKind::RateLimited => "rate_limited",
                TransientKind::BlockRangeLimit => "block_range_limit",
                TransientKind::Network => "network",
                TransientKind::Server => "server",
                TransientKind::CircuitOpen => "circuit_open",
                TransientKind::Timeout => "rpc_timeout",
            },
            FinalityError::NonRetryableRpc(_) => "non_retryable_rpc",
            FinalityError::Rpc(_) => "rpc",
            FinalityError::Timeout(_) => "state_timeout",
            FinalityError::Store(_) => "store",
            FinalityError::Decode(_) => "decode",
            FinalityError::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("HTTP 429 Too Many Requests", "rate_limited")]
    #[case("{\"code\":-32005,\"message\":\"limit\"}", "rate_limited")]
    #[case("query returned more than 10000 results", "block_range_limit")]
    #[case("eth_getLogs block range is too large", "block_range_limit")]
    #[case("invalid address", "non_retryable_rpc")]
    #[case("Unauthorized: bad api key", "non_retryable_rpc")]
    #[case("insufficient funds for gas", "non_retryable_rpc")]
    #[case("error sending request: connection refused", "network")]
    #[case("502 Bad Gateway", "server")]
    #[case("execution reverted", "rpc")]
    fn classify_rpc_messages(#[case] message: &str, #[case] expected: &str) {
        assert_eq!(FinalityError::classify_rpc(message).error_type(), expected);
    }

    #[test]
    fn circuit_open_is_transient_but_not_retryable() {
        let err = FinalityError::circuit_open("rollup", Duration::from_secs(3));
        assert!(err.is_transient());
        assert!(err.is_circuit_open());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("circuit breaker for rollup is open"));
    }

    #[test]
    fn timeout_is_not_transient() {
        let err = FinalityError::Timeout("not sequenced within timeout".into());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "not sequenced within timeout");
    }

    #[test]
    fn unclassified_rpc_errors_are_retried_but_not_transient() {
        let err = FinalityError::classify_rpc("execution reverted");
        assert!(err.is_retryable());
        assert!(!err.is_transient());
    }
}
