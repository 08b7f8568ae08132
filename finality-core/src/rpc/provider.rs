// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{FinalityError, FinalityResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, BlockNumber, Bytes, Filter, Log, Transaction,
    TransactionReceipt, TransactionRequest, H256,
};
use url::Url;

/// Event-log query restricted to one emitter and topic0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: Address,
    pub topic0: H256,
    /// First indexed argument, if filtering on it
    pub topic1: Option<H256>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    pub fn to_filter(&self) -> Filter {
        let filter = Filter::new()
            .address(self.address)
            .topic0(self.topic0)
            .from_block(BlockNumber::Number(self.from_block.into()))
            .to_block(BlockNumber::Number(self.to_block.into()));
        match self.topic1 {
            Some(topic) => filter.topic1(topic),
            None => filter,
        }
    }
}

/// JSON-RPC surface of the parent chain consumed by the engine.
#[async_trait]
pub trait ParentChainRpc: Send + Sync + 'static {
    async fn chain_id(&self) -> FinalityResult<u64>;

    async fn block_number(&self) -> FinalityResult<u64>;

    async fn get_code(&self, address: Address) -> FinalityResult<Bytes>;

    /// `eth_call` against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> FinalityResult<Bytes>;

    async fn get_logs(&self, query: &LogQuery) -> FinalityResult<Vec<Log>>;

    async fn get_block_timestamp(&self, block: u64) -> FinalityResult<Option<DateTime<Utc>>>;

    async fn get_transaction(&self, hash: H256) -> FinalityResult<Option<Transaction>>;

    async fn get_transaction_receipt(&self, hash: H256)
        -> FinalityResult<Option<TransactionReceipt>>;
}

/// `ParentChainRpc` over an `ethers` HTTP provider.
#[derive(Debug, Clone)]
pub struct EthersParentChain {
    provider: Provider<Http>,
}

impl EthersParentChain {
    pub fn new(url: &str) -> FinalityResult<Self> {
        let url = Url::parse(url).map_err(|e| {
            FinalityError::Configuration(format!("invalid parent RPC url '{}': {}", url, e))
        })?;
        Ok(Self {
            provider: Provider::new(Http::new(url)),
        })
    }
}

fn rpc_err(e: impl std::fmt::Display) -> FinalityError {
    FinalityError::classify_rpc(e.to_string())
}

pub(crate) fn unix_to_datetime(secs: u64) -> Option<DateTime<Utc>> {
    i64::try_from(secs)
        .ok()
        .and_then(|s| Utc.timestamp_opt(s, 0).single())
}

#[async_trait]
impl ParentChainRpc for EthersParentChain {
    async fn chain_id(&self) -> FinalityResult<u64> {
        let id = self.provider.get_chainid().await.map_err(rpc_err)?;
        Ok(id.low_u64())
    }

    async fn block_number(&self) -> FinalityResult<u64> {
        let number = self.provider.get_block_number().await.map_err(rpc_err)?;
        Ok(number.as_u64())
    }

    async fn get_code(&self, address: Address) -> FinalityResult<Bytes> {
        self.provider.get_code(address, None).await.map_err(rpc_err)
    }

    async fn call(&self, to: Address, data: Bytes) -> FinalityResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.provider.call(&tx, None).await.map_err(rpc_err)
    }

    async fn get_logs(&self, query: &LogQuery) -> FinalityResult<Vec<Log>> {
        self.provider
            .get_logs(&query.to_filter())
            .await
            .map_err(rpc_err)
    }

    async fn get_block_timestamp(&self, block: u64) -> FinalityResult<Option<DateTime<Utc>>> {
        let block = self
            .provider
            .get_block(BlockNumber::Number(block.into()))
            .await
            .map_err(rpc_err)?;
        Ok(block.and_then(|b| unix_to_datetime(b.timestamp.low_u64())))
    }

    async fn get_transaction(&self, hash: H256) -> FinalityResult<Option<Transaction>> {
        self.provider.get_transaction(hash).await.map_err(rpc_err)
    }

    async fn get_transaction_receipt(
        &self,
        hash: H256,
    ) -> FinalityResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(hash)
            .await
            .map_err(rpc_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        assert!(matches!(
            EthersParentChain::new("::nope"),
            Err(FinalityError::Configuration(_))
        ));
        assert!(EthersParentChain::new("http://localhost:8545").is_ok());
    }

    #[test]
    fn log_query_builds_filter() {
        let query = LogQuery {
            address: Address::repeat_byte(1),
            topic0: H256::repeat_byte(2),
            topic1: Some(H256::repeat_byte(3)),
            from_block: 10,
            to_block: 20,
        };
        let filter = query.to_filter();
        assert_eq!(filter.get_from_block(), Some(10u64.into()));
        assert_eq!(filter.get_to_block(), Some(20u64.into()));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_classified_transient() {
        let rpc = EthersParentChain::new("http://127.0.0.1:1").unwrap();
        let err = rpc.block_number().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {err}");
    }
}
