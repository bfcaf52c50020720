// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Thin wrapper over the Ethereum JSON-RPC provider, scoped to exactly the
//! two calls the streamer needs.

use crate::abi::{request_new_signatures_topic, tokens_locked_topic, transfer_completed_topic};
use crate::error::{BridgeError, BridgeResult};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address as EthAddress, Filter, Log, ValueOrArray};

pub struct EthClient {
    provider: Provider<Http>,
}

impl EthClient {
    pub fn new(url: &str) -> BridgeResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| BridgeError::Config(format!("invalid eth rpc url {}: {}", url, e)))?;
        Ok(Self { provider })
    }

    pub async fn block_number(&self) -> BridgeResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|e| BridgeError::RpcTransient(format!("eth_blockNumber: {}", e)))
    }

    /// All bridge contract logs in `[from_block, to_block]` for the three
    /// event kinds the validator understands.
    pub async fn get_bridge_logs(
        &self,
        contract: EthAddress,
        from_block: u64,
        to_block: u64,
    ) -> BridgeResult<Vec<Log>> {
        let filter = Filter::new()
            .address(contract)
            .from_block(from_block)
            .to_block(to_block)
            .topic0(ValueOrArray::Array(vec![
                Some(tokens_locked_topic()),
                Some(transfer_completed_topic()),
                Some(request_new_signatures_topic()),
            ]));
        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| BridgeError::RpcTransient(format!("eth_getLogs: {}", e)))
    }
}
