// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! JSON-RPC 2.0 client for the Kaon node, scoped to head info and block
//! batches with receipts.

use crate::error::{BridgeError, BridgeResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonHeadTopology {
    pub id: String,
    pub height: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonHeadInfo {
    pub head_topology: KaonHeadTopology,
    pub last_irreversible_block: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonBlockHeader {
    pub height: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonBlock {
    pub header: KaonBlockHeader,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonEventData {
    pub sequence: u32,
    pub source: String,
    pub name: String,
    /// base64url protobuf payload
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonTransactionReceipt {
    /// 0x-hex transaction id
    pub id: String,
    pub reverted: bool,
    pub events: Vec<KaonEventData>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonBlockReceipt {
    pub transaction_receipts: Vec<KaonTransactionReceipt>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonBlockItem {
    pub block_height: u64,
    pub block: KaonBlock,
    pub receipt: KaonBlockReceipt,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KaonBlocksResponse {
    pub block_items: Vec<KaonBlockItem>,
}

#[derive(Serialize)]
struct RpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

pub struct KaonRpcClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl KaonRpcClient {
    pub fn new(url: &str) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::Config(format!("kaon rpc client: {}", e)))?;
        Ok(Self {
            http,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call<P: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> BridgeResult<T> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::RpcTransient(format!("{}: {}", method, e)))?;
        let body: RpcResponse<T> = response
            .json()
            .await
            .map_err(|e| BridgeError::RpcTransient(format!("{}: {}", method, e)))?;
        if let Some(error) = body.error {
            return Err(BridgeError::RpcTransient(format!(
                "{}: rpc error {}: {}",
                method, error.code, error.message
            )));
        }
        body.result
            .ok_or_else(|| BridgeError::RpcTransient(format!("{}: empty result", method)))
    }

    pub async fn get_head_info(&self) -> BridgeResult<KaonHeadInfo> {
        self.call("chain.get_head_info", json!({})).await
    }

    /// Block batch `[from, from + count)` anchored at `head_id`, with
    /// receipts so the streamer can read per-transaction events.
    pub async fn get_blocks_by_height(
        &self,
        head_id: &str,
        from: u64,
        count: u32,
    ) -> BridgeResult<KaonBlocksResponse> {
        self.call(
            "block_store.get_blocks_by_height",
            json!({
                "head_block_id": head_id,
                "ancestor_start_height": from,
                "num_blocks": count,
                "return_block": true,
                "return_receipt": true,
            }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_info_decodes_with_missing_fields_defaulted() {
        let json = r#"{
            "head_topology": {"id": "0x1122", "height": 120},
            "last_irreversible_block": 100
        }"#;
        let info: KaonHeadInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.head_topology.height, 120);
        assert_eq!(info.last_irreversible_block, 100);

        // nodes omit zero-valued fields
        let sparse: KaonHeadInfo = serde_json::from_str(r#"{"head_topology":{"id":"0x"}}"#).unwrap();
        assert_eq!(sparse.last_irreversible_block, 0);
    }

    #[test]
    fn test_block_items_decode() {
        let json = r#"{
            "block_items": [{
                "block_height": 7,
                "block": {"header": {"height": 7, "timestamp": 1700000000000}},
                "receipt": {
                    "transaction_receipts": [{
                        "id": "0xaabb",
                        "events": [
                            {"sequence": 1, "source": "1Contract", "name": "bridge.tokens_locked_event", "data": "AA=="}
                        ]
                    }]
                }
            }]
        }"#;
        let blocks: KaonBlocksResponse = serde_json::from_str(json).unwrap();
        assert_eq!(blocks.block_items.len(), 1);
        let item = &blocks.block_items[0];
        assert_eq!(item.block.header.timestamp, 1_700_000_000_000);
        let receipt = &item.receipt.transaction_receipts[0];
        assert!(!receipt.reverted);
        assert_eq!(receipt.events[0].name, "bridge.tokens_locked_event");
    }
}
