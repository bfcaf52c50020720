// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Kaon bridge contract events.
//!
//! Event payloads are protobuf messages; the JSON-RPC layer delivers them
//! base64url-encoded. Event names are fixed strings under the `bridge.`
//! namespace.

use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine as _;
use prost::Message;

pub const KAON_TOKENS_LOCKED_EVENT: &str = "bridge.tokens_locked_event";
pub const KAON_TRANSFER_COMPLETED_EVENT: &str = "bridge.transfer_completed_event";
pub const KAON_REQUEST_NEW_SIGNATURES_EVENT: &str = "bridge.request_new_signatures_event";

#[derive(Clone, PartialEq, Message)]
pub struct KaonTokensLockedEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub from: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub token: Vec<u8>,
    #[prost(string, tag = "3")]
    pub amount: String,
    #[prost(string, tag = "4")]
    pub payment: String,
    #[prost(string, tag = "5")]
    pub relayer: String,
    #[prost(string, tag = "6")]
    pub recipient: String,
    #[prost(string, tag = "7")]
    pub metadata: String,
    #[prost(uint32, tag = "8")]
    pub chain_id: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct KaonTransferCompletedEvent {
    #[prost(bytes = "vec", tag = "1")]
    pub tx_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct KaonRequestNewSignaturesEvent {
    #[prost(string, tag = "1")]
    pub transaction_id: String,
    #[prost(string, tag = "2")]
    pub operation_id: String,
}

/// Decode a base64url protobuf event payload as delivered by the Kaon
/// JSON-RPC node.
pub fn decode_kaon_event<T: Message + Default>(data_b64: &str) -> BridgeResult<T> {
    let bytes = BASE64_URL
        .decode(data_b64)
        .map_err(|e| BridgeError::Deserialization(format!("event data base64: {}", e)))?;
    T::decode(bytes.as_slice())
        .map_err(|e| BridgeError::Deserialization(format!("event data protobuf: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_locked_round_trip() {
        let event = KaonTokensLockedEvent {
            from: vec![1, 2, 3],
            token: vec![4, 5],
            amount: "1000".to_string(),
            payment: "10".to_string(),
            relayer: "0x1111111111111111111111111111111111111111".to_string(),
            recipient: "0x2222222222222222222222222222222222222222".to_string(),
            metadata: "memo".to_string(),
            chain_id: 2,
        };
        let encoded = BASE64_URL.encode(event.encode_to_vec());
        let decoded: KaonTokensLockedEvent = decode_kaon_event(&encoded).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_request_new_signatures_defaults() {
        // protobuf zero values: empty operation id must decode as ""
        let event = KaonRequestNewSignaturesEvent {
            transaction_id: "0xaa".to_string(),
            operation_id: String::new(),
        };
        let encoded = BASE64_URL.encode(event.encode_to_vec());
        let decoded: KaonRequestNewSignaturesEvent = decode_kaon_event(&encoded).unwrap();
        assert_eq!(decoded.operation_id, "");
    }

    #[test]
    fn test_invalid_payloads_rejected() {
        assert!(decode_kaon_event::<KaonTokensLockedEvent>("!!!").is_err());
        let garbage = BASE64_URL.encode([0xffu8; 7]);
        assert!(decode_kaon_event::<KaonTokensLockedEvent>(&garbage).is_err());
    }
}
