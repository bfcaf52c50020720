// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Ethereum bridge contract events and their decoders.

use crate::error::{BridgeError, BridgeResult};
use ethers::abi::{self, ParamType, Token};
use ethers::types::{H256, U256};
use ethers::types::Address as EthAddress;
use fastcrypto::hash::{HashFunction, Keccak256};
use std::sync::OnceLock;

pub const TOKENS_LOCKED_SIGNATURE: &str =
    "TokensLockedEvent(address,address,uint256,uint256,string,string,string,uint256,uint32)";
pub const TRANSFER_COMPLETED_SIGNATURE: &str = "TransferCompletedEvent(bytes,uint256)";
pub const REQUEST_NEW_SIGNATURES_SIGNATURE: &str = "RequestNewSignaturesEvent(bytes,uint256)";

fn event_topic(signature: &str) -> H256 {
    H256::from(Keccak256::digest(signature.as_bytes()).digest)
}

pub fn tokens_locked_topic() -> H256 {
    static TOPIC: OnceLock<H256> = OnceLock::new();
    *TOPIC.get_or_init(|| event_topic(TOKENS_LOCKED_SIGNATURE))
}

pub fn transfer_completed_topic() -> H256 {
    static TOPIC: OnceLock<H256> = OnceLock::new();
    *TOPIC.get_or_init(|| event_topic(TRANSFER_COMPLETED_SIGNATURE))
}

pub fn request_new_signatures_topic() -> H256 {
    static TOPIC: OnceLock<H256> = OnceLock::new();
    *TOPIC.get_or_init(|| event_topic(REQUEST_NEW_SIGNATURES_SIGNATURE))
}

/// `TokensLockedEvent` payload, all arguments non-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTokensLockedEvent {
    pub from: EthAddress,
    pub token: EthAddress,
    pub amount: U256,
    pub payment: U256,
    pub relayer: String,
    pub recipient: String,
    pub metadata: String,
    pub blocktime: U256,
    pub chain: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthTransferCompletedEvent {
    pub tx_id: Vec<u8>,
    pub operation_id: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthRequestNewSignaturesEvent {
    pub tx_id: Vec<u8>,
    pub blocktime: U256,
}

struct TokenReader {
    tokens: std::vec::IntoIter<Token>,
}

impl TokenReader {
    fn decode(types: &[ParamType], data: &[u8]) -> BridgeResult<Self> {
        let tokens = abi::decode(types, data)
            .map_err(|e| BridgeError::Deserialization(format!("abi decode: {}", e)))?;
        Ok(Self {
            tokens: tokens.into_iter(),
        })
    }

    fn next(&mut self) -> BridgeResult<Token> {
        self.tokens
            .next()
            .ok_or_else(|| BridgeError::Deserialization("missing abi token".to_string()))
    }

    fn address(&mut self) -> BridgeResult<EthAddress> {
        self.next()?
            .into_address()
            .ok_or_else(|| BridgeError::Deserialization("expected address".to_string()))
    }

    fn uint(&mut self) -> BridgeResult<U256> {
        self.next()?
            .into_uint()
            .ok_or_else(|| BridgeError::Deserialization("expected uint".to_string()))
    }

    fn string(&mut self) -> BridgeResult<String> {
        self.next()?
            .into_string()
            .ok_or_else(|| BridgeError::Deserialization("expected string".to_string()))
    }

    fn bytes(&mut self) -> BridgeResult<Vec<u8>> {
        self.next()?
            .into_bytes()
            .ok_or_else(|| BridgeError::Deserialization("expected bytes".to_string()))
    }
}

pub fn decode_tokens_locked(data: &[u8]) -> BridgeResult<EthTokensLockedEvent> {
    let mut reader = TokenReader::decode(
        &[
            ParamType::Address,
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::String,
            ParamType::String,
            ParamType::String,
            ParamType::Uint(256),
            ParamType::Uint(32),
        ],
        data,
    )?;
    Ok(EthTokensLockedEvent {
        from: reader.address()?,
        token: reader.address()?,
        amount: reader.uint()?,
        payment: reader.uint()?,
        relayer: reader.string()?,
        recipient: reader.string()?,
        metadata: reader.string()?,
        blocktime: reader.uint()?,
        chain: reader.uint()?.low_u32(),
    })
}

pub fn decode_transfer_completed(data: &[u8]) -> BridgeResult<EthTransferCompletedEvent> {
    let mut reader = TokenReader::decode(&[ParamType::Bytes, ParamType::Uint(256)], data)?;
    Ok(EthTransferCompletedEvent {
        tx_id: reader.bytes()?,
        operation_id: reader.uint()?,
    })
}

pub fn decode_request_new_signatures(data: &[u8]) -> BridgeResult<EthRequestNewSignaturesEvent> {
    let mut reader = TokenReader::decode(&[ParamType::Bytes, ParamType::Uint(256)], data)?;
    Ok(EthRequestNewSignaturesEvent {
        tx_id: reader.bytes()?,
        blocktime: reader.uint()?,
    })
}
