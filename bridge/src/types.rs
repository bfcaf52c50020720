// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Per-transfer lifecycle. `Completed` is terminal: once set, only the
/// completion transaction id may still change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TransferStatus {
    #[default]
    #[serde(rename = "gathering_signatures")]
    GatheringSignatures,
    #[serde(rename = "signed")]
    Signed,
    #[serde(rename = "completed")]
    Completed,
}

impl TransferStatus {
    pub fn as_u8(&self) -> u8 {
        match self {
            TransferStatus::GatheringSignatures => 0,
            TransferStatus::Signed => 1,
            TransferStatus::Completed => 2,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TransferStatus::GatheringSignatures),
            1 => Some(TransferStatus::Signed),
            2 => Some(TransferStatus::Completed),
            _ => None,
        }
    }
}

/// A transfer locked on Ethereum, to be released on Kaon.
///
/// `recipient`, `relayer` and `validators` are Kaon Base58 strings, and
/// `hash` is the base64url SHA-256 digest the Kaon contract verifies.
/// Keyed in the store by `id` (the Ethereum lock transaction hash).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EthOriginTransfer {
    pub id: String,
    pub from: String,
    pub eth_token: String,
    pub kaon_token: String,
    pub amount: String,
    pub payment: String,
    pub recipient: String,
    pub relayer: String,
    pub metadata: String,
    pub hash: String,
    pub block_number: u64,
    pub block_time: u64,
    pub expiration: u64,
    pub to_chain: String,
    pub validators: Vec<String>,
    pub signatures: Vec<String>,
    pub status: TransferStatus,
    pub completion_transaction_id: String,
}

/// A transfer locked on Kaon, to be released on Ethereum.
///
/// `recipient`, `relayer` and `validators` are 0x-hex Ethereum addresses,
/// and `hash` is the 0x-hex prefixed keccak digest the Ethereum contract
/// verifies. Keyed in the store by `id + "-" + op_id`, because one Kaon
/// transaction can carry several bridge operations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KaonOriginTransfer {
    pub id: String,
    pub op_id: String,
    pub from: String,
    pub eth_token: String,
    pub kaon_token: String,
    pub amount: String,
    pub payment: String,
    pub recipient: String,
    pub relayer: String,
    pub metadata: String,
    pub hash: String,
    pub block_number: u64,
    pub block_time: u64,
    pub expiration: u64,
    pub to_chain: String,
    pub validators: Vec<String>,
    pub signatures: Vec<String>,
    pub status: TransferStatus,
    pub completion_transaction_id: String,
}

impl KaonOriginTransfer {
    pub fn store_key(id: &str, op_id: &str) -> String {
        format!("{}-{}", id, op_id)
    }

    pub fn key(&self) -> String {
        Self::store_key(&self.id, &self.op_id)
    }
}

/// Wire form of a transfer, tagged by origin chain. All fields are emitted
/// even when unset so a peer can recompute the digest unambiguously.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeTransfer {
    #[serde(rename = "ethereum")]
    Ethereum(EthOriginTransfer),
    #[serde(rename = "kaon")]
    Kaon(KaonOriginTransfer),
}

impl BridgeTransfer {
    pub fn id(&self) -> &str {
        match self {
            BridgeTransfer::Ethereum(t) => &t.id,
            BridgeTransfer::Kaon(t) => &t.id,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            BridgeTransfer::Ethereum(t) => &t.hash,
            BridgeTransfer::Kaon(t) => &t.hash,
        }
    }

    pub fn expiration(&self) -> u64 {
        match self {
            BridgeTransfer::Ethereum(t) => t.expiration,
            BridgeTransfer::Kaon(t) => t.expiration,
        }
    }

    pub fn validators(&self) -> &[String] {
        match self {
            BridgeTransfer::Ethereum(t) => &t.validators,
            BridgeTransfer::Kaon(t) => &t.validators,
        }
    }

    pub fn signatures(&self) -> &[String] {
        match self {
            BridgeTransfer::Ethereum(t) => &t.signatures,
            BridgeTransfer::Kaon(t) => &t.signatures,
        }
    }
}

/// Envelope a validator POSTs to its peers' `/SubmitSignature` endpoint.
/// The envelope signature is always produced with the Kaon scheme over
/// `SHA256(canonical_bytes(transaction) || ascii(expiration))`, regardless
/// of the transfer kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedSignature {
    pub transaction: BridgeTransfer,
    pub signature: String,
    pub expiration: i64,
}

/// Resume cursors for the two streamers. Seeded from the configured start
/// blocks on first init and rewritten on clean shutdown only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BridgeMetadata {
    pub last_eth_block: u64,
    pub last_kaon_block: u64,
}
