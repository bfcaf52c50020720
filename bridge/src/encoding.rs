// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Canonical byte encoding and the two transfer digest constructors.
//!
//! Every validator must produce bit-identical bytes here: the encoding is
//! the store format, the peer-envelope hashing preimage, and the Kaon
//! digest preimage. Layout rules: integers are fixed-width big-endian,
//! enums are one byte, variable-length fields are length-prefixed with a
//! u32. No field is ever skipped, even when empty.

use crate::error::{BridgeError, BridgeResult};
use crate::types::{
    BridgeMetadata, BridgeTransfer, EthOriginTransfer, KaonOriginTransfer, TransferStatus,
};
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine as _;
use fastcrypto::encoding::{Encoding, Hex};
use fastcrypto::hash::{HashFunction, Keccak256, Sha256};

/// Action tag of the complete-transfer payload on both chains.
pub const ACTION_COMPLETE_TRANSFER: u8 = 1;

const ETH_PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

const TRANSFER_KIND_ETHEREUM: u8 = 0;
const TRANSFER_KIND_KAON: u8 = 1;

pub trait BridgeRecordEncoding: Sized {
    fn to_canonical_bytes(&self) -> BridgeResult<Vec<u8>>;
    fn from_canonical_bytes(bytes: &[u8]) -> BridgeResult<Self>;
}

#[derive(Default)]
struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    fn put_bytes(&mut self, value: &[u8]) -> BridgeResult<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| BridgeError::Serialization("field longer than u32::MAX".to_string()))?;
        self.put_u32(len);
        self.buf.extend_from_slice(value);
        Ok(())
    }

    fn put_str(&mut self, value: &str) -> BridgeResult<()> {
        self.put_bytes(value.as_bytes())
    }

    fn put_str_list(&mut self, values: &[String]) -> BridgeResult<()> {
        let len = u32::try_from(values.len())
            .map_err(|_| BridgeError::Serialization("list longer than u32::MAX".to_string()))?;
        self.put_u32(len);
        for value in values {
            self.put_str(value)?;
        }
        Ok(())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct RecordReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> BridgeResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(BridgeError::Deserialization(format!(
                "record truncated at offset {}",
                self.pos
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> BridgeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> BridgeResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn take_u64(&mut self) -> BridgeResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn take_str(&mut self) -> BridgeResult<String> {
        let len = self.take_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BridgeError::Deserialization(format!("invalid utf-8: {}", e)))
    }

    fn take_str_list(&mut self) -> BridgeResult<Vec<String>> {
        let len = self.take_u32()? as usize;
        let mut values = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            values.push(self.take_str()?);
        }
        Ok(values)
    }

    fn take_status(&mut self) -> BridgeResult<TransferStatus> {
        let raw = self.take_u8()?;
        TransferStatus::from_u8(raw)
            .ok_or_else(|| BridgeError::Deserialization(format!("unknown status {}", raw)))
    }

    fn finish(&self) -> BridgeResult<()> {
        if self.pos != self.bytes.len() {
            return Err(BridgeError::Deserialization(format!(
                "{} trailing bytes after record",
                self.bytes.len() - self.pos
            )));
        }
        Ok(())
    }
}

impl BridgeRecordEncoding for BridgeMetadata {
    fn to_canonical_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut w = RecordWriter::default();
        w.put_u64(self.last_eth_block);
        w.put_u64(self.last_kaon_block);
        Ok(w.into_bytes())
    }

    fn from_canonical_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let mut r = RecordReader::new(bytes);
        let record = Self {
            last_eth_block: r.take_u64()?,
            last_kaon_block: r.take_u64()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl BridgeRecordEncoding for EthOriginTransfer {
    fn to_canonical_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut w = RecordWriter::default();
        w.put_str(&self.id)?;
        w.put_str(&self.from)?;
        w.put_str(&self.eth_token)?;
        w.put_str(&self.kaon_token)?;
        w.put_str(&self.amount)?;
        w.put_str(&self.payment)?;
        w.put_str(&self.recipient)?;
        w.put_str(&self.relayer)?;
        w.put_str(&self.metadata)?;
        w.put_str(&self.hash)?;
        w.put_u64(self.block_number);
        w.put_u64(self.block_time);
        w.put_u64(self.expiration);
        w.put_str(&self.to_chain)?;
        w.put_str_list(&self.validators)?;
        w.put_str_list(&self.signatures)?;
        w.put_u8(self.status.as_u8());
        w.put_str(&self.completion_transaction_id)?;
        Ok(w.into_bytes())
    }

    fn from_canonical_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let mut r = RecordReader::new(bytes);
        let record = Self {
            id: r.take_str()?,
            from: r.take_str()?,
            eth_token: r.take_str()?,
            kaon_token: r.take_str()?,
            amount: r.take_str()?,
            payment: r.take_str()?,
            recipient: r.take_str()?,
            relayer: r.take_str()?,
            metadata: r.take_str()?,
            hash: r.take_str()?,
            block_number: r.take_u64()?,
            block_time: r.take_u64()?,
            expiration: r.take_u64()?,
            to_chain: r.take_str()?,
            validators: r.take_str_list()?,
            signatures: r.take_str_list()?,
            status: r.take_status()?,
            completion_transaction_id: r.take_str()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl BridgeRecordEncoding for KaonOriginTransfer {
    fn to_canonical_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut w = RecordWriter::default();
        w.put_str(&self.id)?;
        w.put_str(&self.op_id)?;
        w.put_str(&self.from)?;
        w.put_str(&self.eth_token)?;
        w.put_str(&self.kaon_token)?;
        w.put_str(&self.amount)?;
        w.put_str(&self.payment)?;
        w.put_str(&self.recipient)?;
        w.put_str(&self.relayer)?;
        w.put_str(&self.metadata)?;
        w.put_str(&self.hash)?;
        w.put_u64(self.block_number);
        w.put_u64(self.block_time);
        w.put_u64(self.expiration);
        w.put_str(&self.to_chain)?;
        w.put_str_list(&self.validators)?;
        w.put_str_list(&self.signatures)?;
        w.put_u8(self.status.as_u8());
        w.put_str(&self.completion_transaction_id)?;
        Ok(w.into_bytes())
    }

    fn from_canonical_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let mut r = RecordReader::new(bytes);
        let record = Self {
            id: r.take_str()?,
            op_id: r.take_str()?,
            from: r.take_str()?,
            eth_token: r.take_str()?,
            kaon_token: r.take_str()?,
            amount: r.take_str()?,
            payment: r.take_str()?,
            recipient: r.take_str()?,
            relayer: r.take_str()?,
            metadata: r.take_str()?,
            hash: r.take_str()?,
            block_number: r.take_u64()?,
            block_time: r.take_u64()?,
            expiration: r.take_u64()?,
            to_chain: r.take_str()?,
            validators: r.take_str_list()?,
            signatures: r.take_str_list()?,
            status: r.take_status()?,
            completion_transaction_id: r.take_str()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl BridgeRecordEncoding for BridgeTransfer {
    fn to_canonical_bytes(&self) -> BridgeResult<Vec<u8>> {
        let mut bytes = Vec::new();
        match self {
            BridgeTransfer::Ethereum(t) => {
                bytes.push(TRANSFER_KIND_ETHEREUM);
                bytes.extend_from_slice(&t.to_canonical_bytes()?);
            }
            BridgeTransfer::Kaon(t) => {
                bytes.push(TRANSFER_KIND_KAON);
                bytes.extend_from_slice(&t.to_canonical_bytes()?);
            }
        }
        Ok(bytes)
    }

    fn from_canonical_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let Some((kind, rest)) = bytes.split_first() else {
            return Err(BridgeError::Deserialization("empty transfer".to_string()));
        };
        match *kind {
            TRANSFER_KIND_ETHEREUM => Ok(BridgeTransfer::Ethereum(
                EthOriginTransfer::from_canonical_bytes(rest)?,
            )),
            TRANSFER_KIND_KAON => Ok(BridgeTransfer::Kaon(
                KaonOriginTransfer::from_canonical_bytes(rest)?,
            )),
            other => Err(BridgeError::Deserialization(format!(
                "unknown transfer kind {}",
                other
            ))),
        }
    }
}

/// Kaon-destination digest, verified by the Kaon bridge contract.
///
/// Returns the raw 32-byte SHA-256 digest (the signing preimage) and its
/// padded base64url presentation (the stored `hash`).
#[allow(clippy::too_many_arguments)]
pub fn kaon_complete_transfer_digest(
    tx_id: &[u8],
    kaon_token: &[u8],
    recipient: &[u8],
    relayer: &[u8],
    amount: u64,
    payment: u64,
    contract_id: &[u8],
    metadata: &str,
    expiration: u64,
    chain: u32,
) -> BridgeResult<([u8; 32], String)> {
    let mut w = RecordWriter::default();
    w.put_u8(ACTION_COMPLETE_TRANSFER);
    w.put_bytes(tx_id)?;
    w.put_bytes(kaon_token)?;
    w.put_bytes(recipient)?;
    w.put_bytes(relayer)?;
    w.put_u64(amount);
    w.put_u64(payment);
    w.put_bytes(contract_id)?;
    w.put_str(metadata)?;
    w.put_u64(expiration);
    w.put_u32(chain);
    let digest = Sha256::digest(w.into_bytes()).digest;
    let encoded = BASE64_URL.encode(digest);
    Ok((digest, encoded))
}

/// Ethereum-destination digest pair.
pub struct EthTransferDigest {
    /// keccak of the packed fields
    pub packed_hash: [u8; 32],
    /// keccak of the personal-message-prefixed packed hash; this is what
    /// gets signed and what the contract recovers against
    pub digest: [u8; 32],
    /// 0x-hex of `digest`, the stored `hash`
    pub hex: String,
}

fn left_pad_32(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

fn left_pad_4(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Ethereum-destination digest, verified by the Ethereum bridge contract.
/// Packed-width keccak, re-hashed under the personal message prefix.
#[allow(clippy::too_many_arguments)]
pub fn eth_complete_transfer_hash(
    tx_id: &[u8],
    op_id: u64,
    eth_token: &[u8],
    relayer: &[u8],
    recipient: &[u8],
    amount: u64,
    payment: u64,
    metadata: &str,
    eth_contract: &[u8],
    expiration: u64,
    chain_id: u32,
) -> EthTransferDigest {
    let mut packed = Vec::new();
    packed.extend_from_slice(&left_pad_32(ACTION_COMPLETE_TRANSFER as u64));
    packed.extend_from_slice(tx_id);
    packed.extend_from_slice(&left_pad_32(op_id));
    packed.extend_from_slice(eth_token);
    packed.extend_from_slice(relayer);
    packed.extend_from_slice(recipient);
    packed.extend_from_slice(&left_pad_32(amount));
    packed.extend_from_slice(&left_pad_32(payment));
    packed.extend_from_slice(metadata.as_bytes());
    packed.extend_from_slice(eth_contract);
    packed.extend_from_slice(&left_pad_32(expiration));
    packed.extend_from_slice(&left_pad_4(chain_id));

    let packed_hash = Keccak256::digest(&packed).digest;

    let mut prefixed = Vec::with_capacity(ETH_PERSONAL_MESSAGE_PREFIX.len() + 32);
    prefixed.extend_from_slice(ETH_PERSONAL_MESSAGE_PREFIX);
    prefixed.extend_from_slice(&packed_hash);
    let digest = Keccak256::digest(&prefixed).digest;

    EthTransferDigest {
        packed_hash,
        digest,
        hex: format!("0x{}", Hex::encode(digest)),
    }
}

/// Preimage digest of a peer submission envelope:
/// `SHA256(canonical_bytes(transfer) || ascii(expiration))`.
pub fn submission_envelope_digest(transfer_bytes: &[u8], expiration: i64) -> [u8; 32] {
    let mut preimage = transfer_bytes.to_vec();
    preimage.extend_from_slice(expiration.to_string().as_bytes());
    Sha256::digest(preimage).digest
}

/// Parse a numeric string the way the wire carries them: decimal, or
/// 0x-prefixed hex. Anything that does not fit u64 is rejected rather than
/// truncated.
pub fn parse_u64_field(name: &str, value: &str) -> BridgeResult<u64> {
    let trimmed = value.trim();
    let parsed = if let Some(hex) = trimmed.strip_prefix("0x").or(trimmed.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        trimmed.parse::<u64>()
    };
    parsed.map_err(|_| BridgeError::Overflow(format!("Invalid {}", name)))
}

pub fn parse_u32_field(name: &str, value: &str) -> BridgeResult<u32> {
    let wide = parse_u64_field(name, value)?;
    u32::try_from(wide).map_err(|_| BridgeError::Overflow(format!("Invalid {}", name)))
}

pub fn hex_to_bytes(name: &str, value: &str) -> BridgeResult<Vec<u8>> {
    let stripped = value.trim_start_matches("0x");
    Hex::decode(stripped).map_err(|_| BridgeError::Deserialization(format!("Invalid {}", name)))
}

pub fn base58_to_bytes(name: &str, value: &str) -> BridgeResult<Vec<u8>> {
    bs58::decode(value)
        .into_vec()
        .map_err(|_| BridgeError::Deserialization(format!("Invalid {}", name)))
}
