// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Signing and recovery for the two verifier schemes.
//!
//! Kaon verifies compact recoverable secp256k1 signatures over a SHA-256
//! digest, exchanged as padded base64url, with the recovery header byte
//! first (`27 + recovery_id + 4`, the compressed-key convention). Kaon
//! addresses are Base58Check over `RIPEMD160(SHA256(compressed pubkey))`
//! with version byte zero.
//!
//! Ethereum verifies 65-byte `r || s || v` signatures over a prefixed
//! keccak digest, exchanged as 0x-hex, with `v = recovery_id + 27`.
//! Ethereum addresses are the last 20 bytes of the keccak of the
//! uncompressed public key, printed in EIP-55 checksum form.

use crate::error::{BridgeError, BridgeResult};
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine as _;
use ethers::core::k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use ethers::core::k256::elliptic_curve::sec1::ToEncodedPoint;
use ethers::types::Address as EthAddress;
use ethers::utils::to_checksum;
use fastcrypto::encoding::{Encoding, Hex};
use fastcrypto::hash::{HashFunction, Keccak256, Sha256};
use ripemd::{Digest as _, Ripemd160};

const KAON_ADDRESS_VERSION: u8 = 0x00;
const COMPACT_SIG_HEADER_BASE: u8 = 27;
const COMPACT_SIG_COMPRESSED_FLAG: u8 = 4;
const ETH_RECOVERY_OFFSET: u8 = 27;

fn signing_key_from_hex(hex_key: &str) -> BridgeResult<SigningKey> {
    let stripped = hex_key.trim_start_matches("0x");
    let bytes = Hex::decode(stripped)
        .map_err(|e| BridgeError::Config(format!("invalid private key hex: {}", e)))?;
    SigningKey::from_slice(&bytes)
        .map_err(|e| BridgeError::Config(format!("invalid private key: {}", e)))
}

/// Key used to sign digests that the Kaon bridge contract verifies.
#[derive(Clone)]
pub struct KaonKeyPair {
    key: SigningKey,
    address: String,
}

impl KaonKeyPair {
    pub fn from_hex(hex_key: &str) -> BridgeResult<Self> {
        let key = signing_key_from_hex(hex_key)?;
        let address = kaon_address_from_pubkey(key.verifying_key());
        Ok(Self { key, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Compact recoverable signature over a precomputed 32-byte digest,
    /// padded base64url.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> BridgeResult<String> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| BridgeError::SignatureInvalid(e.to_string()))?;
        let mut bytes = Vec::with_capacity(65);
        bytes.push(COMPACT_SIG_HEADER_BASE + recovery_id.to_byte() + COMPACT_SIG_COMPRESSED_FLAG);
        bytes.extend_from_slice(&signature.to_bytes());
        Ok(BASE64_URL.encode(bytes))
    }
}

/// Key used to sign digests that the Ethereum bridge contract verifies.
#[derive(Clone)]
pub struct EthKeyPair {
    key: SigningKey,
    address: String,
}

impl EthKeyPair {
    pub fn from_hex(hex_key: &str) -> BridgeResult<Self> {
        let key = signing_key_from_hex(hex_key)?;
        let address = eth_address_string(&eth_address_from_pubkey(key.verifying_key()));
        Ok(Self { key, address })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// 65-byte `r || s || v` signature over a precomputed 32-byte digest,
    /// recovery byte offset by +27, 0x-hex.
    pub fn sign_digest(&self, digest: &[u8; 32]) -> BridgeResult<String> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest)
            .map_err(|e| BridgeError::SignatureInvalid(e.to_string()))?;
        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&signature.to_bytes());
        bytes.push(recovery_id.to_byte() + ETH_RECOVERY_OFFSET);
        Ok(format!("0x{}", Hex::encode(bytes)))
    }
}

/// Recover the Kaon address of the signer of `digest` from a compact
/// base64url signature.
pub fn recover_kaon_address(signature_b64: &str, digest: &[u8; 32]) -> BridgeResult<String> {
    let bytes = BASE64_URL
        .decode(signature_b64)
        .map_err(|e| BridgeError::SignatureInvalid(format!("invalid base64url: {}", e)))?;
    if bytes.len() != 65 {
        return Err(BridgeError::SignatureInvalid(format!(
            "compact signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[0] < COMPACT_SIG_HEADER_BASE {
        return Err(BridgeError::SignatureInvalid(
            "invalid compact signature header".to_string(),
        ));
    }
    let recovery_id = RecoveryId::from_byte((bytes[0] - COMPACT_SIG_HEADER_BASE) & 3)
        .ok_or_else(|| BridgeError::SignatureInvalid("invalid recovery id".to_string()))?;
    let signature = Signature::from_slice(&bytes[1..])
        .map_err(|e| BridgeError::SignatureInvalid(e.to_string()))?;
    let pubkey = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|e| BridgeError::SignatureInvalid(e.to_string()))?;
    Ok(kaon_address_from_pubkey(&pubkey))
}

/// Recover the Ethereum address of the signer of `digest` from a 0x-hex
/// 65-byte signature whose recovery byte carries the +27 offset.
pub fn recover_eth_address(signature_hex: &str, digest: &[u8; 32]) -> BridgeResult<String> {
    let stripped = signature_hex.trim_start_matches("0x");
    let bytes = Hex::decode(stripped)
        .map_err(|e| BridgeError::SignatureInvalid(format!("invalid hex: {}", e)))?;
    if bytes.len() != 65 {
        return Err(BridgeError::SignatureInvalid(format!(
            "signature must be 65 bytes, got {}",
            bytes.len()
        )));
    }
    if bytes[64] < ETH_RECOVERY_OFFSET {
        return Err(BridgeError::SignatureInvalid(
            "recovery byte below 27".to_string(),
        ));
    }
    let recovery_id = RecoveryId::from_byte(bytes[64] - ETH_RECOVERY_OFFSET)
        .ok_or_else(|| BridgeError::SignatureInvalid("invalid recovery id".to_string()))?;
    let signature = Signature::from_slice(&bytes[..64])
        .map_err(|e| BridgeError::SignatureInvalid(e.to_string()))?;
    let pubkey = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
        .map_err(|e| BridgeError::SignatureInvalid(e.to_string()))?;
    Ok(eth_address_string(&eth_address_from_pubkey(&pubkey)))
}

pub fn kaon_address_from_pubkey(pubkey: &VerifyingKey) -> String {
    let compressed = pubkey.to_encoded_point(true);
    let sha = Sha256::digest(compressed.as_bytes()).digest;
    let hash160 = Ripemd160::digest(sha);
    bs58::encode(hash160.as_slice())
        .with_check_version(KAON_ADDRESS_VERSION)
        .into_string()
}

pub fn eth_address_from_pubkey(pubkey: &VerifyingKey) -> EthAddress {
    let encoded = pubkey.to_encoded_point(false);
    // skip the 0x04 uncompressed-point prefix
    let raw = &encoded.as_bytes()[1..];
    let hash = Keccak256::digest(raw).digest;
    EthAddress::from_slice(&hash[12..])
}

/// EIP-55 checksum form, the canonical string form of an Ethereum address
/// everywhere in this crate.
pub fn eth_address_string(address: &EthAddress) -> String {
    to_checksum(address, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY_1: &str = "e42c82337ce12d4a7ad6cd65876d91b2ab6594fd50cdab1737c91773ba7451db";
    const TEST_KEY_2: &str = "1aacd610da3d0cc691a04b83b01c34c6c65cda0fe8d502df25ff4b3185c85687";

    #[test]
    fn test_kaon_sign_and_recover_roundtrip() {
        let kp = KaonKeyPair::from_hex(TEST_KEY_1).unwrap();
        let digest = Sha256::digest(b"transfer bytes").digest;
        let sig = kp.sign_digest(&digest).unwrap();
        let recovered = recover_kaon_address(&sig, &digest).unwrap();
        assert_eq!(recovered, kp.address());

        // a different digest recovers a different key, hence address
        let other = Sha256::digest(b"other bytes").digest;
        let recovered = recover_kaon_address(&sig, &other).unwrap();
        assert_ne!(recovered, kp.address());
    }

    #[test]
    fn test_kaon_signature_header_carries_compressed_flag() {
        let kp = KaonKeyPair::from_hex(TEST_KEY_1).unwrap();
        let digest = Sha256::digest(b"abc").digest;
        let sig = BASE64_URL.decode(kp.sign_digest(&digest).unwrap()).unwrap();
        assert_eq!(sig.len(), 65);
        assert!(sig[0] >= 31 && sig[0] <= 34);
    }

    #[test]
    fn test_eth_sign_and_recover_roundtrip() {
        let kp = EthKeyPair::from_hex(TEST_KEY_2).unwrap();
        let digest = Keccak256::digest(b"prefixed transfer hash").digest;
        let sig = kp.sign_digest(&digest).unwrap();
        assert!(sig.starts_with("0x"));
        let recovered = recover_eth_address(&sig, &digest).unwrap();
        assert_eq!(recovered, kp.address());
    }

    #[test]
    fn test_eth_recovery_byte_is_offset() {
        let kp = EthKeyPair::from_hex(TEST_KEY_2).unwrap();
        let digest = Keccak256::digest(b"abc").digest;
        let sig = Hex::decode(kp.sign_digest(&digest).unwrap().trim_start_matches("0x")).unwrap();
        assert_eq!(sig.len(), 65);
        assert!(sig[64] == 27 || sig[64] == 28);
    }

    #[test]
    fn test_tampered_signature_rejected_or_mismatched() {
        let kp = KaonKeyPair::from_hex(TEST_KEY_1).unwrap();
        let digest = Sha256::digest(b"payload").digest;
        let mut bytes = BASE64_URL.decode(kp.sign_digest(&digest).unwrap()).unwrap();
        bytes[10] ^= 0x01;
        let tampered = BASE64_URL.encode(&bytes);
        match recover_kaon_address(&tampered, &digest) {
            Ok(address) => assert_ne!(address, kp.address()),
            Err(e) => assert!(matches!(e, BridgeError::SignatureInvalid(_))),
        }
    }

    #[test]
    fn test_eth_address_derivation_known_vector() {
        // Example from ethers-core utils tests
        let pubkey = VerifyingKey::from_sec1_bytes(
            &Hex::decode("0376698beebe8ee5c74d8cc50ab84ac301ee8f10af6f28d0ffd6adf4d6d3b9b762")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(
            eth_address_string(&eth_address_from_pubkey(&pubkey)),
            "0x0Ac1dF02185025F65202660F8167210A80dD5086"
        );
    }

    #[test]
    fn test_kaon_address_shape() {
        let kp = KaonKeyPair::from_hex(TEST_KEY_1).unwrap();
        // Base58Check with version 0x00 decodes back to 21 bytes + checksum
        let payload = bs58::decode(kp.address()).into_vec().unwrap();
        assert_eq!(payload.len(), 25);
        assert_eq!(payload[0], 0x00);
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        let digest = [0u8; 32];
        assert!(recover_kaon_address("not-base64!!", &digest).is_err());
        assert!(recover_kaon_address(&BASE64_URL.encode([0u8; 10]), &digest).is_err());
        assert!(recover_eth_address("0x1234", &digest).is_err());
    }
}
