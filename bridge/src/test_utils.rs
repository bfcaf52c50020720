// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic fixtures for aggregator and crypto tests. Keys are fixed
//! so merge results are byte-stable across test runs and fixtures.

use crate::abi::EthTokensLockedEvent;
use crate::aggregator::TransferAggregator;
use crate::config::{TokenConfig, TokenMap, ValidatorConfig, ValidatorSet};
use crate::crypto::{eth_address_string, EthKeyPair, KaonKeyPair};
use crate::encoding::{base58_to_bytes, submission_envelope_digest, BridgeRecordEncoding};
use crate::events::KaonTokensLockedEvent;
use crate::metrics::BridgeMetrics;
use crate::peer_client::{now_ms, PeerClient};
use crate::store::{EthTransferStore, KaonTransferStore};
use crate::types::{BridgeTransfer, SubmittedSignature};
use ethers::types::{Address as EthAddress, H256, U256};
use std::sync::Arc;
use tempfile::TempDir;

pub const TEST_SIGNATURES_EXPIRATION: u64 = 3600;
pub const TEST_KAON_CONTRACT: &str = "1BridgeContract";
pub const TEST_KAON_TOKEN: &str = "1KaonToken";

pub fn test_eth_contract() -> EthAddress {
    EthAddress::repeat_byte(0xbc)
}

pub fn test_eth_token() -> EthAddress {
    EthAddress::repeat_byte(0xaa)
}

pub struct TestValidator {
    pub kaon: KaonKeyPair,
    pub eth: EthKeyPair,
    pub config: ValidatorConfig,
}

pub fn test_validator(index: u8) -> TestValidator {
    let hex = format!("{:02x}", index + 1).repeat(32);
    let kaon = KaonKeyPair::from_hex(&hex).unwrap();
    let eth = EthKeyPair::from_hex(&hex).unwrap();
    let config = ValidatorConfig {
        kaon_address: kaon.address().to_string(),
        eth_address: eth.address().to_string(),
        // unreachable on purpose: broadcasts fail fast and are ignored
        api_url: format!("http://127.0.0.1:9/{}", index),
    };
    TestValidator { kaon, eth, config }
}

pub struct AggregatorFixture {
    pub aggregator: TransferAggregator,
    pub validators: Vec<TestValidator>,
    pub eth_store: Arc<EthTransferStore>,
    pub kaon_store: Arc<KaonTransferStore>,
    pub kaon_contract: Vec<u8>,
    _tmp: TempDir,
}

/// A local validator (index 0) in a set of `n`, wired to temp stores and
/// a broadcaster whose peers are unreachable.
pub fn aggregator_fixture(n: u8) -> AggregatorFixture {
    let validators: Vec<TestValidator> = (0..n).map(test_validator).collect();
    let validator_set = Arc::new(
        ValidatorSet::new(validators.iter().map(|v| v.config.clone()).collect()).unwrap(),
    );
    let tokens = Arc::new(
        TokenMap::new(&[TokenConfig {
            kaon_address: TEST_KAON_TOKEN.to_string(),
            eth_address: eth_address_string(&test_eth_token()),
        }])
        .unwrap(),
    );

    let tmp = TempDir::new().unwrap();
    let eth_store = Arc::new(EthTransferStore::open(tmp.path().join("eth_transfers")).unwrap());
    let kaon_store = Arc::new(KaonTransferStore::open(tmp.path().join("kaon_transfers")).unwrap());

    let metrics = Arc::new(BridgeMetrics::new_for_testing());
    let peers = Arc::new(PeerClient::new(
        validator_set.clone(),
        validators[0].kaon.clone(),
        metrics,
    ));
    let kaon_contract = base58_to_bytes("kaonContract", TEST_KAON_CONTRACT).unwrap();

    let aggregator = TransferAggregator::new(
        validator_set,
        tokens,
        validators[0].kaon.clone(),
        validators[0].eth.clone(),
        kaon_contract.clone(),
        test_eth_contract(),
        TEST_SIGNATURES_EXPIRATION,
        eth_store.clone(),
        kaon_store.clone(),
        peers,
    );

    AggregatorFixture {
        aggregator,
        validators,
        eth_store,
        kaon_store,
        kaon_contract,
        _tmp: tmp,
    }
}

impl AggregatorFixture {
    /// A valid submission envelope signed by validator `signer`.
    pub fn submission(&self, transaction: BridgeTransfer, signer: usize) -> SubmittedSignature {
        let expiration = now_ms() + 60_000;
        self.submission_with_expiration(transaction, signer, expiration)
    }

    pub fn submission_with_expiration(
        &self,
        transaction: BridgeTransfer,
        signer: usize,
        expiration: i64,
    ) -> SubmittedSignature {
        let bytes = transaction.to_canonical_bytes().unwrap();
        let digest = submission_envelope_digest(&bytes, expiration);
        let signature = self.validators[signer].kaon.sign_digest(&digest).unwrap();
        SubmittedSignature {
            transaction,
            signature,
            expiration,
        }
    }
}

pub fn eth_locked_event() -> EthTokensLockedEvent {
    EthTokensLockedEvent {
        from: EthAddress::repeat_byte(0x01),
        token: test_eth_token(),
        amount: U256::from(12_345u64),
        payment: U256::from(67u64),
        relayer: "1Relayer".to_string(),
        recipient: "1Recipient".to_string(),
        metadata: "memo".to_string(),
        blocktime: U256::from(1_700_000_000u64),
        chain: 1,
    }
}

pub fn eth_lock_tx_hash() -> H256 {
    H256::repeat_byte(0x42)
}

pub fn kaon_locked_event(recipient: &EthKeyPair, relayer: &EthKeyPair) -> KaonTokensLockedEvent {
    KaonTokensLockedEvent {
        from: vec![0x05; 25],
        token: base58_to_bytes("token", TEST_KAON_TOKEN).unwrap(),
        amount: "54321".to_string(),
        payment: "12".to_string(),
        relayer: relayer.address().to_string(),
        recipient: recipient.address().to_string(),
        metadata: "memo".to_string(),
        chain_id: 2,
    }
}
