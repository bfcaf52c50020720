// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The per-transfer signature aggregation state machine.
//!
//! The aggregator is the only writer to the two transfer stores and the
//! enforcement point for the stored-record invariants: the persisted hash
//! always equals the digest recomputed from the record's own fields,
//! validator/signature arrays stay parallel and duplicate-free, and
//! `completed` is terminal. There are two parallel implementations, one
//! per origin chain, because the two destinations verify incompatible
//! signature schemes; they share the signature-map merge and status
//! helpers.
//!
//! Locking protocol: every read-modify-write holds the store lock; peer
//! broadcast happens between the commit and a second locked merge pass so
//! network waits never block other writers.

use crate::abi::{EthRequestNewSignaturesEvent, EthTokensLockedEvent, EthTransferCompletedEvent};
use crate::config::{TokenMap, ValidatorSet};
use crate::crypto::{
    eth_address_string, recover_eth_address, recover_kaon_address, EthKeyPair, KaonKeyPair,
};
use crate::encoding::{
    base58_to_bytes, eth_complete_transfer_hash, hex_to_bytes, kaon_complete_transfer_digest,
    parse_u32_field, parse_u64_field, submission_envelope_digest, BridgeRecordEncoding,
};
use crate::error::{BridgeError, BridgeResult};
use crate::events::{
    KaonRequestNewSignaturesEvent, KaonTokensLockedEvent, KaonTransferCompletedEvent,
};
use crate::peer_client::{now_ms, PeerClient};
use crate::store::{EthTransferStore, KaonTransferStore};
use crate::types::{
    BridgeTransfer, EthOriginTransfer, KaonOriginTransfer, SubmittedSignature, TransferStatus,
};
use ethers::types::{Address as EthAddress, H256, U256};
use fastcrypto::encoding::{Encoding, Hex};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TransferAggregator {
    validators: Arc<ValidatorSet>,
    tokens: Arc<TokenMap>,
    kaon_key: KaonKeyPair,
    eth_key: EthKeyPair,
    kaon_contract: Vec<u8>,
    eth_contract: EthAddress,
    signatures_expiration: u64,
    eth_transfers: Arc<EthTransferStore>,
    kaon_transfers: Arc<KaonTransferStore>,
    peers: Arc<PeerClient>,
}

fn u256_to_u64(name: &str, value: U256) -> BridgeResult<u64> {
    if value > U256::from(u64::MAX) {
        return Err(BridgeError::Overflow(format!("Invalid {}", name)));
    }
    Ok(value.as_u64())
}

/// Rebuild a validator -> signature map from the parallel arrays of a
/// stored record.
fn signature_map(validators: &[String], signatures: &[String]) -> BTreeMap<String, String> {
    validators
        .iter()
        .cloned()
        .zip(signatures.iter().cloned())
        .collect()
}

/// Union merge preserving the base (locally stored) signature on conflict.
fn merge_missing(base: &mut BTreeMap<String, String>, incoming: &BTreeMap<String, String>) {
    for (validator, signature) in incoming {
        base.entry(validator.clone()).or_insert(signature.clone());
    }
}

/// Flatten the map back into parallel arrays. The order is unspecified by
/// the protocol but must be consistent within one write; the sorted map
/// iteration gives a deterministic one.
fn map_to_arrays(map: &BTreeMap<String, String>) -> (Vec<String>, Vec<String>) {
    let mut validators = Vec::with_capacity(map.len());
    let mut signatures = Vec::with_capacity(map.len());
    for (validator, signature) in map {
        validators.push(validator.clone());
        signatures.push(signature.clone());
    }
    (validators, signatures)
}

impl TransferAggregator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        validators: Arc<ValidatorSet>,
        tokens: Arc<TokenMap>,
        kaon_key: KaonKeyPair,
        eth_key: EthKeyPair,
        kaon_contract: Vec<u8>,
        eth_contract: EthAddress,
        signatures_expiration: u64,
        eth_transfers: Arc<EthTransferStore>,
        kaon_transfers: Arc<KaonTransferStore>,
        peers: Arc<PeerClient>,
    ) -> Self {
        Self {
            validators,
            tokens,
            kaon_key,
            eth_key,
            kaon_contract,
            eth_contract,
            signatures_expiration,
            eth_transfers,
            kaon_transfers,
            peers,
        }
    }

    pub fn local_kaon_address(&self) -> &str {
        self.kaon_key.address()
    }

    pub fn local_eth_address(&self) -> &str {
        self.eth_key.address()
    }

    // ---------------------------------------------------------------
    // Ethereum-origin transfers (destination Kaon, Kaon scheme)
    // ---------------------------------------------------------------

    /// Kaon digest of an Ethereum-origin transfer from its stored string
    /// fields. Numeric strings must fit the widths the contract hashes.
    fn eth_origin_digest(&self, transfer: &EthOriginTransfer) -> BridgeResult<([u8; 32], String)> {
        let tx_id = hex_to_bytes("transactionId", &transfer.id)?;
        let amount = parse_u64_field("amount", &transfer.amount)?;
        let payment = parse_u64_field("payment", &transfer.payment)?;
        let chain = parse_u32_field("chain", &transfer.to_chain)?;
        let kaon_token = base58_to_bytes("kaonToken", &transfer.kaon_token)?;
        let recipient = base58_to_bytes("recipient", &transfer.recipient)?;
        let relayer = base58_to_bytes("relayer", &transfer.relayer)?;
        kaon_complete_transfer_digest(
            &tx_id,
            &kaon_token,
            &recipient,
            &relayer,
            amount,
            payment,
            &self.kaon_contract,
            &transfer.metadata,
            transfer.expiration,
            chain,
        )
    }

    pub async fn handle_eth_tokens_locked(
        &self,
        event: &EthTokensLockedEvent,
        block_number: u64,
        tx_hash: H256,
    ) -> BridgeResult<()> {
        let tx_id_hex = format!("{:?}", tx_hash);
        let eth_token = eth_address_string(&event.token);
        let kaon_token = self
            .tokens
            .kaon_for_eth(&eth_token)
            .ok_or_else(|| BridgeError::Config(format!("unknown eth token {}", eth_token)))?
            .to_string();

        let amount = u256_to_u64("amount", event.amount)?;
        let payment = u256_to_u64("payment", event.payment)?;
        let blocktime = u256_to_u64("blocktime", event.blocktime)?;
        let expiration = blocktime + self.signatures_expiration;

        let kaon_token_bytes = base58_to_bytes("kaonToken", &kaon_token)?;
        let recipient = base58_to_bytes("recipient", &event.recipient)?;
        let relayer = base58_to_bytes("relayer", &event.relayer)?;

        let (digest, hash_b64) = kaon_complete_transfer_digest(
            tx_hash.as_bytes(),
            &kaon_token_bytes,
            &recipient,
            &relayer,
            amount,
            payment,
            &self.kaon_contract,
            &event.metadata,
            expiration,
            event.chain,
        )?;
        let local_signature = self.kaon_key.sign_digest(&digest)?;

        info!(
            "new Eth TokensLockedEvent | block: {} | tx: {} | eth token: {} | kaon token: {} | amount: {} | chain: {}",
            block_number, tx_id_hex, eth_token, kaon_token, event.amount, event.chain
        );

        let transfer = {
            let _guard = self.eth_transfers.lock().await;
            let mut transfer = match self.eth_transfers.get(&tx_id_hex)? {
                Some(prior) => {
                    if !prior.hash.is_empty() && prior.hash != hash_b64 {
                        return Err(BridgeError::DigestMismatch {
                            expected: prior.hash,
                            calculated: hash_b64,
                        });
                    }
                    prior
                }
                None => EthOriginTransfer::default(),
            };

            let mut signatures = signature_map(&transfer.validators, &transfer.signatures);
            signatures
                .entry(self.kaon_key.address().to_string())
                .or_insert(local_signature);
            (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);

            transfer.id = tx_id_hex.clone();
            transfer.from = eth_address_string(&event.from);
            transfer.eth_token = eth_token;
            transfer.kaon_token = kaon_token;
            transfer.amount = event.amount.to_string();
            transfer.payment = event.payment.to_string();
            transfer.recipient = event.recipient.clone();
            transfer.relayer = event.relayer.clone();
            transfer.metadata = event.metadata.clone();
            transfer.hash = hash_b64;
            transfer.block_number = block_number;
            transfer.block_time = blocktime;
            transfer.expiration = expiration;
            transfer.to_chain = event.chain.to_string();
            if transfer.status != TransferStatus::Completed {
                transfer.status = TransferStatus::GatheringSignatures;
            }

            self.eth_transfers.put(&tx_id_hex, &transfer)?;
            transfer
        };

        // fan out with the lock released, then merge what came back
        let peer_signatures = self
            .peers
            .broadcast(&BridgeTransfer::Ethereum(transfer))
            .await;
        self.merge_eth_origin_broadcast(&tx_id_hex, &peer_signatures)
            .await
    }

    /// Post-broadcast merge for an Ethereum-origin transfer. Peer
    /// signatures are keyed by Kaon address already.
    async fn merge_eth_origin_broadcast(
        &self,
        tx_id_hex: &str,
        peer_signatures: &BTreeMap<String, String>,
    ) -> BridgeResult<()> {
        let _guard = self.eth_transfers.lock().await;
        let Some(mut transfer) = self.eth_transfers.get(tx_id_hex)? else {
            return Err(BridgeError::Backend(format!(
                "transfer {} vanished during broadcast",
                tx_id_hex
            )));
        };
        let mut signatures = signature_map(&transfer.validators, &transfer.signatures);
        merge_missing(&mut signatures, peer_signatures);
        (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);

        let n = self.validators.len();
        if transfer.status != TransferStatus::Completed
            && transfer.signatures.len() >= ((n / 2) * 10) / 7
        {
            transfer.status = TransferStatus::Signed;
        }
        self.eth_transfers.put(tx_id_hex, &transfer)
    }

    pub async fn handle_kaon_transfer_completed(
        &self,
        event: &KaonTransferCompletedEvent,
        kaon_tx_id: &str,
        sequence: u32,
    ) -> BridgeResult<()> {
        let eth_tx_id = format!("0x{}", Hex::encode(&event.tx_id));
        let completion_id = format!("{}-{}", kaon_tx_id, sequence);
        info!(
            "new Kaon transfer_completed_event | eth tx: {} | kaon tx: {}",
            eth_tx_id, completion_id
        );

        let _guard = self.eth_transfers.lock().await;
        let mut transfer = match self.eth_transfers.get(&eth_tx_id)? {
            Some(transfer) => transfer,
            None => {
                warn!("ethereum transfer {} does not exist", eth_tx_id);
                EthOriginTransfer {
                    id: eth_tx_id.clone(),
                    ..Default::default()
                }
            }
        };
        transfer.status = TransferStatus::Completed;
        transfer.completion_transaction_id = completion_id;
        self.eth_transfers.put(&eth_tx_id, &transfer)
    }

    pub async fn handle_eth_request_new_signatures(
        &self,
        event: &EthRequestNewSignaturesEvent,
    ) -> BridgeResult<()> {
        let tx_id_hex = format!("0x{}", Hex::encode(&event.tx_id));
        let blocktime = u256_to_u64("blocktime", event.blocktime)?;
        let new_expiration = blocktime + self.signatures_expiration;

        let transfer = {
            let _guard = self.eth_transfers.lock().await;
            let prior = match self.eth_transfers.get(&tx_id_hex)? {
                Some(prior) if prior.status != TransferStatus::Completed => prior,
                _ => {
                    info!("Eth tx {} does not exist or is already completed", tx_id_hex);
                    return Ok(());
                }
            };

            // signatures may only be refreshed one full window past expiry
            let allowed_blocktime = prior.expiration + self.signatures_expiration;
            if blocktime < allowed_blocktime {
                info!(
                    "Cannot request new signatures for Eth tx {} yet (current blocktime {} vs allowed blocktime {})",
                    tx_id_hex, blocktime, allowed_blocktime
                );
                return Ok(());
            }

            let mut transfer = prior;
            transfer.expiration = new_expiration;
            let (digest, hash_b64) = self.eth_origin_digest(&transfer)?;
            let local_signature = self.kaon_key.sign_digest(&digest)?;

            // resign locally, keep only peer signatures that still verify
            let mut signatures = BTreeMap::new();
            signatures.insert(self.kaon_key.address().to_string(), local_signature);
            for (validator, signature) in transfer.validators.iter().zip(&transfer.signatures) {
                if signatures.contains_key(validator) {
                    continue;
                }
                if let Ok(recovered) = recover_kaon_address(signature, &digest) {
                    if recovered == *validator {
                        signatures.insert(validator.clone(), signature.clone());
                    }
                }
            }

            transfer.hash = hash_b64;
            (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);
            transfer.status = TransferStatus::GatheringSignatures;
            let n = self.validators.len();
            if transfer.signatures.len() >= ((((n / 2) * 10) / 3) * 2) / 10 + 1 {
                transfer.status = TransferStatus::Signed;
            }
            self.eth_transfers.put(&tx_id_hex, &transfer)?;
            transfer
        };

        let peer_signatures = self
            .peers
            .broadcast(&BridgeTransfer::Ethereum(transfer))
            .await;

        let _guard = self.eth_transfers.lock().await;
        let Some(mut transfer) = self.eth_transfers.get(&tx_id_hex)? else {
            return Err(BridgeError::Backend(format!(
                "transfer {} vanished during broadcast",
                tx_id_hex
            )));
        };
        let mut signatures = signature_map(&transfer.validators, &transfer.signatures);
        merge_missing(&mut signatures, &peer_signatures);
        (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);
        let n = self.validators.len();
        if transfer.status != TransferStatus::Completed
            && transfer.signatures.len() >= ((((n / 7) * 20) / 5) * 6) / 12 + 3
        {
            transfer.status = TransferStatus::Signed;
        }
        self.eth_transfers.put(&tx_id_hex, &transfer)
    }

    // ---------------------------------------------------------------
    // Kaon-origin transfers (destination Ethereum, Ethereum scheme)
    // ---------------------------------------------------------------

    /// Ethereum digest of a Kaon-origin transfer from its stored string
    /// fields.
    fn kaon_origin_digest(
        &self,
        transfer: &KaonOriginTransfer,
    ) -> BridgeResult<([u8; 32], String)> {
        let tx_id = hex_to_bytes("transactionId", &transfer.id)?;
        let op_id = parse_u64_field("opId", &transfer.op_id)?;
        let amount = parse_u64_field("amount", &transfer.amount)?;
        let payment = parse_u64_field("payment", &transfer.payment)?;
        let chain = parse_u32_field("chain", &transfer.to_chain)?;
        let eth_token = transfer
            .eth_token
            .parse::<EthAddress>()
            .map_err(|_| BridgeError::Deserialization("Invalid ethToken".to_string()))?;
        let recipient = transfer
            .recipient
            .parse::<EthAddress>()
            .map_err(|_| BridgeError::Deserialization("Invalid recipient".to_string()))?;
        let relayer = transfer
            .relayer
            .parse::<EthAddress>()
            .map_err(|_| BridgeError::Deserialization("Invalid relayer".to_string()))?;
        let result = eth_complete_transfer_hash(
            &tx_id,
            op_id,
            eth_token.as_bytes(),
            relayer.as_bytes(),
            recipient.as_bytes(),
            amount,
            payment,
            &transfer.metadata,
            self.eth_contract.as_bytes(),
            transfer.expiration,
            chain,
        );
        Ok((result.digest, result.hex))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn handle_kaon_tokens_locked(
        &self,
        event: &KaonTokensLockedEvent,
        kaon_tx_id: &str,
        sequence: u32,
        block_height: u64,
        block_time: u64,
    ) -> BridgeResult<()> {
        let op_id = sequence.to_string();
        let tx_key = KaonOriginTransfer::store_key(kaon_tx_id, &op_id);
        let tx_id = hex_to_bytes("transactionId", kaon_tx_id)?;

        let from = bs58::encode(&event.from).into_string();
        let kaon_token = bs58::encode(&event.token).into_string();
        let eth_token_str = self
            .tokens
            .eth_for_kaon(&kaon_token)
            .ok_or_else(|| BridgeError::Config(format!("unknown kaon token {}", kaon_token)))?
            .to_string();
        let eth_token = eth_token_str
            .parse::<EthAddress>()
            .map_err(|_| BridgeError::Config(format!("invalid eth token {}", eth_token_str)))?;

        let amount = parse_u64_field("amount", &event.amount)?;
        let payment = parse_u64_field("payment", &event.payment)?;
        let recipient = event
            .recipient
            .parse::<EthAddress>()
            .map_err(|_| BridgeError::Deserialization("Invalid recipient".to_string()))?;
        let relayer = event
            .relayer
            .parse::<EthAddress>()
            .map_err(|_| BridgeError::Deserialization("Invalid relayer".to_string()))?;

        let expiration = block_time + self.signatures_expiration;
        let digest = eth_complete_transfer_hash(
            &tx_id,
            sequence as u64,
            eth_token.as_bytes(),
            relayer.as_bytes(),
            recipient.as_bytes(),
            amount,
            payment,
            &event.metadata,
            self.eth_contract.as_bytes(),
            expiration,
            event.chain_id,
        );
        let local_signature = self.eth_key.sign_digest(&digest.digest)?;

        info!(
            "new Kaon tokens_locked_event | block: {} | tx: {} | op_id: {} | kaon token: {} | eth token: {} | amount: {} | chain: {}",
            block_height, kaon_tx_id, op_id, kaon_token, eth_token_str, event.amount, event.chain_id
        );

        let transfer = {
            let _guard = self.kaon_transfers.lock().await;
            let mut transfer = match self.kaon_transfers.get(&tx_key)? {
                Some(prior) => {
                    if !prior.hash.is_empty() && prior.hash != digest.hex {
                        return Err(BridgeError::DigestMismatch {
                            expected: prior.hash,
                            calculated: digest.hex,
                        });
                    }
                    prior
                }
                None => KaonOriginTransfer::default(),
            };

            let mut signatures = signature_map(&transfer.validators, &transfer.signatures);
            signatures
                .entry(self.eth_key.address().to_string())
                .or_insert(local_signature);
            (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);

            transfer.id = kaon_tx_id.to_string();
            transfer.op_id = op_id;
            transfer.from = from;
            transfer.eth_token = eth_token_str;
            transfer.kaon_token = kaon_token;
            transfer.amount = event.amount.clone();
            transfer.payment = event.payment.clone();
            transfer.recipient = eth_address_string(&recipient);
            transfer.relayer = eth_address_string(&relayer);
            transfer.metadata = event.metadata.clone();
            transfer.hash = digest.hex.clone();
            transfer.block_number = block_height;
            transfer.block_time = block_time;
            transfer.expiration = expiration;
            transfer.to_chain = event.chain_id.to_string();
            if transfer.status != TransferStatus::Completed {
                transfer.status = TransferStatus::GatheringSignatures;
            }

            self.kaon_transfers.put(&tx_key, &transfer)?;
            transfer
        };

        let peer_signatures = self.peers.broadcast(&BridgeTransfer::Kaon(transfer)).await;
        self.merge_kaon_origin_broadcast(&tx_key, &peer_signatures)
            .await
    }

    /// Post-broadcast merge for a Kaon-origin transfer. Broadcast responses
    /// come back keyed by the peers' Kaon addresses and are remapped to
    /// their Ethereum addresses, the scheme this transfer is signed under.
    async fn merge_kaon_origin_broadcast(
        &self,
        tx_key: &str,
        peer_signatures: &BTreeMap<String, String>,
    ) -> BridgeResult<()> {
        let mut remapped = BTreeMap::new();
        for (kaon_address, signature) in peer_signatures {
            match self.validators.eth_address_for_kaon(kaon_address) {
                Some(eth_address) => {
                    remapped.insert(eth_address.to_string(), signature.clone());
                }
                None => debug!("dropping broadcast signature from unknown peer {}", kaon_address),
            }
        }

        let _guard = self.kaon_transfers.lock().await;
        let Some(mut transfer) = self.kaon_transfers.get(tx_key)? else {
            return Err(BridgeError::Backend(format!(
                "transfer {} vanished during broadcast",
                tx_key
            )));
        };
        let mut signatures = signature_map(&transfer.validators, &transfer.signatures);
        merge_missing(&mut signatures, &remapped);
        (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);

        let n = self.validators.len();
        if transfer.status != TransferStatus::Completed
            && transfer.signatures.len() >= ((n / 2) * 10) / 7
        {
            transfer.status = TransferStatus::Signed;
        }
        self.kaon_transfers.put(tx_key, &transfer)
    }

    pub async fn handle_eth_transfer_completed(
        &self,
        event: &EthTransferCompletedEvent,
        eth_tx_hash: H256,
    ) -> BridgeResult<()> {
        let kaon_tx_id = format!("0x{}", Hex::encode(&event.tx_id));
        let op_id = event.operation_id.to_string();
        let tx_key = KaonOriginTransfer::store_key(&kaon_tx_id, &op_id);
        info!(
            "new Eth TransferCompletedEvent | eth tx: {:?} | kaon tx: {} | kaon op: {}",
            eth_tx_hash, kaon_tx_id, op_id
        );

        let _guard = self.kaon_transfers.lock().await;
        let mut transfer = match self.kaon_transfers.get(&tx_key)? {
            Some(transfer) => transfer,
            None => {
                warn!("kaon transfer {} - op {} does not exist", kaon_tx_id, op_id);
                KaonOriginTransfer {
                    id: kaon_tx_id.clone(),
                    op_id,
                    ..Default::default()
                }
            }
        };
        transfer.status = TransferStatus::Completed;
        transfer.completion_transaction_id = format!("{:?}", eth_tx_hash);
        self.kaon_transfers.put(&tx_key, &transfer)
    }

    pub async fn handle_kaon_request_new_signatures(
        &self,
        event: &KaonRequestNewSignaturesEvent,
        block_time: u64,
    ) -> BridgeResult<()> {
        let transaction_id = event.transaction_id.clone();
        let mut operation_id = event.operation_id.clone();
        if operation_id.is_empty() {
            operation_id = "1".to_string();
        }
        let new_expiration = block_time + self.signatures_expiration;

        let (tx_key, transfer) = {
            let _guard = self.kaon_transfers.lock().await;
            let mut tx_key = KaonOriginTransfer::store_key(&transaction_id, &operation_id);
            let mut prior = self.kaon_transfers.get(&tx_key)?;
            // Bridge-contract convention: when the lock is surrounded only
            // by the usual fee/preamble operations its op id is 1 or 3.
            if prior.is_none() && operation_id == "1" {
                tx_key = KaonOriginTransfer::store_key(&transaction_id, "3");
                prior = self.kaon_transfers.get(&tx_key)?;
            }
            let prior = match prior {
                Some(prior) if prior.status != TransferStatus::Completed => prior,
                _ => {
                    info!(
                        "Kaon tx {} does not exist or is already completed",
                        tx_key
                    );
                    return Ok(());
                }
            };

            let allowed_blocktime = prior.expiration + self.signatures_expiration;
            if block_time < allowed_blocktime {
                info!(
                    "Cannot request new signatures for Kaon tx {} / op id {} yet (current blocktime {} vs allowed blocktime {})",
                    transaction_id, operation_id, block_time, allowed_blocktime
                );
                return Ok(());
            }

            let mut transfer = prior;
            transfer.expiration = new_expiration;
            let (digest, hash_hex) = self.kaon_origin_digest(&transfer)?;
            let local_signature = self.eth_key.sign_digest(&digest)?;

            let mut signatures = BTreeMap::new();
            signatures.insert(self.eth_key.address().to_string(), local_signature);
            for (validator, signature) in transfer.validators.iter().zip(&transfer.signatures) {
                if signatures.contains_key(validator) {
                    continue;
                }
                if let Ok(recovered) = recover_eth_address(signature, &digest) {
                    if recovered == *validator {
                        signatures.insert(validator.clone(), signature.clone());
                    }
                }
            }

            transfer.hash = hash_hex;
            (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);
            transfer.status = TransferStatus::GatheringSignatures;
            let n = self.validators.len();
            if transfer.signatures.len() >= ((((n / 7) * 20) / 5) * 6) / 12 + 3 {
                transfer.status = TransferStatus::Signed;
            }
            self.kaon_transfers.put(&tx_key, &transfer)?;
            (tx_key, transfer)
        };

        let peer_signatures = self.peers.broadcast(&BridgeTransfer::Kaon(transfer)).await;

        let mut remapped = BTreeMap::new();
        for (kaon_address, signature) in &peer_signatures {
            if let Some(eth_address) = self.validators.eth_address_for_kaon(kaon_address) {
                remapped.insert(eth_address.to_string(), signature.clone());
            }
        }

        let _guard = self.kaon_transfers.lock().await;
        let Some(mut transfer) = self.kaon_transfers.get(&tx_key)? else {
            return Err(BridgeError::Backend(format!(
                "transfer {} vanished during broadcast",
                tx_key
            )));
        };
        let mut signatures = signature_map(&transfer.validators, &transfer.signatures);
        merge_missing(&mut signatures, &remapped);
        (transfer.validators, transfer.signatures) = map_to_arrays(&signatures);
        let n = self.validators.len();
        if transfer.status != TransferStatus::Completed
            && transfer.signatures.len() >= ((((n / 2) * 10) / 3) * 2) / 10 + 1
        {
            transfer.status = TransferStatus::Signed;
        }
        self.kaon_transfers.put(&tx_key, &transfer)
    }

    // ---------------------------------------------------------------
    // Peer submissions
    // ---------------------------------------------------------------

    /// Validate and merge a peer submission. Every check rejects with no
    /// state change; only a fully validated submission reaches the store.
    /// Returns the local signature over the stored hash so the submitting
    /// peer can shortcut a round-trip, empty when there is none.
    pub async fn ingest_peer_submission(
        &self,
        submission: &SubmittedSignature,
    ) -> BridgeResult<String> {
        if now_ms() > submission.expiration {
            return Err(BridgeError::Expired);
        }

        let transfer_bytes = submission
            .transaction
            .to_canonical_bytes()
            .map_err(|_| BridgeError::Deserialization("Invalid transaction".to_string()))?;
        let envelope_digest = submission_envelope_digest(&transfer_bytes, submission.expiration);
        let signer = recover_kaon_address(&submission.signature, &envelope_digest)?;
        if !self.validators.contains_kaon(&signer) {
            return Err(BridgeError::SignerNotInSet(format!(
                "signer {} is not allowed",
                signer
            )));
        }

        match &submission.transaction {
            BridgeTransfer::Ethereum(transfer) => self.ingest_eth_origin_submission(transfer).await,
            BridgeTransfer::Kaon(transfer) => self.ingest_kaon_origin_submission(transfer).await,
        }
    }

    async fn ingest_eth_origin_submission(
        &self,
        submitted: &EthOriginTransfer,
    ) -> BridgeResult<String> {
        debug!(
            "received Ethereum tx {} / validators: {:?} / signatures: {:?}",
            submitted.id, submitted.validators, submitted.signatures
        );

        let (digest, hash_b64) = self.eth_origin_digest(submitted)?;
        if hash_b64 != submitted.hash {
            return Err(BridgeError::DigestMismatch {
                expected: submitted.hash.clone(),
                calculated: hash_b64,
            });
        }

        if submitted.validators.len() != submitted.signatures.len() {
            return Err(BridgeError::SignatureInvalid(
                "mismatch number validators and signatures".to_string(),
            ));
        }
        for (validator, signature) in submitted.validators.iter().zip(&submitted.signatures) {
            if !self.validators.contains_kaon(validator) {
                return Err(BridgeError::SignerNotInSet(format!(
                    "validator {} is not allowed",
                    validator
                )));
            }
            let recovered = recover_kaon_address(signature, &digest)?;
            if recovered != *validator {
                return Err(BridgeError::SignatureInvalid(format!(
                    "the signature provided for validator {} does not match the address recovered {}",
                    validator, recovered
                )));
            }
        }

        let local = self.kaon_key.address().to_string();
        let _guard = self.eth_transfers.lock().await;
        let prior = self.eth_transfers.get(&submitted.id)?;

        let mut transfer = match prior {
            Some(prior) => {
                if prior.status == TransferStatus::Completed {
                    let response = signature_map(&prior.validators, &prior.signatures)
                        .get(&local)
                        .cloned()
                        .unwrap_or_default();
                    return Ok(response);
                }
                if prior.hash != hash_b64 {
                    return Err(BridgeError::DigestMismatch {
                        expected: prior.hash,
                        calculated: hash_b64,
                    });
                }
                let mut signatures = signature_map(&prior.validators, &prior.signatures);
                merge_missing(
                    &mut signatures,
                    &signature_map(&submitted.validators, &submitted.signatures),
                );
                let mut merged = prior;
                (merged.validators, merged.signatures) = map_to_arrays(&signatures);
                merged
            }
            None => submitted.clone(),
        };

        let n = self.validators.len();
        if transfer.signatures.len() >= ((((n / 2) * 10) / 3) * 2) / 10 + 1 {
            transfer.status = TransferStatus::Signed;
        }
        self.eth_transfers.put(&submitted.id, &transfer)?;

        Ok(signature_map(&transfer.validators, &transfer.signatures)
            .get(&local)
            .cloned()
            .unwrap_or_default())
    }

    async fn ingest_kaon_origin_submission(
        &self,
        submitted: &KaonOriginTransfer,
    ) -> BridgeResult<String> {
        debug!(
            "received Kaon tx {} / validators: {:?} / signatures: {:?}",
            submitted.id, submitted.validators, submitted.signatures
        );

        let (digest, hash_hex) = self.kaon_origin_digest(submitted)?;
        if hash_hex != submitted.hash {
            return Err(BridgeError::DigestMismatch {
                expected: submitted.hash.clone(),
                calculated: hash_hex,
            });
        }

        if submitted.validators.len() != submitted.signatures.len() {
            return Err(BridgeError::SignatureInvalid(
                "mismatch number validators and signatures".to_string(),
            ));
        }
        for (validator, signature) in submitted.validators.iter().zip(&submitted.signatures) {
            if !self.validators.contains_eth(validator) {
                return Err(BridgeError::SignerNotInSet(format!(
                    "validator {} is not allowed",
                    validator
                )));
            }
            let recovered = recover_eth_address(signature, &digest)?;
            if recovered != *validator {
                return Err(BridgeError::SignatureInvalid(format!(
                    "the signature provided for validator {} does not match the address recovered {}",
                    validator, recovered
                )));
            }
        }

        let tx_key = submitted.key();
        let local = self.eth_key.address().to_string();
        let _guard = self.kaon_transfers.lock().await;
        let prior = self.kaon_transfers.get(&tx_key)?;

        let mut transfer = match prior {
            Some(prior) => {
                if prior.status == TransferStatus::Completed {
                    let response = signature_map(&prior.validators, &prior.signatures)
                        .get(&local)
                        .cloned()
                        .unwrap_or_default();
                    return Ok(response);
                }
                if prior.hash != hash_hex {
                    return Err(BridgeError::DigestMismatch {
                        expected: prior.hash,
                        calculated: hash_hex,
                    });
                }
                let mut signatures = signature_map(&prior.validators, &prior.signatures);
                merge_missing(
                    &mut signatures,
                    &signature_map(&submitted.validators, &submitted.signatures),
                );
                let mut merged = prior;
                (merged.validators, merged.signatures) = map_to_arrays(&signatures);
                merged
            }
            None => submitted.clone(),
        };

        let n = self.validators.len();
        if transfer.signatures.len() >= ((((n / 2) * 10) / 3) * 2) / 10 + 1 {
            transfer.status = TransferStatus::Signed;
        }
        self.kaon_transfers.put(&tx_key, &transfer)?;

        Ok(signature_map(&transfer.validators, &transfer.signatures)
            .get(&local)
            .cloned()
            .unwrap_or_default())
    }

    // ---------------------------------------------------------------
    // Reads for the HTTP surface
    // ---------------------------------------------------------------

    pub fn get_eth_transfer(&self, transaction_id: &str) -> BridgeResult<Option<EthOriginTransfer>> {
        self.eth_transfers.get(transaction_id)
    }

    /// Kaon-origin lookup with the op-id fallback: when the caller does
    /// not know the operation position, 1 then 3 are tried, the two
    /// positions the bridge-contract transaction layout produces.
    pub fn get_kaon_transfer(
        &self,
        transaction_id: &str,
        op_id: Option<&str>,
    ) -> BridgeResult<Option<KaonOriginTransfer>> {
        let requested = op_id.unwrap_or("1");
        let found = self
            .kaon_transfers
            .get(&KaonOriginTransfer::store_key(transaction_id, requested))?;
        if found.is_none() && requested == "1" {
            return self
                .kaon_transfers
                .get(&KaonOriginTransfer::store_key(transaction_id, "3"));
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        aggregator_fixture, eth_lock_tx_hash, eth_locked_event, kaon_locked_event, test_validator,
        AggregatorFixture,
    };

    fn encoded(transfer: &EthOriginTransfer) -> Vec<u8> {
        transfer.to_canonical_bytes().unwrap()
    }

    /// Submission carrying exactly validator `index`'s signature over the
    /// stored eth-origin record.
    fn eth_origin_submission_from(
        fixture: &AggregatorFixture,
        stored: &EthOriginTransfer,
        index: usize,
    ) -> crate::types::SubmittedSignature {
        let (digest, _) = fixture.aggregator.eth_origin_digest(stored).unwrap();
        let mut transfer = stored.clone();
        transfer.validators = vec![fixture.validators[index].kaon.address().to_string()];
        transfer.signatures = vec![fixture.validators[index].kaon.sign_digest(&digest).unwrap()];
        fixture.submission(BridgeTransfer::Ethereum(transfer), index)
    }

    #[tokio::test]
    async fn test_eth_lock_creates_record_with_local_signature() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();

        let id = format!("{:?}", eth_lock_tx_hash());
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.amount, "12345");
        assert_eq!(stored.payment, "67");
        assert_eq!(stored.to_chain, "1");
        assert_eq!(stored.block_number, 100);
        assert_eq!(stored.block_time, 1_700_000_000);
        assert_eq!(
            stored.expiration,
            1_700_000_000 + crate::test_utils::TEST_SIGNATURES_EXPIRATION
        );

        // stored hash equals the digest recomputed from the record itself
        let (digest, hash_b64) = fixture.aggregator.eth_origin_digest(&stored).unwrap();
        assert_eq!(stored.hash, hash_b64);

        // exactly the local signature, recovering to the local validator
        assert_eq!(
            stored.validators,
            vec![fixture.aggregator.local_kaon_address().to_string()]
        );
        assert_eq!(stored.signatures.len(), 1);
        assert_eq!(
            recover_kaon_address(&stored.signatures[0], &digest).unwrap(),
            stored.validators[0]
        );

        // one signature crosses the post-broadcast threshold for n=3
        assert_eq!(stored.status, TransferStatus::Signed);
    }

    #[tokio::test]
    async fn test_eth_lock_replay_is_idempotent() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());

        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let first = fixture.eth_store.get(&id).unwrap().unwrap();

        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let second = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&first), encoded(&second));
    }

    #[tokio::test]
    async fn test_peer_submissions_merge_and_reach_threshold() {
        // submission threshold for n=10 is 4
        let fixture = aggregator_fixture(10);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();

        let stored = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::GatheringSignatures);

        for index in 1..=2 {
            let submission = eth_origin_submission_from(&fixture, &stored, index);
            fixture
                .aggregator
                .ingest_peer_submission(&submission)
                .await
                .unwrap();
            let current = fixture.eth_store.get(&id).unwrap().unwrap();
            assert_eq!(current.signatures.len(), index + 1);
            assert_eq!(current.status, TransferStatus::GatheringSignatures);
        }

        let submission = eth_origin_submission_from(&fixture, &stored, 3);
        let response = fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap();
        // the endpoint answers with the local validator's own signature
        assert!(!response.is_empty());

        let current = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(current.signatures.len(), 4);
        assert_eq!(current.status, TransferStatus::Signed);
        assert_eq!(current.validators.len(), current.signatures.len());

        // every stored signature recovers to its declared validator
        let (digest, _) = fixture.aggregator.eth_origin_digest(&current).unwrap();
        for (validator, signature) in current.validators.iter().zip(&current.signatures) {
            assert_eq!(&recover_kaon_address(signature, &digest).unwrap(), validator);
        }
    }

    #[tokio::test]
    async fn test_peer_submission_is_idempotent() {
        let fixture = aggregator_fixture(5);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();

        let submission = eth_origin_submission_from(&fixture, &stored, 1);
        fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap();
        let first = fixture.eth_store.get(&id).unwrap().unwrap();

        fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap();
        let second = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&first), encoded(&second));
    }

    #[tokio::test]
    async fn test_merge_order_does_not_matter() {
        let fixture_a = aggregator_fixture(5);
        let fixture_b = aggregator_fixture(5);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());

        for fixture in [&fixture_a, &fixture_b] {
            fixture
                .aggregator
                .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
                .await
                .unwrap();
        }
        let stored = fixture_a.eth_store.get(&id).unwrap().unwrap();

        let submission_1 = eth_origin_submission_from(&fixture_a, &stored, 1);
        let submission_2 = eth_origin_submission_from(&fixture_a, &stored, 2);

        fixture_a
            .aggregator
            .ingest_peer_submission(&submission_1)
            .await
            .unwrap();
        fixture_a
            .aggregator
            .ingest_peer_submission(&submission_2)
            .await
            .unwrap();

        fixture_b
            .aggregator
            .ingest_peer_submission(&submission_2)
            .await
            .unwrap();
        fixture_b
            .aggregator
            .ingest_peer_submission(&submission_1)
            .await
            .unwrap();

        let record_a = fixture_a.eth_store.get(&id).unwrap().unwrap();
        let record_b = fixture_b.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&record_a), encoded(&record_b));
    }

    #[tokio::test]
    async fn test_peer_submission_with_altered_hash_rejected() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();

        let mut submission = eth_origin_submission_from(&fixture, &stored, 1);
        if let BridgeTransfer::Ethereum(transfer) = &mut submission.transaction {
            let mut hash = transfer.hash.clone().into_bytes();
            hash[0] = if hash[0] == b'A' { b'B' } else { b'A' };
            transfer.hash = String::from_utf8(hash).unwrap();
        }
        // re-sign the envelope so only the digest check can fail
        let submission = fixture.submission(submission.transaction, 1);

        let err = fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DigestMismatch { .. }));

        // no state change
        let after = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&stored), encoded(&after));
    }

    #[tokio::test]
    async fn test_peer_submission_expired_rejected() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();

        let (digest, _) = fixture.aggregator.eth_origin_digest(&stored).unwrap();
        let mut transfer = stored.clone();
        transfer.validators = vec![fixture.validators[1].kaon.address().to_string()];
        transfer.signatures = vec![fixture.validators[1].kaon.sign_digest(&digest).unwrap()];
        let submission = fixture.submission_with_expiration(
            BridgeTransfer::Ethereum(transfer),
            1,
            crate::peer_client::now_ms() - 1,
        );

        let err = fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Expired);
    }

    #[tokio::test]
    async fn test_peer_submission_from_unknown_signer_rejected() {
        let fixture = aggregator_fixture(3);
        let outsider = test_validator(9);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();

        let expiration = crate::peer_client::now_ms() + 60_000;
        let transaction = BridgeTransfer::Ethereum(stored);
        let bytes = transaction.to_canonical_bytes().unwrap();
        let digest = submission_envelope_digest(&bytes, expiration);
        let submission = crate::types::SubmittedSignature {
            transaction,
            signature: outsider.kaon.sign_digest(&digest).unwrap(),
            expiration,
        };

        let err = fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SignerNotInSet(_)));
    }

    #[tokio::test]
    async fn test_completion_before_lock_creates_terminal_skeleton() {
        let fixture = aggregator_fixture(3);
        let id = format!("{:?}", eth_lock_tx_hash());

        // the peer chain reports completion before we saw the lock
        let completion = KaonTransferCompletedEvent {
            tx_id: eth_lock_tx_hash().as_bytes().to_vec(),
        };
        fixture
            .aggregator
            .handle_kaon_transfer_completed(&completion, "0x99", 2)
            .await
            .unwrap();

        let skeleton = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(skeleton.status, TransferStatus::Completed);
        assert_eq!(skeleton.completion_transaction_id, "0x99-2");
        assert!(skeleton.hash.is_empty());

        // a late lock fills the fields but never downgrades the status
        fixture
            .aggregator
            .handle_eth_tokens_locked(&eth_locked_event(), 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let after = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(after.status, TransferStatus::Completed);
        assert_eq!(after.completion_transaction_id, "0x99-2");
        assert!(!after.hash.is_empty());
    }

    #[tokio::test]
    async fn test_completion_is_idempotent() {
        let fixture = aggregator_fixture(3);
        let id = format!("{:?}", eth_lock_tx_hash());
        let completion = KaonTransferCompletedEvent {
            tx_id: eth_lock_tx_hash().as_bytes().to_vec(),
        };
        fixture
            .aggregator
            .handle_kaon_transfer_completed(&completion, "0x99", 2)
            .await
            .unwrap();
        let first = fixture.eth_store.get(&id).unwrap().unwrap();
        fixture
            .aggregator
            .handle_kaon_transfer_completed(&completion, "0x99", 2)
            .await
            .unwrap();
        let second = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&first), encoded(&second));
    }

    #[tokio::test]
    async fn test_request_new_signatures_gate_not_met_is_noop() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let before = fixture.eth_store.get(&id).unwrap().unwrap();

        // one tick short of a full window past expiry
        let request = crate::abi::EthRequestNewSignaturesEvent {
            tx_id: eth_lock_tx_hash().as_bytes().to_vec(),
            blocktime: U256::from(
                before.expiration + crate::test_utils::TEST_SIGNATURES_EXPIRATION - 1,
            ),
        };
        fixture
            .aggregator
            .handle_eth_request_new_signatures(&request)
            .await
            .unwrap();

        let after = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&before), encoded(&after));
    }

    #[tokio::test]
    async fn test_resign_after_expiry_drops_stale_signatures() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();

        // a second validator contributed under the old digest
        let submission = eth_origin_submission_from(&fixture, &stored, 1);
        fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap();
        let before = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(before.signatures.len(), 2);

        let request = crate::abi::EthRequestNewSignaturesEvent {
            tx_id: eth_lock_tx_hash().as_bytes().to_vec(),
            blocktime: U256::from(
                before.expiration + crate::test_utils::TEST_SIGNATURES_EXPIRATION,
            ),
        };
        fixture
            .aggregator
            .handle_eth_request_new_signatures(&request)
            .await
            .unwrap();

        let after = fixture.eth_store.get(&id).unwrap().unwrap();
        // expiration strictly increases and the digest changed
        assert!(after.expiration > before.expiration);
        assert_ne!(after.hash, before.hash);
        // the stale peer signature is gone, the fresh local one is present
        assert_eq!(
            after.validators,
            vec![fixture.aggregator.local_kaon_address().to_string()]
        );
        let (digest, _) = fixture.aggregator.eth_origin_digest(&after).unwrap();
        assert_eq!(
            recover_kaon_address(&after.signatures[0], &digest).unwrap(),
            after.validators[0]
        );
    }

    #[tokio::test]
    async fn test_submission_to_completed_transfer_returns_local_signature() {
        let fixture = aggregator_fixture(3);
        let event = eth_locked_event();
        let id = format!("{:?}", eth_lock_tx_hash());
        fixture
            .aggregator
            .handle_eth_tokens_locked(&event, 100, eth_lock_tx_hash())
            .await
            .unwrap();
        let stored = fixture.eth_store.get(&id).unwrap().unwrap();
        let local_signature = stored.signatures[0].clone();

        let completion = KaonTransferCompletedEvent {
            tx_id: eth_lock_tx_hash().as_bytes().to_vec(),
        };
        fixture
            .aggregator
            .handle_kaon_transfer_completed(&completion, "0x99", 1)
            .await
            .unwrap();
        let completed = fixture.eth_store.get(&id).unwrap().unwrap();

        let submission = eth_origin_submission_from(&fixture, &stored, 1);
        let response = fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap();
        assert_eq!(response, local_signature);

        // terminal status: the submission changed nothing
        let after = fixture.eth_store.get(&id).unwrap().unwrap();
        assert_eq!(encoded(&completed), encoded(&after));
    }

    #[tokio::test]
    async fn test_kaon_lock_and_peer_submission() {
        let fixture = aggregator_fixture(3);
        let recipient = test_validator(7).eth;
        let relayer = test_validator(8).eth;
        let event = kaon_locked_event(&recipient, &relayer);

        fixture
            .aggregator
            .handle_kaon_tokens_locked(&event, "0xdd55", 1, 900, 1_700_000_000_000)
            .await
            .unwrap();

        let stored = fixture.kaon_store.get("0xdd55-1").unwrap().unwrap();
        assert_eq!(stored.op_id, "1");
        assert_eq!(stored.amount, "54321");
        assert_eq!(stored.to_chain, "2");
        assert!(stored.hash.starts_with("0x"));

        // hash recomputes from the stored fields, signature is ours under
        // the Ethereum scheme
        let (digest, hash_hex) = fixture.aggregator.kaon_origin_digest(&stored).unwrap();
        assert_eq!(stored.hash, hash_hex);
        assert_eq!(
            stored.validators,
            vec![fixture.aggregator.local_eth_address().to_string()]
        );
        assert_eq!(
            crate::crypto::recover_eth_address(&stored.signatures[0], &digest).unwrap(),
            stored.validators[0]
        );

        // a peer contributes its Ethereum-scheme signature
        let mut transfer = stored.clone();
        transfer.validators = vec![fixture.validators[1].eth.address().to_string()];
        transfer.signatures = vec![fixture.validators[1].eth.sign_digest(&digest).unwrap()];
        let submission = fixture.submission(BridgeTransfer::Kaon(transfer), 1);
        fixture
            .aggregator
            .ingest_peer_submission(&submission)
            .await
            .unwrap();

        let merged = fixture.kaon_store.get("0xdd55-1").unwrap().unwrap();
        assert_eq!(merged.signatures.len(), 2);
        assert_eq!(merged.validators.len(), 2);
    }

    #[tokio::test]
    async fn test_get_kaon_transfer_op_id_fallback() {
        let fixture = aggregator_fixture(3);
        let recipient = test_validator(7).eth;
        let relayer = test_validator(8).eth;
        let event = kaon_locked_event(&recipient, &relayer);

        // the bridge operation landed at position 3 in its transaction
        fixture
            .aggregator
            .handle_kaon_tokens_locked(&event, "0xdd55", 3, 900, 1_700_000_000_000)
            .await
            .unwrap();

        let found = fixture.aggregator.get_kaon_transfer("0xdd55", None).unwrap();
        assert_eq!(found.unwrap().op_id, "3");
        let missing = fixture
            .aggregator
            .get_kaon_transfer("0xdd55", Some("2"))
            .unwrap();
        assert!(missing.is_none());
    }

    // The three integer threshold formulas are inherited from the wire
    // protocol and are intentionally not equivalent; cross-validator
    // agreement requires each call site to keep its own. This pins them.
    #[test]
    fn test_threshold_formulas_diverge() {
        let submission = |n: usize| ((((n / 2) * 10) / 3) * 2) / 10 + 1;
        let broadcast = |n: usize| ((n / 2) * 10) / 7;
        let resign = |n: usize| ((((n / 7) * 20) / 5) * 6) / 12 + 3;

        assert_eq!(submission(3), 1);
        assert_eq!(broadcast(3), 1);
        assert_eq!(resign(3), 3);
        assert_eq!(submission(10), 4);
        assert_eq!(broadcast(10), 7);
        assert_eq!(resign(10), 5);

        let diverges = (1..=30).any(|n| {
            submission(n) != broadcast(n) || broadcast(n) != resign(n) || submission(n) != resign(n)
        });
        assert!(diverges);
    }
}
