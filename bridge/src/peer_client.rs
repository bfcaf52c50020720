// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Outbound half of the peer signature exchange.
//!
//! After any state change that adds a local signature or changes a digest,
//! the aggregator fans the transfer out to every other validator's
//! `/SubmitSignature` endpoint. Responses are pure optimization: a 200
//! body is the peer's own signature over the same hash, everything else is
//! logged and ignored.

use crate::config::ValidatorSet;
use crate::crypto::KaonKeyPair;
use crate::encoding::{submission_envelope_digest, BridgeRecordEncoding};
use crate::metrics::BridgeMetrics;
use crate::types::{BridgeTransfer, SubmittedSignature};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Envelope validity window added to the submission time.
const ENVELOPE_TTL_MS: i64 = 60_000;
const BROADCAST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub struct PeerClient {
    client: reqwest::Client,
    validators: Arc<ValidatorSet>,
    kaon_key: KaonKeyPair,
    metrics: Arc<BridgeMetrics>,
}

impl PeerClient {
    pub fn new(
        validators: Arc<ValidatorSet>,
        kaon_key: KaonKeyPair,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(BROADCAST_TIMEOUT)
            .build()
            .expect("building the broadcast http client cannot fail");
        Self {
            client,
            validators,
            kaon_key,
            metrics,
        }
    }

    /// Fan a transfer out to every other validator. Returns the signatures
    /// peers answered with, keyed by the peer's Kaon address. Best-effort:
    /// the map may be empty.
    pub async fn broadcast(&self, transfer: &BridgeTransfer) -> BTreeMap<String, String> {
        let mut signatures = BTreeMap::new();

        let transfer_bytes = match transfer.to_canonical_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("broadcast: could not encode transfer {}: {}", transfer.id(), e);
                return signatures;
            }
        };
        let expiration = now_ms() + ENVELOPE_TTL_MS;
        let digest = submission_envelope_digest(&transfer_bytes, expiration);
        let signature = match self.kaon_key.sign_digest(&digest) {
            Ok(signature) => signature,
            Err(e) => {
                warn!("broadcast: could not sign envelope for {}: {}", transfer.id(), e);
                return signatures;
            }
        };
        let submission = SubmittedSignature {
            transaction: transfer.clone(),
            signature,
            expiration,
        };

        let mut processed_api_urls: HashSet<&str> = HashSet::new();
        for validator in self.validators.members() {
            // don't send to yourself
            if validator.kaon_address == self.kaon_key.address() {
                continue;
            }
            // validators are indexed twice, dedup on the url
            if !processed_api_urls.insert(validator.api_url.as_str()) {
                continue;
            }

            let url = format!("{}/SubmitSignature", validator.api_url);
            let response = self.client.post(&url).json(&submission).send().await;
            match response {
                Ok(response) if response.status().is_success() => {
                    let body = response.text().await.unwrap_or_default();
                    debug!(
                        "broadcast {}: ok for tx {}",
                        validator.kaon_address,
                        transfer.id()
                    );
                    self.metrics
                        .broadcast_responses
                        .with_label_values(&["ok"])
                        .inc();
                    if !body.is_empty() {
                        signatures.insert(validator.kaon_address.clone(), body);
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    warn!(
                        "broadcast {}: status {} for tx {}: {}",
                        validator.kaon_address,
                        status,
                        transfer.id(),
                        body
                    );
                    self.metrics
                        .broadcast_responses
                        .with_label_values(&["rejected"])
                        .inc();
                }
                Err(e) => {
                    warn!(
                        "broadcast {}: request failed for tx {}: {}",
                        validator.kaon_address,
                        transfer.id(),
                        e
                    );
                    self.metrics
                        .broadcast_responses
                        .with_label_values(&["error"])
                        .inc();
                }
            }
        }

        signatures
    }
}
