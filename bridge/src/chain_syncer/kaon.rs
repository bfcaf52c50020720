// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::aggregator::TransferAggregator;
use crate::error::BridgeResult;
use crate::events::{
    decode_kaon_event, KaonRequestNewSignaturesEvent, KaonTokensLockedEvent,
    KaonTransferCompletedEvent, KAON_REQUEST_NEW_SIGNATURES_EVENT, KAON_TOKENS_LOCKED_EVENT,
    KAON_TRANSFER_COMPLETED_EVENT,
};
use crate::kaon_client::{KaonBlockItem, KaonRpcClient, KaonTransactionReceipt};
use crate::metrics::BridgeMetrics;
use crate::store::MetadataStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct KaonChainSyncer {
    client: Arc<KaonRpcClient>,
    aggregator: Arc<TransferAggregator>,
    metadata: Arc<MetadataStore>,
    metrics: Arc<BridgeMetrics>,
    /// Base58 bridge contract account, compared against event sources.
    contract: String,
    max_blocks: u64,
    polling_interval: Duration,
    start_block: u64,
}

impl KaonChainSyncer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<KaonRpcClient>,
        aggregator: Arc<TransferAggregator>,
        metadata: Arc<MetadataStore>,
        metrics: Arc<BridgeMetrics>,
        contract: String,
        max_blocks: u64,
        polling_interval: Duration,
        start_block: u64,
    ) -> Self {
        Self {
            client,
            aggregator,
            metadata,
            metrics,
            contract,
            max_blocks,
            polling_interval,
            start_block,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!("starting Kaon streaming from block {}", self.start_block + 1);
        let mut last_parsed = self.start_block;
        let mut from_block = self.start_block + 1;

        let mut interval = time::interval(self.polling_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stop streaming Kaon blocks: {}", last_parsed);
                    self.flush_cursor(last_parsed).await;
                    return;
                }
                _ = interval.tick() => {
                    match self.poll(&mut from_block, &mut last_parsed).await {
                        Ok(()) => {}
                        Err(e) if e.is_fatal_in_streamer() => {
                            error!("fatal error in Kaon streamer: {}", e);
                            panic!("fatal error in Kaon streamer: {}", e);
                        }
                        Err(e) => warn!("Kaon streamer: {}", e),
                    }
                }
            }
        }
    }

    async fn poll(&self, from_block: &mut u64, last_parsed: &mut u64) -> BridgeResult<()> {
        let head_info = self.client.get_head_info().await?;
        let irreversible = head_info.last_irreversible_block;

        let count = irreversible
            .saturating_sub(*from_block)
            .min(self.max_blocks);
        let to_block = *from_block + count;
        if to_block > irreversible {
            info!("waiting for Kaon block {}", from_block);
            return Ok(());
        }

        let blocks = self
            .client
            .get_blocks_by_height(&head_info.head_topology.id, *from_block, count as u32)
            .await?;
        info!(
            "fetched kaon blocks: {} - {} ({} blocks)",
            from_block,
            to_block,
            blocks.block_items.len()
        );

        for item in &blocks.block_items {
            for receipt in &item.receipt.transaction_receipts {
                // events of reverted transactions never happened
                if receipt.reverted {
                    continue;
                }
                self.dispatch_receipt(item, receipt).await?;
            }
            *last_parsed = item.block_height;
        }

        if !blocks.block_items.is_empty() {
            *from_block = *last_parsed + 1;
        }
        self.metrics
            .last_synced_kaon_block
            .set(*last_parsed as i64);
        Ok(())
    }

    async fn dispatch_receipt(
        &self,
        item: &KaonBlockItem,
        receipt: &KaonTransactionReceipt,
    ) -> BridgeResult<()> {
        let block_time = item.block.header.timestamp;
        for event in &receipt.events {
            if event.source != self.contract {
                continue;
            }
            match event.name.as_str() {
                KAON_TOKENS_LOCKED_EVENT => {
                    let decoded: KaonTokensLockedEvent = decode_kaon_event(&event.data)?;
                    self.metrics
                        .events_dispatched
                        .with_label_values(&["kaon", "tokens_locked"])
                        .inc();
                    self.aggregator
                        .handle_kaon_tokens_locked(
                            &decoded,
                            &receipt.id,
                            event.sequence,
                            item.block_height,
                            block_time,
                        )
                        .await?;
                }
                KAON_TRANSFER_COMPLETED_EVENT => {
                    let decoded: KaonTransferCompletedEvent = decode_kaon_event(&event.data)?;
                    self.metrics
                        .events_dispatched
                        .with_label_values(&["kaon", "transfer_completed"])
                        .inc();
                    self.aggregator
                        .handle_kaon_transfer_completed(&decoded, &receipt.id, event.sequence)
                        .await?;
                }
                KAON_REQUEST_NEW_SIGNATURES_EVENT => {
                    let decoded: KaonRequestNewSignaturesEvent = decode_kaon_event(&event.data)?;
                    self.metrics
                        .events_dispatched
                        .with_label_values(&["kaon", "request_new_signatures"])
                        .inc();
                    self.aggregator
                        .handle_kaon_request_new_signatures(&decoded, block_time)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn flush_cursor(&self, last_parsed: u64) {
        let _guard = self.metadata.lock().await;
        let mut metadata = match self.metadata.get_metadata() {
            Ok(metadata) => metadata.unwrap_or_default(),
            Err(e) => {
                error!("could not read metadata during shutdown: {}", e);
                return;
            }
        };
        metadata.last_kaon_block = last_parsed;
        if let Err(e) = self.metadata.put_metadata(&metadata) {
            error!("could not persist Kaon cursor {}: {}", last_parsed, e);
        }
    }
}
