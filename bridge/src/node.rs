// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Supervisor: opens the stores, wires the components, runs the streamers
//! and the HTTP servers under one cancellation token, and flushes cursors
//! and backends on shutdown.

use crate::aggregator::TransferAggregator;
use crate::chain_syncer::eth::EthChainSyncer;
use crate::chain_syncer::kaon::KaonChainSyncer;
use crate::config::{BridgeNodeConfig, TokenMap, ValidatorSet};
use crate::crypto::{EthKeyPair, KaonKeyPair};
use crate::encoding::base58_to_bytes;
use crate::error::BridgeError;
use crate::eth_client::EthClient;
use crate::kaon_client::KaonRpcClient;
use crate::metrics::BridgeMetrics;
use crate::peer_client::PeerClient;
use crate::server::run_server;
use crate::types::{BridgeMetadata, EthOriginTransfer, KaonOriginTransfer};
use anyhow::Context;
use axum::{routing::get, Router};
use ethers::types::Address as EthAddress;
use prometheus::{Registry, TextEncoder};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub async fn run_bridge_node(
    config: BridgeNodeConfig,
    prometheus_registry: Registry,
) -> anyhow::Result<()> {
    let metrics = Arc::new(BridgeMetrics::new(&prometheus_registry));

    info!(
        "starting bridge validator instance {} (basedir {:?})",
        config.instance_id,
        config.base_dir
    );
    // the local peer-discovery service reads this queue on its own; the
    // validator only records where it was told to find it
    info!("peer discovery message queue configured at {}", config.amqp);

    let app_dir = config.app_dir();
    let metadata_store = open_store::<BridgeMetadata>(&app_dir, "metadata")?;
    let eth_transfers = open_store::<EthOriginTransfer>(&app_dir, "eth_transfers")?;
    let kaon_transfers = open_store::<KaonOriginTransfer>(&app_dir, "kaon_transfers")?;

    if config.reset {
        info!("resetting databases");
        metadata_store.reset()?;
        eth_transfers.reset()?;
        kaon_transfers.reset()?;
    }

    // seed the resume cursors on first start
    let metadata = match metadata_store.get_metadata()? {
        Some(metadata) => metadata,
        None => {
            let metadata = BridgeMetadata {
                last_eth_block: config.eth.block_start,
                last_kaon_block: config.kaon.block_start,
            };
            metadata_store.put_metadata(&metadata)?;
            metadata
        }
    };
    info!(
        "LastEthBlockParsed {} / LastKaonBlockParsed {}",
        metadata.last_eth_block, metadata.last_kaon_block
    );

    if config.kaon.private_key_hex.is_empty() {
        return Err(BridgeError::Config("kaon-pk is required".to_string()).into());
    }
    if config.eth.private_key_hex.is_empty() {
        return Err(BridgeError::Config("eth-pk is required".to_string()).into());
    }
    let kaon_key = KaonKeyPair::from_hex(&config.kaon.private_key_hex)?;
    let eth_key = EthKeyPair::from_hex(&config.eth.private_key_hex)?;
    info!(
        "validator addresses: kaon {} / eth {}",
        kaon_key.address(),
        eth_key.address()
    );

    let validators = Arc::new(ValidatorSet::new(config.validators.clone())?);
    if validators.is_empty() {
        warn!("validator set is empty, no peer exchange will happen");
    }
    let tokens = Arc::new(TokenMap::new(&config.tokens)?);

    let kaon_contract = base58_to_bytes("kaonContract", &config.kaon.contract)?;
    let eth_contract = config
        .eth
        .contract
        .parse::<EthAddress>()
        .with_context(|| format!("invalid eth contract {}", config.eth.contract))?;

    let peers = Arc::new(PeerClient::new(
        validators.clone(),
        kaon_key.clone(),
        metrics.clone(),
    ));
    let aggregator = Arc::new(TransferAggregator::new(
        validators,
        tokens,
        kaon_key,
        eth_key,
        kaon_contract,
        eth_contract,
        config.signatures_expiration,
        eth_transfers.clone(),
        kaon_transfers.clone(),
        peers,
    ));

    let eth_client = Arc::new(EthClient::new(&config.eth.rpc_url)?);
    let kaon_client = Arc::new(KaonRpcClient::new(&config.kaon.rpc_url)?);

    let cancel = CancellationToken::new();

    let api_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        config.api_listen_port,
    );
    let server_handle = run_server(&api_address, aggregator.clone(), metrics.clone(), cancel.clone());
    let metrics_handle = start_metrics_server(
        config.metrics_port,
        prometheus_registry.clone(),
        cancel.clone(),
    );

    let eth_syncer = EthChainSyncer::new(
        eth_client,
        aggregator.clone(),
        metadata_store.clone(),
        metrics.clone(),
        eth_contract,
        config.eth.confirmations,
        config.eth.max_blocks,
        config.eth.polling_interval,
        metadata.last_eth_block,
    );
    let kaon_syncer = KaonChainSyncer::new(
        kaon_client,
        aggregator.clone(),
        metadata_store.clone(),
        metrics.clone(),
        config.kaon.contract.clone(),
        config.kaon.max_blocks,
        config.kaon.polling_interval,
        metadata.last_kaon_block,
    );

    let mut eth_handle = tokio::spawn(eth_syncer.run(cancel.clone()));
    let mut kaon_handle = tokio::spawn(kaon_syncer.run(cancel.clone()));

    // A streamer only returns after cancellation; a handle resolving
    // before any shutdown signal means it died on a fatal error, and the
    // process must go down with it regardless of panic strategy.
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("closing service gracefully");
        }
        result = &mut eth_handle => {
            error!("Ethereum streamer terminated unexpectedly: {:?}", result);
            std::process::exit(1);
        }
        result = &mut kaon_handle => {
            error!("Kaon streamer terminated unexpectedly: {:?}", result);
            std::process::exit(1);
        }
    }
    cancel.cancel();

    // streamers drain their window and persist cursors before exiting
    let _ = eth_handle.await;
    let _ = kaon_handle.await;
    let _ = server_handle.await;
    let _ = metrics_handle.await;

    kaon_transfers.flush()?;
    eth_transfers.flush()?;
    metadata_store.flush()?;
    info!("graceful stop completed");
    Ok(())
}

fn open_store<T: crate::encoding::BridgeRecordEncoding>(
    app_dir: &std::path::Path,
    name: &str,
) -> anyhow::Result<Arc<crate::store::RecordStore<T>>> {
    let dir = app_dir.join(name);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
    info!("opening database at {:?}", dir);
    Ok(Arc::new(crate::store::RecordStore::open(&dir)?))
}

fn start_metrics_server(
    port: u16,
    registry: Registry,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), port);
    tokio::spawn(async move {
        let router = Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    TextEncoder::new()
                        .encode_to_string(&registry.gather())
                        .unwrap_or_default()
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind(address).await.unwrap();
        info!("metrics endpoint listening on {}", address);
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .unwrap();
    })
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing the SIGINT handler cannot fail");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler cannot fail")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
