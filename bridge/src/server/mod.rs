// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Inbound half of the peer signature exchange.
//!
//! Three routes: transfer lookups per origin chain and the signature
//! submission endpoint. Ingestion failures map to 4xx with a short reason
//! string and never abort the process.

use crate::aggregator::TransferAggregator;
use crate::error::BridgeError;
use crate::metrics::BridgeMetrics;
use crate::types::{BridgeTransfer, SubmittedSignature};
use crate::with_metrics;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const APPLICATION_JSON: &str = "application/json";

pub const ETH_TRANSFER_PATH: &str = "/transfer/eth";
pub const KAON_TRANSFER_PATH: &str = "/transfer/kaon";
pub const SUBMIT_SIGNATURE_PATH: &str = "/SubmitSignature";

type ServerState = (Arc<TransferAggregator>, Arc<BridgeMetrics>);

impl axum::response::IntoResponse for BridgeError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            BridgeError::TransferNotFound => StatusCode::NOT_FOUND,
            BridgeError::Backend(_)
            | BridgeError::Serialization(_)
            | BridgeError::Config(_)
            | BridgeError::RpcTransient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        (status, self.to_string()).into_response()
    }
}

pub fn run_server(
    socket_address: &SocketAddr,
    aggregator: Arc<TransferAggregator>,
    metrics: Arc<BridgeMetrics>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await.unwrap();
        info!("signature exchange API listening on {}", socket_address);
        axum::serve(listener, make_router(aggregator, metrics).into_make_service())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .unwrap();
    })
}

pub(crate) fn make_router(
    aggregator: Arc<TransferAggregator>,
    metrics: Arc<BridgeMetrics>,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route(ETH_TRANSFER_PATH, get(get_eth_transfer))
        .route(KAON_TRANSFER_PATH, get(get_kaon_transfer))
        .route(SUBMIT_SIGNATURE_PATH, post(submit_signature))
        .with_state((aggregator, metrics))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct TransferQuery {
    #[serde(rename = "TransactionId")]
    transaction_id: String,
    #[serde(rename = "OpId")]
    op_id: Option<String>,
}

async fn get_eth_transfer(
    Query(query): Query<TransferQuery>,
    State((aggregator, metrics)): State<ServerState>,
) -> Result<Json<BridgeTransfer>, BridgeError> {
    let future = async {
        let transfer = aggregator
            .get_eth_transfer(&query.transaction_id)?
            .ok_or(BridgeError::TransferNotFound)?;
        Ok(Json(BridgeTransfer::Ethereum(transfer)))
    };
    with_metrics!(metrics, "get_eth_transfer", future).await
}

async fn get_kaon_transfer(
    Query(query): Query<TransferQuery>,
    State((aggregator, metrics)): State<ServerState>,
) -> Result<Json<BridgeTransfer>, BridgeError> {
    let future = async {
        let transfer = aggregator
            .get_kaon_transfer(&query.transaction_id, query.op_id.as_deref())?
            .ok_or(BridgeError::TransferNotFound)?;
        Ok(Json(BridgeTransfer::Kaon(transfer)))
    };
    with_metrics!(metrics, "get_kaon_transfer", future).await
}

async fn submit_signature(
    State((aggregator, metrics)): State<ServerState>,
    Json(submission): Json<SubmittedSignature>,
) -> Result<String, BridgeError> {
    let future = async { aggregator.ingest_peer_submission(&submission).await };
    with_metrics!(metrics, "submit_signature", future).await
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            tracing::debug!("Received {} request", $type_);
            $metrics.requests_received.with_label_values(&[$type_]).inc();
            $metrics.requests_inflight.with_label_values(&[$type_]).inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    tracing::info!("{} request failed: {}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics.requests_inflight.with_label_values(&[$type_]).dec();
            result
        }
    };
}
