// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};

#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,
    pub(crate) last_synced_eth_block: IntGauge,
    pub(crate) last_synced_kaon_block: IntGauge,
    pub(crate) events_dispatched: IntCounterVec,
    pub(crate) broadcast_responses: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "bridge_requests_received",
                "Total requests received by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "bridge_requests_ok",
                "Total successful requests by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "bridge_err_requests",
                "Total failed requests by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "bridge_requests_inflight",
                "In-flight requests by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            last_synced_eth_block: register_int_gauge_with_registry!(
                "bridge_last_synced_eth_block",
                "Highest Ethereum block dispatched to the aggregator",
                registry,
            )
            .unwrap(),
            last_synced_kaon_block: register_int_gauge_with_registry!(
                "bridge_last_synced_kaon_block",
                "Highest Kaon block dispatched to the aggregator",
                registry,
            )
            .unwrap(),
            events_dispatched: register_int_counter_vec_with_registry!(
                "bridge_events_dispatched",
                "Bridge contract events dispatched by chain and event kind",
                &["chain", "event"],
                registry,
            )
            .unwrap(),
            broadcast_responses: register_int_counter_vec_with_registry!(
                "bridge_broadcast_responses",
                "Peer broadcast responses by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        Self::new(&Registry::new())
    }
}
