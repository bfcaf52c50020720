// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use kaon_bridge::config::{BridgeCliArgs, BridgeNodeConfig};
use kaon_bridge::node::run_bridge_node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = BridgeCliArgs::parse();
    let config = BridgeNodeConfig::load(args)?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.log_level);
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let prometheus_registry = prometheus::Registry::new();
    run_bridge_node(config, prometheus_registry).await
}
