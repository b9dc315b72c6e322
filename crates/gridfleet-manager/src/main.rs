// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! gridfleet-manager - Single-Host Worker Fleet Manager
//!
//! Keeps a pool of worker servers warm on this host, recovers workers left
//! by a previous run and reconciles the fleet until interrupted.

use std::sync::Arc;

use tracing::{info, warn};

use gridfleet_manager::backend::select_factory;
use gridfleet_manager::config::Config;
use gridfleet_manager::port_allocator::PortAllocator;
use gridfleet_manager::rpc::RpcTransport;
use gridfleet_manager::rpc::http::HttpRpcTransport;
use gridfleet_manager::runtime::FleetRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gridfleet_manager=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        backend = ?config.backend,
        port_range_start = config.ports.start,
        port_range_end = config.ports.end,
        "Starting gridfleet-manager"
    );

    let ports = Arc::new(PortAllocator::new(config.ports.clone()));
    let transport: Arc<dyn RpcTransport> = Arc::new(HttpRpcTransport::new());
    let factory = select_factory(&config, ports.clone(), transport.clone()).await;

    let runtime = FleetRuntime::builder()
        .config(config)
        .port_allocator(ports)
        .transport(transport)
        .factory(factory)
        .build()?
        .start()
        .await?;

    info!("Fleet manager ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("gridfleet-manager shut down");

    Ok(())
}
