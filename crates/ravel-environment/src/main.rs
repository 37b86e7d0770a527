// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ravel Environment - Worker Supervisor
//!
//! Supervises the worker process for one environment:
//! - Spawns and respawns `ravel-worker`
//! - Heartbeats it over the stdio control channel
//! - Forwards reload triggers from Redis pub/sub

use std::sync::Arc;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

use ravel_environment::config::Config;
use ravel_environment::launcher::{Launcher, ProcessLauncher};
use ravel_environment::runtime::EnvironmentRuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ravel_environment=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        env_id = %config.env_id,
        worker_binary = %config.worker_binary.display(),
        reload_trigger = config.redis_url.is_some(),
        "Starting Ravel Environment"
    );

    let launcher = Arc::new(ProcessLauncher::new());
    info!(launcher_type = launcher.launcher_type(), "Launcher initialized");

    let runtime = EnvironmentRuntimeBuilder::from_config(&config)
        .launcher(launcher)
        .build()?
        .start()
        .await?;

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = runtime.stopped() => info!("Worker exited on its own"),
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Ravel Environment shut down");

    Ok(())
}
