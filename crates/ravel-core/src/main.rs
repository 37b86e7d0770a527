// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ravel Worker - serves one environment
//!
//! Started and supervised by ravel-environment. Control messages arrive on stdin and
//! replies go to stdout; logs go to stderr.
//!
//! Exit codes: 0 after a requested shutdown (control `shutdown`, SIGINT, SIGTERM,
//! SIGHUP or closed control stream), 1 when a request asked for the worker to be
//! replaced.

use std::process::ExitCode;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ravel_core::config::Config;
use ravel_core::control::{self, ControlExit, ControlMessage};
use ravel_core::engine::Engine;
use ravel_core::pipeline::{debug_relay, forward_events};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("RAVEL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("ravel_core=info"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    let (relay, events) = debug_relay();
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(relay)
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        env_id = %config.env_id,
        config_path = %config.config_path.display(),
        code_dir = %config.code_dir.display(),
        "Starting Ravel worker"
    );

    let engine = Engine::builder(config).build()?.start().await?;

    tokio::spawn({
        let engine = engine.clone();
        forward_events(events, move || engine.realtime())
    });

    let mut stdout = tokio::io::stdout();
    let generation = engine.generation().map(|g| g.number()).unwrap_or_default();
    control::send(&mut stdout, ControlMessage::Ready { generation }).await?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut termination = engine.termination_requested();

    // Runs on its own task so a reload in progress completes before shutdown.
    let mut control_loop = tokio::spawn({
        let engine = engine.clone();
        async move { control::serve(&engine, BufReader::new(tokio::io::stdin()), stdout).await }
    });

    let exit = tokio::select! {
        result = &mut control_loop => {
            match result {
                Ok(Ok(ControlExit::Shutdown)) => info!("Shutdown requested by supervisor"),
                Ok(Ok(ControlExit::Closed)) => info!("Control channel closed"),
                Ok(Err(e)) => error!(error = %e, "Control channel failed"),
                Err(e) => error!(error = %e, "Control task panicked"),
            }
            ExitCode::SUCCESS
        }
        _ = sigint.recv() => {
            info!("SIGINT received");
            ExitCode::SUCCESS
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            ExitCode::SUCCESS
        }
        _ = sighup.recv() => {
            info!("SIGHUP received, cleaning up");
            ExitCode::SUCCESS
        }
        _ = async { let _ = termination.wait_for(|requested| *requested).await; } => {
            error!("Worker replacement requested");
            ExitCode::FAILURE
        }
    };

    engine.shutdown().await;
    control_loop.abort();
    info!("Shutdown complete");
    Ok(exit)
}
