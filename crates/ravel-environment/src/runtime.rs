// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for ravel-environment.
//!
//! This module provides [`EnvironmentRuntime`], which supervises one worker and,
//! when a Redis URL is configured, listens for reload triggers.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ravel_environment::launcher::ProcessLauncher;
//! use ravel_environment::runtime::EnvironmentRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = EnvironmentRuntime::builder()
//!         .env_id("env-123")
//!         .launcher(Arc::new(ProcessLauncher::new()))
//!         .worker_binary("/usr/local/bin/ravel-worker")
//!         .redis_url("redis://localhost:6379")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run until told to stop ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::launcher::{LaunchOptions, Launcher, ProcessLauncher};
use crate::reload::ReloadListener;
use crate::supervisor::{ReloadTrigger, Supervisor, SupervisorConfig, WorkerState};

/// Builder for creating an [`EnvironmentRuntime`].
pub struct EnvironmentRuntimeBuilder {
    env_id: Option<String>,
    launcher: Option<Arc<dyn Launcher>>,
    worker_binary: PathBuf,
    worker_args: Vec<String>,
    worker_env: Vec<(String, String)>,
    redis_url: Option<String>,
    supervisor: SupervisorConfig,
}

impl Default for EnvironmentRuntimeBuilder {
    fn default() -> Self {
        Self {
            env_id: None,
            launcher: None,
            worker_binary: PathBuf::from("ravel-worker"),
            worker_args: Vec::new(),
            worker_env: Vec::new(),
            redis_url: None,
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl EnvironmentRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder preloaded from environment configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            env_id: Some(config.env_id.clone()),
            worker_binary: config.worker_binary.clone(),
            redis_url: config.redis_url.clone(),
            supervisor: SupervisorConfig::from(config),
            ..Self::default()
        }
    }

    /// Set the environment id (required).
    pub fn env_id(mut self, env_id: impl Into<String>) -> Self {
        self.env_id = Some(env_id.into());
        self
    }

    /// Set the worker launcher.
    ///
    /// Default: [`ProcessLauncher`]
    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Set the worker executable.
    ///
    /// Default: `ravel-worker`
    pub fn worker_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_binary = path.into();
        self
    }

    /// Append an argument for the worker.
    pub fn worker_arg(mut self, arg: impl Into<String>) -> Self {
        self.worker_args.push(arg.into());
        self
    }

    /// Set an environment variable for the worker.
    pub fn worker_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.worker_env.push((key.into(), value.into()));
        self
    }

    /// Listen for reload triggers on this Redis server.
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the heartbeat interval.
    ///
    /// Default: 30 seconds
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.supervisor.heartbeat_interval = interval;
        self
    }

    /// Set how long a heartbeat may go unanswered.
    ///
    /// Default: 10 seconds
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.supervisor.heartbeat_timeout = timeout;
        self
    }

    /// Replace all supervisor timings.
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor = config;
        self
    }

    /// Validate and build the runtime configuration.
    pub fn build(self) -> Result<EnvironmentRuntimeConfig> {
        let env_id = self
            .env_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("env_id is required"))?;
        let supervisor = &self.supervisor;
        if supervisor.heartbeat_interval.is_zero() || supervisor.heartbeat_timeout.is_zero() {
            anyhow::bail!("heartbeat interval and timeout must be positive");
        }

        let mut options = LaunchOptions::new(env_id, self.worker_binary);
        options.args = self.worker_args;
        options.env = self.worker_env.into_iter().collect();

        Ok(EnvironmentRuntimeConfig {
            launcher: self
                .launcher
                .unwrap_or_else(|| Arc::new(ProcessLauncher::new())),
            options,
            redis_url: self.redis_url,
            supervisor: self.supervisor,
        })
    }
}

/// Validated configuration, ready to start.
pub struct EnvironmentRuntimeConfig {
    launcher: Arc<dyn Launcher>,
    options: LaunchOptions,
    redis_url: Option<String>,
    supervisor: SupervisorConfig,
}

impl EnvironmentRuntimeConfig {
    /// Start supervising the worker.
    pub async fn start(self) -> Result<EnvironmentRuntime> {
        let env_id = self.options.env_id.clone();
        let supervisor = Arc::new(Supervisor::new(self.launcher, self.options, self.supervisor));
        let reload = supervisor.reload_trigger();
        let state = supervisor.subscribe();
        let supervisor_shutdown = supervisor.shutdown_handle();

        // Subscribe before the worker starts so no trigger is missed
        let listener = match &self.redis_url {
            Some(url) => {
                let listener = ReloadListener::new(url, &env_id, reload.clone())?;
                let shutdown = listener.shutdown_handle();
                let handle = tokio::spawn(async move {
                    listener.run().await;
                });
                Some((shutdown, handle))
            }
            None => {
                debug!("No Redis URL configured; reloads only via the runtime handle");
                None
            }
        };

        let supervisor_handle = tokio::spawn(async move {
            supervisor.run().await;
        });

        info!(
            env_id = %env_id,
            reload_listener = listener.is_some(),
            "EnvironmentRuntime started"
        );

        Ok(EnvironmentRuntime {
            supervisor_handle,
            supervisor_shutdown,
            listener,
            reload,
            state,
        })
    }
}

/// A running supervisor.
pub struct EnvironmentRuntime {
    supervisor_handle: JoinHandle<()>,
    supervisor_shutdown: Arc<Notify>,
    listener: Option<(Arc<Notify>, JoinHandle<()>)>,
    reload: ReloadTrigger,
    state: watch::Receiver<WorkerState>,
}

impl EnvironmentRuntime {
    /// Create a new builder.
    pub fn builder() -> EnvironmentRuntimeBuilder {
        EnvironmentRuntimeBuilder::new()
    }

    /// Ask the worker to reload.
    pub fn reload(&self) {
        self.reload.trigger();
    }

    /// Current worker state.
    pub fn worker_state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Watch the worker state.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Whether supervision is still going on.
    pub fn is_running(&self) -> bool {
        !self.supervisor_handle.is_finished()
    }

    /// Wait until supervision ends on its own (a worker exited cleanly).
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == WorkerState::Stopped).await;
    }

    /// Stop the worker gracefully and wait for background tasks.
    pub async fn shutdown(self) -> Result<()> {
        info!("EnvironmentRuntime shutting down");

        if let Some((shutdown, handle)) = self.listener {
            shutdown.notify_one();
            if let Err(e) = handle.await {
                error!("Reload listener task panicked: {}", e);
            }
        }

        self.supervisor_shutdown.notify_one();
        match self.supervisor_handle.await {
            Ok(()) => {
                info!("EnvironmentRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Supervisor task panicked: {}", e);
                Err(anyhow::anyhow!("supervisor task panicked: {}", e))
            }
        }
    }
}
