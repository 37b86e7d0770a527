// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The in-worker engine: generations, readiness and hot reload.
//!
//! # Usage
//!
//! ```ignore
//! use ravel_core::config::Config;
//! use ravel_core::engine::Engine;
//!
//! let engine = Engine::builder(Config::from_env()?)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! let reply = engine.dispatch_endpoint("orders", request).await?;
//! engine.reload().await?;
//! engine.shutdown().await;
//! ```
//!
//! # Reload
//!
//! A reload loads the environment document first; an unchanged `timestamp` skips the
//! rest. Otherwise the engine stops accepting requests (`initializing`), waits for
//! in-flight requests, stops the listeners, tears down the current generation, builds
//! the next one, starts its listeners, swaps it in and reports `running` again.

mod dispatch;
mod generation;

pub use generation::Generation;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tracing::{info, warn};

use crate::adapters::{FactoryTable, RealtimeAdapter};
use crate::config::Config;
use crate::descriptor::crypto::AccessCipher;
use crate::descriptor::{ConfigSource, EnvironmentConfig, FileConfigSource};
use crate::error::{EngineError, Result};
use crate::handlers::{ManifestModuleLoader, ModuleLoader};
use crate::pipeline::{Listeners, SendOptions};
use crate::tracking::{self, TrackingStore};
use generation::GenerationParts;

/// Readiness of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    /// Starting or reloading; requests are rejected.
    Initializing,
    /// Serving requests.
    Running,
    /// Shut down; requests are rejected.
    Stopped,
}

impl EngineStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`Engine::reload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new generation is active.
    Reloaded(u64),
    /// The document timestamp was unchanged; the current generation stays.
    Skipped(u64),
}

impl ReloadOutcome {
    /// Number of the generation active after the reload.
    pub fn generation(&self) -> u64 {
        match self {
            Self::Reloaded(n) | Self::Skipped(n) => *n,
        }
    }
}

/// Builder for engine configuration.
pub struct EngineBuilder {
    config: Config,
    source: Option<Arc<dyn ConfigSource>>,
    factories: Option<FactoryTable>,
    loaders: Vec<Arc<dyn ModuleLoader>>,
    tracking: Option<Arc<dyn TrackingStore>>,
    manifests: bool,
}

impl EngineBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            source: None,
            factories: None,
            loaders: Vec::new(),
            tracking: None,
            manifests: true,
        }
    }

    /// Read environment documents from `source` instead of `config_path`.
    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use a custom factory table instead of the built-in backends.
    pub fn factories(mut self, factories: FactoryTable) -> Self {
        self.factories = Some(factories);
        self
    }

    /// Add a module loader. Loaders are consulted in the order added, before the
    /// manifest loader over `code_dir`.
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    /// Do not resolve modules from manifests in `code_dir`.
    pub fn without_manifests(mut self) -> Self {
        self.manifests = false;
        self
    }

    /// Use an existing tracking store instead of connecting to
    /// `tracking_database_url`.
    pub fn tracking(mut self, tracking: Arc<dyn TrackingStore>) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Build the engine configuration.
    pub fn build(self) -> Result<EngineConfig> {
        if self.config.env_id.trim().is_empty() {
            return Err(EngineError::InvalidConfiguration("env_id must not be empty".to_string()));
        }

        let mut loaders = self.loaders;
        if self.manifests {
            loaders.push(Arc::new(ManifestModuleLoader::new(&self.config.code_dir)));
        }
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(FileConfigSource::new(&self.config.config_path)));

        Ok(EngineConfig {
            cipher: self.config.encryption_key.as_deref().map(AccessCipher::new),
            config: self.config,
            source,
            factories: Arc::new(self.factories.unwrap_or_else(FactoryTable::with_defaults)),
            loaders,
            tracking: self.tracking,
        })
    }
}

/// Validated engine configuration, ready to start.
pub struct EngineConfig {
    config: Config,
    source: Arc<dyn ConfigSource>,
    factories: Arc<FactoryTable>,
    loaders: Vec<Arc<dyn ModuleLoader>>,
    tracking: Option<Arc<dyn TrackingStore>>,
    cipher: Option<AccessCipher>,
}

impl EngineConfig {
    /// Connect the tracking store, build the first generation and start listening.
    pub async fn start(self) -> Result<Engine> {
        let tracking = match self.tracking {
            Some(tracking) => tracking,
            None => tracking::connect(&self.config.tracking_database_url).await?,
        };

        let engine = Engine {
            inner: Arc::new(EngineInner {
                config: self.config,
                source: self.source,
                factories: self.factories,
                loaders: self.loaders,
                tracking,
                cipher: self.cipher,
                status: watch::Sender::new(EngineStatus::Initializing),
                generation: RwLock::new(None),
                listeners: Mutex::new(None),
                reload_lock: Mutex::new(()),
                in_flight: Arc::new(InFlight::default()),
                next_generation: AtomicU64::new(1),
                termination: watch::Sender::new(false),
            }),
        };

        let outcome = engine.reload().await?;
        info!(
            env_id = %engine.inner.config.env_id,
            generation = outcome.generation(),
            "Engine started"
        );
        Ok(engine)
    }
}

/// Counts in-flight requests so a reload can wait for them.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> RequestGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        RequestGuard { in_flight: self.clone() }
    }

    async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Marks one request as in flight until dropped.
pub(crate) struct RequestGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

struct EngineInner {
    config: Config,
    source: Arc<dyn ConfigSource>,
    factories: Arc<FactoryTable>,
    loaders: Vec<Arc<dyn ModuleLoader>>,
    tracking: Arc<dyn TrackingStore>,
    cipher: Option<AccessCipher>,
    status: watch::Sender<EngineStatus>,
    generation: RwLock<Option<Arc<Generation>>>,
    listeners: Mutex<Option<Listeners>>,
    reload_lock: Mutex<()>,
    in_flight: Arc<InFlight>,
    next_generation: AtomicU64,
    termination: watch::Sender<bool>,
}

/// The running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create a builder for the given process configuration.
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Process configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Current readiness.
    pub fn status(&self) -> EngineStatus {
        *self.inner.status.borrow()
    }

    /// Watch readiness changes.
    pub fn subscribe_status(&self) -> watch::Receiver<EngineStatus> {
        self.inner.status.subscribe()
    }

    /// Resolves to `true` once a request asked for the worker to be replaced.
    pub fn termination_requested(&self) -> watch::Receiver<bool> {
        self.inner.termination.subscribe()
    }

    /// Tracking store shared by all generations.
    pub fn tracking(&self) -> &Arc<dyn TrackingStore> {
        &self.inner.tracking
    }

    /// The active generation.
    pub fn generation(&self) -> Option<Arc<Generation>> {
        self.inner
            .generation
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Realtime bus of the active generation.
    pub fn realtime(&self) -> Option<Arc<dyn RealtimeAdapter>> {
        self.generation().and_then(|g| g.realtime())
    }

    fn set_status(&self, status: EngineStatus) {
        let previous = self.inner.status.send_replace(status);
        if previous != status {
            info!(from = %previous, to = %status, "Engine status changed");
        }
    }

    /// Admit one request against the active generation.
    ///
    /// The request is counted before readiness is checked, so a reload that has
    /// switched to `initializing` either sees it in flight or it is rejected here.
    pub(crate) fn admit(&self) -> Result<(RequestGuard, Arc<Generation>)> {
        let guard = self.inner.in_flight.enter();
        if self.status() != EngineStatus::Running {
            return Err(EngineError::ServerNotReady);
        }
        let generation = self.generation().ok_or(EngineError::ServerNotReady)?;
        Ok((guard, generation))
    }

    /// Submit a message to a logical queue of the active generation.
    pub async fn send_message(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: SendOptions,
    ) -> Result<String> {
        let (_guard, generation) = self.admit()?;
        generation.pipeline().send_message(queue, payload, options).await
    }

    /// Run a task now, outside its schedule.
    pub async fn trigger_task(&self, task: &str, debug_channel: Option<String>) -> Result<String> {
        let (_guard, generation) = self.admit()?;
        generation.pipeline().trigger_task(task, debug_channel).await
    }

    /// Load the environment document and, if it changed, replace the generation.
    ///
    /// A document that cannot be loaded or fails validation leaves the active
    /// generation untouched.
    pub async fn reload(&self) -> Result<ReloadOutcome> {
        let _serial = self.inner.reload_lock.lock().await;
        if self.status() == EngineStatus::Stopped && self.generation().is_some() {
            return Err(EngineError::ServerNotReady);
        }

        let env = self.inner.source.load().await?;
        env.validate()?;
        if env.iid != self.inner.config.env_id && !env.iid.is_empty() {
            warn!(
                env_id = %self.inner.config.env_id,
                document = %env.iid,
                "Environment document belongs to another environment id"
            );
        }

        let current = self.generation();
        if let Some(current) = &current
            && env.timestamp.is_some()
            && current.timestamp() == env.timestamp.as_deref()
        {
            info!(generation = current.number(), "Environment unchanged, reload skipped");
            return Ok(ReloadOutcome::Skipped(current.number()));
        }

        self.set_status(EngineStatus::Initializing);
        self.inner.in_flight.drained().await;
        self.stop_current(current.as_deref()).await;

        let number = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let next = Arc::new(self.build_generation(number, env).await);
        let listeners = next.pipeline().start().await;

        *self.inner.listeners.lock().await = Some(listeners);
        *self
            .inner
            .generation
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(next);
        self.set_status(EngineStatus::Running);

        info!(env_id = %self.inner.config.env_id, generation = number, "Generation active");
        Ok(ReloadOutcome::Reloaded(number))
    }

    async fn build_generation(&self, number: u64, env: EnvironmentConfig) -> Generation {
        Generation::build(
            number,
            env,
            GenerationParts {
                config: &self.inner.config,
                factories: &self.inner.factories,
                loaders: &self.inner.loaders,
                tracking: &self.inner.tracking,
                cipher: self.inner.cipher.as_ref(),
            },
        )
        .await
    }

    async fn stop_current(&self, current: Option<&Generation>) {
        if let Some(listeners) = self.inner.listeners.lock().await.take() {
            listeners.stop().await;
        }
        if let Some(current) = current {
            current.teardown().await;
        }
    }

    /// Stop accepting requests, wait for in-flight ones, stop listeners and disconnect
    /// every adapter. Never fails.
    pub async fn shutdown(&self) {
        let _serial = self.inner.reload_lock.lock().await;
        self.set_status(EngineStatus::Stopped);
        self.inner.in_flight.drained().await;
        let current = self.generation();
        self.stop_current(current.as_deref()).await;
        info!(env_id = %self.inner.config.env_id, "Engine stopped");
    }

    pub(crate) fn request_termination(&self) {
        self.inner.termination.send_replace(true);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("env_id", &self.inner.config.env_id)
            .field("status", &self.status())
            .field("generation", &self.generation().map(|g| g.number()))
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::testing::{document, engine};
    use super::*;
    use crate::descriptor::StaticConfigSource;
    use crate::handlers::{StaticCatalog, handler_fn};
    use crate::pipeline::testing::wait_terminal;
    use crate::tracking::{TrackingKind, TrackingStatus};

    fn catalog() -> StaticCatalog {
        StaticCatalog::new()
            .with_handler(
                "hello",
                handler_fn(|ctx, _req| async move { Ok(json!({"token": ctx.cache_token})) }),
            )
            .with_handler("auth", handler_fn(|_ctx, req| async move { Ok(req) }))
            .with_handler("job", handler_fn(|_ctx, _payload| async { Ok(Value::Null) }))
    }

    #[tokio::test]
    async fn test_start_and_skip_unchanged_reload() {
        let source = Arc::new(StaticConfigSource::new(document("1", false)));
        let engine = engine(source.clone(), catalog()).await.unwrap();

        assert_eq!(engine.status(), EngineStatus::Running);
        let first = engine.generation().unwrap();
        assert_eq!(first.number(), 1);
        assert_eq!(first.registry().len(), 2);
        assert!(engine.realtime().is_some());

        assert_eq!(engine.reload().await.unwrap(), ReloadOutcome::Skipped(1));
        assert!(Arc::ptr_eq(&first, &engine.generation().unwrap()));

        source.replace(document("2", false));
        assert_eq!(engine.reload().await.unwrap(), ReloadOutcome::Reloaded(2));
        let second = engine.generation().unwrap();
        assert_eq!(second.number(), 2);
        assert_eq!(second.registry().len(), 2);
        // The previous generation was torn down.
        assert!(first.registry().is_empty());

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_waits_for_in_flight_requests() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (started_in, release_in) = (started.clone(), release.clone());
        let catalog = catalog().with_handler(
            "hold",
            handler_fn(move |ctx, _req| {
                let (started, release) = (started_in.clone(), release_in.clone());
                async move {
                    started.notify_one();
                    release.notified().await;
                    // Resources of the admitting generation stay usable until the end.
                    assert!(ctx.resources.realtime().is_some());
                    Ok(json!(ctx.cache_token))
                }
            }),
        );
        let mut doc = document("1", false);
        let hold = json!({"iid": "e-9", "name": "hold", "module": "hold"});
        doc.endpoints.push(serde_json::from_value(hold).unwrap());
        let source = Arc::new(StaticConfigSource::new(doc.clone()));
        let engine = engine(source.clone(), catalog).await.unwrap();
        let first_token = engine.generation().unwrap().handlers().cache_token().to_string();

        let request = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .dispatch_endpoint("hold", super::testing::request(Value::Null))
                    .await
            }
        });
        started.notified().await;

        doc.timestamp = Some("2".to_string());
        source.replace(doc);
        let reloaded = Arc::new(AtomicBool::new(false));
        let reload = tokio::spawn({
            let (engine, reloaded) = (engine.clone(), reloaded.clone());
            async move {
                let outcome = engine.reload().await;
                reloaded.store(true, Ordering::SeqCst);
                outcome
            }
        });

        // While draining, new requests are turned away and the reload waits.
        let mut status = engine.subscribe_status();
        status.wait_for(|s| *s == EngineStatus::Initializing).await.unwrap();
        let err = engine
            .dispatch_endpoint("hello", super::testing::request(Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "serverNotReady");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reloaded.load(Ordering::SeqCst));

        release.notify_one();
        assert_eq!(request.await.unwrap().unwrap(), json!(first_token));
        assert_eq!(reload.await.unwrap().unwrap(), ReloadOutcome::Reloaded(2));

        let reply = engine
            .dispatch_endpoint("hello", super::testing::request(Value::Null))
            .await
            .unwrap();
        assert_ne!(reply["token"], json!(first_token));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_document_keeps_generation() {
        let source = Arc::new(StaticConfigSource::new(document("1", false)));
        let engine = engine(source.clone(), catalog()).await.unwrap();

        let mut broken = document("2", false);
        broken.endpoints[0].middlewares.push("missing".to_string());
        source.replace(broken);
        let err = engine.reload().await.unwrap_err();
        assert_eq!(err.error_code(), "invalidConfiguration");
        assert_eq!(engine.status(), EngineStatus::Running);
        assert_eq!(engine.generation().unwrap().number(), 1);
        assert_eq!(engine.generation().unwrap().registry().len(), 2);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_requests() {
        let source = Arc::new(StaticConfigSource::new(document("1", false)));
        let engine = engine(source, catalog()).await.unwrap();
        let generation = engine.generation().unwrap();

        engine.shutdown().await;
        assert_eq!(engine.status(), EngineStatus::Stopped);
        assert!(generation.registry().is_empty());

        let err = engine.send_message("jobs", json!({}), SendOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "serverNotReady");
        assert_eq!(engine.reload().await.unwrap_err().error_code(), "serverNotReady");
    }

    #[tokio::test]
    async fn test_send_through_engine() {
        let source = Arc::new(StaticConfigSource::new(document("1", false)));
        let engine = engine(source, catalog()).await.unwrap();

        let id = engine
            .send_message("jobs", json!({"n": 1}), SendOptions::default())
            .await
            .unwrap();
        let status = wait_terminal(engine.tracking(), TrackingKind::Message, &id).await;
        assert_eq!(status, TrackingStatus::Completed);

        engine.shutdown().await;
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(EngineStatus::Initializing).unwrap(),
            json!("initializing")
        );
        assert_eq!(EngineStatus::Stopped.to_string(), "stopped");
        assert_eq!(ReloadOutcome::Skipped(4).generation(), 4);
    }
}
