// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One loaded configuration with its live resources and handlers.

use std::sync::Arc;

use tracing::info;

use crate::adapters::{FactoryTable, RealtimeAdapter};
use crate::config::Config;
use crate::descriptor::EnvironmentConfig;
use crate::descriptor::crypto::AccessCipher;
use crate::handlers::{HandlerContext, HandlerRegistry, ModuleLoader};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::registry::{AdapterRegistry, RegistryOptions};
use crate::tracking::TrackingStore;

/// Everything a generation is built from besides the environment document.
pub(crate) struct GenerationParts<'a> {
    pub config: &'a Config,
    pub factories: &'a Arc<FactoryTable>,
    pub loaders: &'a [Arc<dyn ModuleLoader>],
    pub tracking: &'a Arc<dyn TrackingStore>,
    pub cipher: Option<&'a AccessCipher>,
}

/// An immutable snapshot of the environment: registry, handlers and pipeline.
///
/// Requests hold an `Arc<Generation>` for their whole duration; a reload builds a new
/// generation and swaps it in as a whole.
pub struct Generation {
    number: u64,
    env: Arc<EnvironmentConfig>,
    registry: Arc<AdapterRegistry>,
    handlers: Arc<HandlerRegistry>,
    pipeline: Pipeline,
}

impl Generation {
    /// Connect every resource of `env` and prepare handler resolution.
    pub(crate) async fn build(
        number: u64,
        env: EnvironmentConfig,
        parts: GenerationParts<'_>,
    ) -> Self {
        let env = Arc::new(env);
        let registry = Arc::new(AdapterRegistry::new(
            env.clone(),
            RegistryOptions {
                env_id: parts.config.env_id.clone(),
                default_pool_size: parts.config.default_db_pool_size,
                disconnect_timeout: parts.config.disconnect_timeout,
            },
            parts.factories.clone(),
            parts.cipher.cloned(),
        ));
        registry.setup_all().await;

        let handlers = Arc::new(HandlerRegistry::new(parts.loaders.to_vec()));
        let pipeline = Pipeline::new(
            PipelineSettings::from(parts.config),
            registry.clone(),
            handlers.clone(),
            parts.tracking.clone(),
        );

        info!(
            env_id = %parts.config.env_id,
            generation = number,
            cache_token = %handlers.cache_token(),
            resources = registry.len(),
            "Generation built"
        );

        Self {
            number,
            env,
            registry,
            handlers,
            pipeline,
        }
    }

    /// Monotonic generation number, starting at 1.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Deployment marker of the loaded document.
    pub fn timestamp(&self) -> Option<&str> {
        self.env.timestamp.as_deref()
    }

    /// Loaded environment document.
    pub fn environment(&self) -> &Arc<EnvironmentConfig> {
        &self.env
    }

    /// Live resources.
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// Handler resolution for this generation.
    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    /// Message pipeline bound to this generation.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Realtime bus, if one is configured.
    pub fn realtime(&self) -> Option<Arc<dyn RealtimeAdapter>> {
        self.registry.realtime()
    }

    /// Context handed to endpoint and middleware handlers.
    pub fn context(&self, env_id: &str) -> HandlerContext {
        HandlerContext {
            env_id: env_id.to_string(),
            params: Arc::new(self.env.params.clone()),
            resources: self.registry.clone(),
            tracking_id: None,
            cache_token: self.handlers.cache_token().to_string(),
        }
    }

    /// Release every adapter. Never fails.
    pub(crate) async fn teardown(&self) {
        self.registry.disconnect_all().await;
        info!(generation = self.number, "Generation torn down");
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("timestamp", &self.env.timestamp)
            .field("registry", &self.registry)
            .field("handlers", &self.handlers)
            .finish()
    }
}
