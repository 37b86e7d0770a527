// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler modules and their resolution.
//!
//! A handler module has one default export that must be invocable. Modules come from
//! [`ModuleLoader`]s: the in-process [`StaticCatalog`] and the [`ManifestModuleLoader`]
//! over a code directory. A [`HandlerRegistry`] belongs to one generation; it resolves
//! modules lazily at dispatch and caches them until the next reload.

pub mod manifest;

pub use manifest::ManifestModuleLoader;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::registry::AdapterRegistry;

/// Length of the per-generation cache-busting token.
const CACHE_TOKEN_LEN: usize = 6;

/// Draw a fresh cache-busting token.
pub fn new_cache_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CACHE_TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// What a module is bound as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Serves an endpoint; receives the request.
    Endpoint,
    /// Runs before endpoint handlers; receives and returns the request.
    Middleware,
    /// Consumes queue messages; receives the payload.
    QueueHandler,
    /// Runs on schedule; receives nothing.
    TaskHandler,
}

impl HandlerKind {
    /// Error code for a module that cannot be found or loaded.
    pub fn import_error_code(&self) -> &'static str {
        match self {
            Self::QueueHandler => "queueImportError",
            Self::TaskHandler => "cronJobImportError",
            Self::Endpoint | Self::Middleware => "endpointImportError",
        }
    }

    /// Error code for a handler that failed while running.
    pub fn execution_error_code(&self) -> &'static str {
        match self {
            Self::QueueHandler => "queueExecutionError",
            Self::TaskHandler => "cronJobExecutionError",
            Self::Endpoint | Self::Middleware => "endpointExecutionError",
        }
    }
}

/// What a running handler can reach.
#[derive(Clone)]
pub struct HandlerContext {
    /// Environment id.
    pub env_id: String,
    /// Application parameters.
    pub params: Arc<Map<String, Value>>,
    /// Resources of the current generation.
    pub resources: Arc<AdapterRegistry>,
    /// Tracking id of the message or task run being processed.
    pub tracking_id: Option<String>,
    /// Cache-busting token of the current generation.
    pub cache_token: String,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("env_id", &self.env_id)
            .field("tracking_id", &self.tracking_id)
            .field("cache_token", &self.cache_token)
            .finish()
    }
}

/// An invocable default export.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Run the handler.
    async fn call(&self, ctx: &HandlerContext, input: Value) -> Result<Value>;
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, ctx: &HandlerContext, input: Value) -> Result<Value> {
        (self.f)(ctx.clone(), input).await
    }
}

/// A module's default export.
#[derive(Clone)]
pub enum Export {
    /// Something that can be called.
    Function(Arc<dyn Handler>),
    /// A plain value; resolving it as a handler fails with `invalidFunction`.
    Value(Value),
}

/// A loaded module.
#[derive(Clone, Default)]
pub struct Module {
    /// Default export, if any.
    pub default: Option<Export>,
}

impl Module {
    /// A module whose default export is `handler`.
    pub fn with_handler(handler: impl Handler + 'static) -> Self {
        Self {
            default: Some(Export::Function(Arc::new(handler))),
        }
    }
}

/// Why a module could not be resolved to a handler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolveError {
    /// No loader knows the module.
    #[error("module '{0}' was not found")]
    NotFound(String),

    /// A loader knows the module but could not load it.
    #[error("module '{module}' could not be loaded: {reason}")]
    Load {
        /// Module id.
        module: String,
        /// Failure description.
        reason: String,
    },

    /// The module has no default export.
    #[error("module '{0}' has no default export")]
    MissingDefaultExport(String),

    /// The default export is not invocable.
    #[error("default export of module '{0}' is not a function")]
    NotInvocable(String),
}

impl ResolveError {
    /// Error as seen by callers of a handler of `kind`.
    pub fn into_engine_error(self, kind: HandlerKind) -> EngineError {
        let code = match &self {
            Self::NotFound(_) | Self::Load { .. } => kind.import_error_code(),
            Self::MissingDefaultExport(_) => "missingDefaultExport",
            Self::NotInvocable(_) => "invalidFunction",
        };
        EngineError::handler(code, self.to_string())
    }
}

/// Source of handler modules.
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    /// Loader name for logs.
    fn name(&self) -> &'static str;

    /// Load a module. `Ok(None)` means this loader does not know it.
    async fn load(
        &self,
        module_id: &str,
        cache_token: &str,
    ) -> std::result::Result<Option<Module>, ResolveError>;
}

/// Modules compiled into the embedding process.
#[derive(Clone, Default)]
pub struct StaticCatalog {
    modules: HashMap<String, Module>,
}

impl StaticCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under `id`.
    pub fn with_module(mut self, id: impl Into<String>, module: Module) -> Self {
        self.modules.insert(id.into(), module);
        self
    }

    /// Register a handler as the default export of module `id`.
    pub fn with_handler(self, id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.with_module(id, Module::with_handler(handler))
    }

    /// Number of modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

#[async_trait]
impl ModuleLoader for StaticCatalog {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn load(
        &self,
        module_id: &str,
        _cache_token: &str,
    ) -> std::result::Result<Option<Module>, ResolveError> {
        Ok(self.modules.get(module_id).cloned())
    }
}

/// Resolves module ids to handlers for one generation.
pub struct HandlerRegistry {
    loaders: Vec<Arc<dyn ModuleLoader>>,
    cache_token: String,
    resolved: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    /// A registry over `loaders`, consulted in order, with a fresh cache token.
    pub fn new(loaders: Vec<Arc<dyn ModuleLoader>>) -> Self {
        Self {
            loaders,
            cache_token: new_cache_token(),
            resolved: DashMap::new(),
        }
    }

    /// Cache-busting token of this generation.
    pub fn cache_token(&self) -> &str {
        &self.cache_token
    }

    /// Resolve a module id to its default export.
    pub async fn resolve(
        &self,
        module_id: &str,
    ) -> std::result::Result<Arc<dyn Handler>, ResolveError> {
        if let Some(handler) = self.resolved.get(module_id) {
            return Ok(handler.clone());
        }

        let mut module = None;
        for loader in &self.loaders {
            if let Some(found) = loader.load(module_id, &self.cache_token).await? {
                tracing::debug!(module = %module_id, loader = loader.name(), "Module loaded");
                module = Some(found);
                break;
            }
        }
        let module = module.ok_or_else(|| ResolveError::NotFound(module_id.to_string()))?;

        let handler = match module.default {
            None => return Err(ResolveError::MissingDefaultExport(module_id.to_string())),
            Some(Export::Value(_)) => return Err(ResolveError::NotInvocable(module_id.to_string())),
            Some(Export::Function(handler)) => handler,
        };
        self.resolved.insert(module_id.to_string(), handler.clone());
        Ok(handler)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("loaders", &self.loaders.iter().map(|l| l.name()).collect::<Vec<_>>())
            .field("cache_token", &self.cache_token)
            .field("resolved", &self.resolved.len())
            .finish()
    }
}
