// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adapter registry: one live handle per physical resource (per logical database for
//! databases), built from one environment document.
//!
//! A registry belongs to exactly one generation. Reloading builds a new registry and
//! tears the old one down with [`AdapterRegistry::disconnect_all`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::adapters::cache::Cache;
use crate::adapters::database::Database;
use crate::adapters::storage::Storage;
use crate::adapters::{
    Adapter, ConnectRequest, FactoryTable, QueueBroker, RealtimeAdapter, SchedulerAdapter,
};
use crate::descriptor::crypto::AccessCipher;
use crate::descriptor::{EnvironmentConfig, ResourceMapping, ResourceType};
use crate::error::{EngineError, Result};
use crate::query::model::Schema;

/// A connected resource: primary adapter plus read replicas.
#[derive(Debug)]
pub struct AdapterHandle {
    resource_id: String,
    backend_kind: String,
    category: ResourceType,
    primary: Adapter,
    replicas: Vec<Adapter>,
}

impl AdapterHandle {
    /// Physical resource id.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Backend kind of the resource.
    pub fn backend_kind(&self) -> &str {
        &self.backend_kind
    }

    /// Resource category.
    pub fn category(&self) -> ResourceType {
        self.category
    }

    /// Primary adapter.
    pub fn primary(&self) -> &Adapter {
        &self.primary
    }

    /// Connected read replicas.
    pub fn replicas(&self) -> &[Adapter] {
        &self.replicas
    }

    /// A random replica when preferred and one is connected, otherwise the primary.
    pub fn pick(&self, prefer_read_replica: bool) -> &Adapter {
        if prefer_read_replica
            && let Some(replica) = self.replicas.choose(&mut rand::thread_rng())
        {
            return replica;
        }
        &self.primary
    }

    async fn disconnect(&self, timeout: Duration) {
        let adapters = std::iter::once(&self.primary).chain(self.replicas.iter());
        let tasks = adapters.map(|adapter| async move {
            match tokio::time::timeout(timeout, adapter.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(resource = %self.resource_id, error = %e, "Adapter disconnect failed");
                }
                Err(_) => {
                    warn!(
                        resource = %self.resource_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Adapter disconnect timed out"
                    );
                }
            }
        });
        futures::future::join_all(tasks).await;
    }
}

/// Settings a registry needs besides the environment document.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Environment id, used to derive physical names.
    pub env_id: String,
    /// Pool size for databases that do not set one.
    pub default_pool_size: u32,
    /// Bound for each adapter disconnect during teardown.
    pub disconnect_timeout: Duration,
}

/// Live adapters of one generation.
pub struct AdapterRegistry {
    env: Arc<EnvironmentConfig>,
    options: RegistryOptions,
    factories: Arc<FactoryTable>,
    cipher: Option<AccessCipher>,
    schemas: HashMap<String, Arc<Schema>>,
    handles: DashMap<String, Arc<AdapterHandle>>,
    setup_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AdapterRegistry {
    /// An empty registry over `env`. Nothing is connected until [`Self::setup_all`] or
    /// [`Self::setup_connection`] runs.
    pub fn new(
        env: Arc<EnvironmentConfig>,
        options: RegistryOptions,
        factories: Arc<FactoryTable>,
        cipher: Option<AccessCipher>,
    ) -> Self {
        let schemas = env
            .databases
            .iter()
            .map(|db| (db.name.clone(), Arc::new(Schema::new(db.models.iter().cloned()))))
            .collect();
        Self {
            env,
            options,
            factories,
            cipher,
            schemas,
            handles: DashMap::new(),
            setup_locks: DashMap::new(),
        }
    }

    /// The environment document this registry was built from.
    pub fn environment(&self) -> &Arc<EnvironmentConfig> {
        &self.env
    }

    /// Number of connected handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing is connected.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Connect every mapped resource concurrently. Failures are logged and skipped.
    pub async fn setup_all(&self) {
        let mappings: Vec<ResourceMapping> = self.env.mappings.clone();
        let tasks = mappings.iter().map(|mapping| self.setup_connection(mapping));
        let connected = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(Option::is_some)
            .count();
        info!(
            env_id = %self.options.env_id,
            connected,
            mappings = mappings.len(),
            "Adapter registry ready"
        );
    }

    /// Connect the resource behind `mapping`, or return the existing handle.
    ///
    /// Concurrent calls for the same handle key are serialized: the second caller
    /// observes the first one's handle and does not connect again. Connection failures
    /// are logged and yield `None`.
    pub async fn setup_connection(&self, mapping: &ResourceMapping) -> Option<Arc<AdapterHandle>> {
        let key = mapping.handle_key();
        if let Some(handle) = self.handles.get(key) {
            return Some(handle.clone());
        }

        let lock = self.setup_locks.entry(key.to_string()).or_default().clone();
        let _guard = lock.lock().await;
        if let Some(handle) = self.handles.get(key) {
            return Some(handle.clone());
        }

        match self.connect(mapping).await {
            Ok(handle) => {
                let handle = Arc::new(handle);
                self.handles.insert(key.to_string(), handle.clone());
                Some(handle)
            }
            Err(e) => {
                error!(
                    resource = %mapping.resource.iid,
                    name = %mapping.design.name,
                    category = %mapping.design.resource_type,
                    error = %e,
                    "Resource setup failed"
                );
                None
            }
        }
    }

    async fn connect(&self, mapping: &ResourceMapping) -> Result<AdapterHandle> {
        let descriptor = self.env.resource(&mapping.resource.iid).ok_or_else(|| {
            EngineError::InvalidConfiguration(format!(
                "unknown resource '{}'",
                mapping.resource.iid
            ))
        })?;
        let descriptor = descriptor.decrypted(self.cipher.as_ref())?;

        let database = match mapping.design.resource_type {
            ResourceType::Database => {
                let database = self.env.database_by_iid(&mapping.design.iid).ok_or_else(|| {
                    EngineError::InvalidConfiguration(format!(
                        "unknown database '{}'",
                        mapping.design.iid
                    ))
                })?;
                Some(database)
            }
            _ => None,
        };
        let pool_size = database
            .and_then(|db| db.pool_size)
            .unwrap_or(self.options.default_pool_size);

        let request = ConnectRequest {
            descriptor: &descriptor,
            access: &descriptor.access,
            database,
            env_id: &self.options.env_id,
            pool_size,
        };
        let primary = self.factories.connect(&request).await?;

        let mut replicas = Vec::with_capacity(descriptor.access_read_only.len());
        for (index, access) in descriptor.access_read_only.iter().enumerate() {
            let request = ConnectRequest { access, ..request };
            match self.factories.connect(&request).await {
                Ok(replica) => replicas.push(replica),
                Err(e) => {
                    warn!(
                        resource = %descriptor.iid,
                        replica = index,
                        error = %e,
                        "Read replica setup failed, skipping"
                    );
                }
            }
        }

        debug!(
            resource = %descriptor.iid,
            kind = %descriptor.instance,
            replicas = replicas.len(),
            "Resource connected"
        );
        Ok(AdapterHandle {
            resource_id: descriptor.iid.clone(),
            backend_kind: descriptor.instance.clone(),
            category: descriptor.resource_type,
            primary,
            replicas,
        })
    }

    /// Resolve a logical name to an adapter.
    pub fn get_adapter(
        &self,
        name: &str,
        category: ResourceType,
        prefer_read_replica: bool,
    ) -> Option<Adapter> {
        let mapping = self.env.mapping(category, name)?;
        let handle = self.handles.get(mapping.handle_key())?;
        Some(handle.pick(prefer_read_replica).clone())
    }

    /// Handle of the first connected resource of a category, for singletons such as the
    /// scheduler and the realtime bus.
    pub fn first_of(&self, category: ResourceType) -> Option<Arc<AdapterHandle>> {
        self.env
            .mappings_of(category)
            .find_map(|m| self.handles.get(m.handle_key()).map(|h| h.clone()))
    }

    fn not_found(name: &str, category: ResourceType) -> EngineError {
        EngineError::ResourceNotFound {
            name: name.to_string(),
            category: category.to_string(),
        }
    }

    /// A logical database with its schema, primary and replicas.
    pub fn database(&self, name: &str) -> Result<Database> {
        let not_found = || Self::not_found(name, ResourceType::Database);
        let mapping = self.env.mapping(ResourceType::Database, name).ok_or_else(not_found)?;
        let handle = self.handles.get(mapping.handle_key()).ok_or_else(not_found)?;
        let schema = self.schemas.get(name).cloned().ok_or_else(not_found)?;

        let primary = handle.primary().as_database().cloned().ok_or_else(not_found)?;
        let replicas = handle
            .replicas()
            .iter()
            .filter_map(|r| r.as_database().cloned())
            .collect();
        Ok(Database::new(name, schema, primary, replicas))
    }

    /// A logical cache with its key namespace.
    pub fn cache(&self, name: &str) -> Result<Cache> {
        let not_found = || Self::not_found(name, ResourceType::Cache);
        let config = self.env.cache(name).ok_or_else(not_found)?;
        let adapter = self.get_adapter(name, ResourceType::Cache, false).ok_or_else(not_found)?;
        let adapter = adapter.as_cache().cloned().ok_or_else(not_found)?;
        Ok(Cache::new(config.applied_name(&self.options.env_id), adapter))
    }

    /// A logical storage bound to its bucket.
    pub fn storage(&self, name: &str) -> Result<Storage> {
        let not_found = || Self::not_found(name, ResourceType::Storage);
        let config = self.env.storage(name).ok_or_else(not_found)?;
        let adapter = self.get_adapter(name, ResourceType::Storage, false).ok_or_else(not_found)?;
        let adapter = adapter.as_storage().cloned().ok_or_else(not_found)?;
        Ok(Storage::new(config.applied_name(&self.options.env_id), adapter))
    }

    /// Broker serving a logical queue.
    pub fn queue_broker(&self, queue: &str) -> Result<Arc<dyn QueueBroker>> {
        let not_found = || Self::not_found(queue, ResourceType::Queue);
        let adapter = self.get_adapter(queue, ResourceType::Queue, false).ok_or_else(not_found)?;
        adapter.as_queue().cloned().ok_or_else(not_found)
    }

    /// The environment's scheduler.
    pub fn scheduler(&self) -> Option<Arc<dyn SchedulerAdapter>> {
        self.first_of(ResourceType::Scheduler)
            .and_then(|h| h.primary().as_scheduler().cloned())
    }

    /// The environment's realtime bus.
    pub fn realtime(&self) -> Option<Arc<dyn RealtimeAdapter>> {
        self.first_of(ResourceType::Realtime)
            .and_then(|h| h.primary().as_realtime().cloned())
    }

    /// Disconnect every adapter concurrently and clear the registry.
    ///
    /// Each disconnect is bounded by the configured timeout; failures are logged and do
    /// not stop the rest.
    pub async fn disconnect_all(&self) {
        let handles: Vec<Arc<AdapterHandle>> =
            self.handles.iter().map(|h| h.value().clone()).collect();
        self.handles.clear();
        self.setup_locks.clear();

        let timeout = self.options.disconnect_timeout;
        futures::future::join_all(handles.iter().map(|h| h.disconnect(timeout))).await;
        info!(
            env_id = %self.options.env_id,
            disconnected = handles.len(),
            "Adapter registry torn down"
        );
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("env_id", &self.options.env_id)
            .field("handles", &self.handles.len())
            .finish()
    }
}
