// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource adapters.
//!
//! Each resource category has one capability trait. Concrete implementations are
//! created by an [`AdapterFactory`] looked up in a [`FactoryTable`] by category and
//! backend kind. A backend kind without a factory is a configuration error; there is no
//! fallback adapter that silently does nothing.

pub mod cache;
pub mod database;
pub mod queue;
pub mod realtime;
pub mod scheduler;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::descriptor::{DatabaseConfig, ResourceDescriptor, ResourceType, backend};
use crate::error::{EngineError, Result};

pub use cache::CacheAdapter;
pub use database::{DatabaseAdapter, DatabaseTransaction};
pub use queue::QueueBroker;
pub use realtime::RealtimeAdapter;
pub use scheduler::SchedulerAdapter;
pub use storage::StorageAdapter;

/// A live connection to one resource, typed by category.
#[derive(Clone)]
pub enum Adapter {
    /// Relational database.
    Database(Arc<dyn DatabaseAdapter>),
    /// Key-value cache.
    Cache(Arc<dyn CacheAdapter>),
    /// Message broker.
    Queue(Arc<dyn QueueBroker>),
    /// Cron scheduler.
    Scheduler(Arc<dyn SchedulerAdapter>),
    /// Object storage.
    Storage(Arc<dyn StorageAdapter>),
    /// Realtime pub/sub bus.
    Realtime(Arc<dyn RealtimeAdapter>),
}

impl Adapter {
    /// Category of this adapter.
    pub fn category(&self) -> ResourceType {
        match self {
            Self::Database(_) => ResourceType::Database,
            Self::Cache(_) => ResourceType::Cache,
            Self::Queue(_) => ResourceType::Queue,
            Self::Scheduler(_) => ResourceType::Scheduler,
            Self::Storage(_) => ResourceType::Storage,
            Self::Realtime(_) => ResourceType::Realtime,
        }
    }

    /// Release every connection held by the adapter.
    pub async fn disconnect(&self) -> Result<()> {
        match self {
            Self::Database(a) => a.disconnect().await,
            Self::Cache(a) => a.disconnect().await,
            Self::Queue(a) => a.close().await,
            Self::Scheduler(a) => a.disconnect().await,
            Self::Storage(a) => a.disconnect().await,
            Self::Realtime(a) => a.disconnect().await,
        }
    }

    /// The database adapter, if this is one.
    pub fn as_database(&self) -> Option<&Arc<dyn DatabaseAdapter>> {
        match self {
            Self::Database(a) => Some(a),
            _ => None,
        }
    }

    /// The cache adapter, if this is one.
    pub fn as_cache(&self) -> Option<&Arc<dyn CacheAdapter>> {
        match self {
            Self::Cache(a) => Some(a),
            _ => None,
        }
    }

    /// The queue broker, if this is one.
    pub fn as_queue(&self) -> Option<&Arc<dyn QueueBroker>> {
        match self {
            Self::Queue(a) => Some(a),
            _ => None,
        }
    }

    /// The scheduler, if this is one.
    pub fn as_scheduler(&self) -> Option<&Arc<dyn SchedulerAdapter>> {
        match self {
            Self::Scheduler(a) => Some(a),
            _ => None,
        }
    }

    /// The storage adapter, if this is one.
    pub fn as_storage(&self) -> Option<&Arc<dyn StorageAdapter>> {
        match self {
            Self::Storage(a) => Some(a),
            _ => None,
        }
    }

    /// The realtime adapter, if this is one.
    pub fn as_realtime(&self) -> Option<&Arc<dyn RealtimeAdapter>> {
        match self {
            Self::Realtime(a) => Some(a),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Adapter").field(&self.category()).finish()
    }
}

/// Everything a factory needs to open one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectRequest<'a> {
    /// The resource being connected (already decrypted).
    pub descriptor: &'a ResourceDescriptor,
    /// Access settings for this connection: the primary access or one replica entry.
    pub access: &'a Value,
    /// Logical database served by this connection, for database resources.
    pub database: Option<&'a DatabaseConfig>,
    /// Environment id, used to derive physical names.
    pub env_id: &'a str,
    /// Connection pool size.
    pub pool_size: u32,
}

impl ConnectRequest<'_> {
    /// Shorthand for an [`EngineError::AdapterSetup`] error on this resource.
    pub fn setup_error(&self, reason: impl std::fmt::Display) -> EngineError {
        EngineError::AdapterSetup {
            resource: self.descriptor.iid.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Creates adapters for one backend kind.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Category served.
    fn category(&self) -> ResourceType;

    /// Backend kind string as it appears in descriptors.
    fn backend(&self) -> &'static str;

    /// Open a connection.
    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter>;
}

/// Factories keyed by category and backend kind.
#[derive(Clone, Default)]
pub struct FactoryTable {
    factories: HashMap<(ResourceType, String), Arc<dyn AdapterFactory>>,
}

impl FactoryTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with every built-in backend registered.
    pub fn with_defaults() -> Self {
        let mut table = Self::new();
        table.register(database::PostgresFactory);
        table.register(database::MySqlFactory);
        table.register(database::SqliteFactory);
        table.register(cache::MemoryCacheFactory);
        table.register(cache::RedisCacheFactory);
        table.register(queue::MemoryQueueFactory);
        table.register(queue::RedisQueueFactory);
        table.register(scheduler::CronFactory);
        table.register(storage::S3Factory::new(backend::AWS_S3));
        table.register(storage::S3Factory::new(backend::MINIO));
        table.register(storage::LocalStorageFactory);
        table.register(realtime::MemoryRealtimeFactory);
        table.register(realtime::RedisRealtimeFactory);
        table
    }

    /// Register a factory, replacing any previous one for the same key.
    pub fn register(&mut self, factory: impl AdapterFactory + 'static) {
        let key = (factory.category(), factory.backend().to_string());
        self.factories.insert(key, Arc::new(factory));
    }

    /// Look up the factory for a category and backend kind.
    pub fn get(&self, category: ResourceType, kind: &str) -> Option<&Arc<dyn AdapterFactory>> {
        self.factories.get(&(category, kind.to_string()))
    }

    /// Connect using the factory registered for the request's resource.
    pub async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let category = request.descriptor.resource_type;
        let kind = request.descriptor.backend_kind();
        let factory = self
            .get(category, kind)
            .ok_or_else(|| EngineError::UnsupportedBackend {
                kind: kind.to_string(),
                category: category.to_string(),
            })?;
        factory.connect(request).await
    }
}

impl std::fmt::Debug for FactoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .factories
            .keys()
            .map(|(category, kind)| format!("{}:{}", category, kind))
            .collect();
        keys.sort();
        f.debug_struct("FactoryTable").field("factories", &keys).finish()
    }
}

/// Read a string setting, trying each key in order.
pub(crate) fn access_str<'a>(access: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| access.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Read a port-like setting given as a number or a numeric string.
pub(crate) fn access_u16(access: &Value, key: &str) -> Option<u16> {
    match access.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Redis connection URL from `{url}` or `{host, port, password, db}`.
pub(crate) fn redis_url(access: &Value) -> Option<String> {
    if let Some(url) = access_str(access, &["url"]) {
        return Some(url.to_string());
    }
    let host = access_str(access, &["host"])?;
    let port = access_u16(access, "port").unwrap_or(6379);
    let auth = match (
        access_str(access, &["username", "user"]),
        access_str(access, &["password"]),
    ) {
        (Some(user), Some(password)) => format!("{}:{}@", user, password),
        (None, Some(password)) => format!(":{}@", password),
        _ => String::new(),
    };
    let db = access.get("db").and_then(Value::as_u64).unwrap_or(0);
    Some(format!("redis://{}{}:{}/{}", auth, host, port, db))
}

/// Resolve once `flag` is set or its sender is gone.
///
/// The borrowed value is released before returning, so the future stays `Send` when
/// raced against others in `tokio::select!`.
pub(crate) async fn until_set(flag: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = flag.wait_for(|set| *set).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn descriptor(
        resource_type: ResourceType,
        instance: &str,
        access: Value,
    ) -> ResourceDescriptor {
        ResourceDescriptor {
            iid: "res-1".to_string(),
            name: "res".to_string(),
            resource_type,
            instance: instance.to_string(),
            access,
            access_read_only: vec![],
            encrypted: false,
            updated_at: None,
        }
    }

    #[test]
    fn test_default_table_covers_builtin_backends() {
        let table = FactoryTable::with_defaults();
        assert!(table.get(ResourceType::Database, backend::POSTGRESQL).is_some());
        assert!(table.get(ResourceType::Database, backend::MYSQL).is_some());
        assert!(table.get(ResourceType::Database, backend::SQLITE).is_some());
        assert!(table.get(ResourceType::Cache, backend::REDIS).is_some());
        assert!(table.get(ResourceType::Queue, backend::MEMORY).is_some());
        assert!(table.get(ResourceType::Scheduler, backend::CRON).is_some());
        assert!(table.get(ResourceType::Storage, backend::MINIO).is_some());
        assert!(table.get(ResourceType::Realtime, backend::REDIS).is_some());
        // Keyed by category as well as kind.
        assert!(table.get(ResourceType::Cache, backend::POSTGRESQL).is_none());
    }

    #[tokio::test]
    async fn test_unknown_backend_is_a_configuration_error() {
        let table = FactoryTable::with_defaults();
        let desc = descriptor(ResourceType::Queue, "RabbitMQ", json!({}));
        let request = ConnectRequest {
            descriptor: &desc,
            access: &desc.access,
            database: None,
            env_id: "env",
            pool_size: 1,
        };
        let err = table.connect(&request).await.unwrap_err();
        assert_eq!(err.error_code(), "unsupportedBackend");
        assert!(err.to_string().contains("RabbitMQ"));
    }

    #[tokio::test]
    async fn test_connect_memory_cache() {
        let table = FactoryTable::with_defaults();
        let desc = descriptor(ResourceType::Cache, backend::MEMORY, json!({}));
        let request = ConnectRequest {
            descriptor: &desc,
            access: &desc.access,
            database: None,
            env_id: "env",
            pool_size: 1,
        };
        let adapter = table.connect(&request).await.unwrap();
        assert_eq!(adapter.category(), ResourceType::Cache);
        assert!(adapter.as_cache().is_some());
        assert!(adapter.as_database().is_none());
        adapter.disconnect().await.unwrap();
    }

    #[test]
    fn test_redis_url_from_parts() {
        assert_eq!(
            redis_url(&json!({"url": "redis://r:6380/2"})).unwrap(),
            "redis://r:6380/2"
        );
        assert_eq!(
            redis_url(&json!({"host": "cache", "port": "6380", "password": "pw"})).unwrap(),
            "redis://:pw@cache:6380/0"
        );
        assert_eq!(
            redis_url(&json!({"host": "cache", "username": "u", "password": "pw", "db": 3}))
                .unwrap(),
            "redis://u:pw@cache:6379/3"
        );
        assert!(redis_url(&json!({})).is_none());
    }

    #[tokio::test]
    async fn test_until_set_in_spawned_select() {
        let (flag, mut rx) = tokio::sync::watch::channel(false);
        let (tx, mut source) = tokio::sync::mpsc::channel::<u32>(4);

        let consumer = tokio::spawn(async move {
            let mut seen = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = until_set(&mut rx) => break,
                    item = source.recv() => match item {
                        Some(_) => seen += 1,
                        None => break,
                    },
                }
            }
            seen
        });

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        flag.send_replace(true);
        let seen = tokio::time::timeout(std::time::Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, 2);

        // A dropped sender also releases the waiter.
        let (flag, mut rx) = tokio::sync::watch::channel(false);
        drop(flag);
        tokio::time::timeout(std::time::Duration::from_secs(5), until_set(&mut rx))
            .await
            .unwrap();
    }
}
