// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource descriptors and the environment configuration document.
//!
//! The environment document is produced by configuration loading, which is outside the
//! engine. The core only reads it: every generation gets an immutable snapshot, and a
//! reload replaces the whole document.

pub mod crypto;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};
use crate::query::model::Model;
use crypto::{AccessCipher, CryptoError};

/// Backend kind strings as they appear in the `instance` field of a descriptor.
pub mod backend {
    /// PostgreSQL database.
    pub const POSTGRESQL: &str = "PostgreSQL";
    /// MySQL database.
    pub const MYSQL: &str = "MySQL";
    /// SQLite database.
    pub const SQLITE: &str = "SQLite";
    /// Redis (cache, queue broker or realtime bus).
    pub const REDIS: &str = "Redis";
    /// In-process backend for single-worker deployments and tests.
    pub const MEMORY: &str = "Memory";
    /// Cron scheduler.
    pub const CRON: &str = "Cron";
    /// Amazon S3.
    pub const AWS_S3: &str = "AWS S3";
    /// MinIO (S3-compatible).
    pub const MINIO: &str = "MinIO";
    /// Local filesystem storage.
    pub const LOCAL: &str = "Local";
}

/// Resource categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Relational or document database.
    Database,
    /// Key-value cache.
    Cache,
    /// Message broker.
    Queue,
    /// Object storage.
    Storage,
    /// Cron scheduler.
    Scheduler,
    /// Realtime pub/sub bus.
    Realtime,
}

impl ResourceType {
    /// Lowercase name used in descriptors and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Cache => "cache",
            Self::Queue => "queue",
            Self::Storage => "storage",
            Self::Scheduler => "scheduler",
            Self::Realtime => "realtime",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured external resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Stable resource id.
    pub iid: String,
    /// Display name.
    pub name: String,
    /// Resource category.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Backend kind (see [`backend`]).
    pub instance: String,
    /// Primary connection settings; fields depend on the backend kind.
    #[serde(default)]
    pub access: Value,
    /// Read-replica connection settings.
    #[serde(default)]
    pub access_read_only: Vec<Value>,
    /// Whether string values in `access` and `accessReadOnly` are encrypted.
    #[serde(default)]
    pub encrypted: bool,
    /// Last modification marker.
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl ResourceDescriptor {
    /// Backend kind string.
    pub fn backend_kind(&self) -> &str {
        &self.instance
    }

    /// Return a copy with access settings decrypted.
    ///
    /// Descriptors that are not marked encrypted are returned as-is.
    pub fn decrypted(
        &self,
        cipher: Option<&AccessCipher>,
    ) -> std::result::Result<Self, CryptoError> {
        if !self.encrypted {
            return Ok(self.clone());
        }
        let cipher = cipher.ok_or(CryptoError::MissingKey)?;

        let mut out = self.clone();
        out.access = cipher.decrypt_value(&self.access)?;
        out.access_read_only = self
            .access_read_only
            .iter()
            .map(|access| cipher.decrypt_value(access))
            .collect::<std::result::Result<_, _>>()?;
        out.encrypted = false;
        Ok(out)
    }
}

/// The logical side of a mapping: what application code refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesignRef {
    /// Logical entity id (database, cache, queue, ...).
    pub iid: String,
    /// Resource category.
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Logical name.
    pub name: String,
}

/// The physical side of a mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// Resource id.
    pub iid: String,
}

/// Binds a logical entity to the resource that backs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceMapping {
    /// Logical entity.
    pub design: DesignRef,
    /// Backing resource.
    pub resource: ResourceRef,
}

impl ResourceMapping {
    /// Key under which the adapter handle for this mapping is registered.
    ///
    /// Databases get one handle per logical database because each logical database
    /// is a separate schema with its own pool. Other categories share one handle per
    /// physical resource.
    pub fn handle_key(&self) -> &str {
        match self.design.resource_type {
            ResourceType::Database => &self.design.iid,
            _ => &self.resource.iid,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A logical database and its models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// Logical database id.
    pub iid: String,
    /// Name used by application code.
    pub name: String,
    /// Prefix the physical database name with the environment id.
    #[serde(default = "default_true")]
    pub assign_unique_name: bool,
    /// Connection pool size override.
    #[serde(default)]
    pub pool_size: Option<u32>,
    /// Models (tables) of this database.
    #[serde(default)]
    pub models: Vec<Model>,
}

impl DatabaseConfig {
    /// Physical database name.
    ///
    /// With `assignUniqueName` the name is `{envId}_{iid}`, lowercased with dashes
    /// replaced by underscores so it is a valid unquoted identifier.
    pub fn applied_name(&self, env_id: &str) -> String {
        if self.assign_unique_name {
            format!("{}_{}", env_id, self.iid)
                .to_lowercase()
                .replace('-', "_")
        } else {
            self.name.clone()
        }
    }

    /// Look up a model by name.
    pub fn model(&self, name: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.name == name)
    }
}

/// A logical cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Logical cache id.
    pub iid: String,
    /// Name used by application code.
    pub name: String,
    /// Namespace keys with the cache id and environment id.
    #[serde(default = "default_true")]
    pub assign_unique_name: bool,
}

impl CacheConfig {
    /// Namespace applied to every key of this cache.
    pub fn applied_name(&self, env_id: &str) -> String {
        if self.assign_unique_name {
            format!("{}.{}", self.iid, env_id)
        } else {
            self.name.clone()
        }
    }
}

/// A logical object storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// Logical storage id.
    pub iid: String,
    /// Name used by application code.
    pub name: String,
    /// Prefix the bucket name with the environment id.
    #[serde(default = "default_true")]
    pub assign_unique_name: bool,
}

impl StorageConfig {
    /// Physical bucket name.
    ///
    /// Bucket names must be lowercase DNS labels, so anything outside `[a-z0-9-]` is
    /// replaced with a dash.
    pub fn applied_name(&self, env_id: &str) -> String {
        let raw = if self.assign_unique_name {
            format!("{}-{}", env_id, self.iid)
        } else {
            self.name.clone()
        };
        raw.to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
            .collect()
    }
}

/// A logical message queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Queue id.
    pub iid: String,
    /// Queue name.
    pub name: String,
    /// Persist an execution log entry for every processed message.
    #[serde(default)]
    pub log_execution: bool,
    /// Accept messages with a delivery delay.
    #[serde(default)]
    pub delayed_messages: bool,
    /// Handler module id; defaults to the queue id.
    #[serde(default)]
    pub module: Option<String>,
}

impl QueueConfig {
    /// Module identifier of the bound handler.
    pub fn module_id(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.iid)
    }
}

/// A scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    /// Task id.
    pub iid: String,
    /// Task name.
    pub name: String,
    /// Cron expression (five or six fields).
    pub cron_expression: String,
    /// Disabled tasks are neither scheduled nor listened to.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Persist an execution log entry for every run.
    #[serde(default)]
    pub log_execution: bool,
    /// Handler module id; defaults to the task id.
    #[serde(default)]
    pub module: Option<String>,
}

impl TaskConfig {
    /// Module identifier of the bound handler.
    pub fn module_id(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.iid)
    }
}

/// An HTTP endpoint served by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    /// Endpoint id.
    pub iid: String,
    /// Endpoint name.
    pub name: String,
    /// HTTP method.
    #[serde(default)]
    pub method: String,
    /// Route path.
    #[serde(default)]
    pub path: String,
    /// Handler timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Middleware ids run before the handler, in order.
    #[serde(default)]
    pub middlewares: Vec<String>,
    /// Handler module id; defaults to the endpoint id.
    #[serde(default)]
    pub module: Option<String>,
}

impl EndpointConfig {
    /// Module identifier of the bound handler.
    pub fn module_id(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.iid)
    }
}

/// A middleware that runs before endpoint handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareConfig {
    /// Middleware id.
    pub iid: String,
    /// Middleware name.
    pub name: String,
    /// Handler module id; defaults to the middleware id.
    #[serde(default)]
    pub module: Option<String>,
}

impl MiddlewareConfig {
    /// Module identifier of the bound handler.
    pub fn module_id(&self) -> &str {
        self.module.as_deref().unwrap_or(&self.iid)
    }
}

/// The full configuration of one deployed environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    /// Environment id.
    pub iid: String,
    /// Deployment marker; reloads with an unchanged timestamp are skipped.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// Administratively disabled environments fail every message immediately.
    #[serde(default)]
    pub suspended: bool,
    /// Application parameters exposed to handlers.
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Physical resources.
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    /// Logical name to resource bindings.
    #[serde(default)]
    pub mappings: Vec<ResourceMapping>,
    /// Logical databases.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    /// Logical caches.
    #[serde(default)]
    pub caches: Vec<CacheConfig>,
    /// Logical storages.
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
    /// Message queues.
    #[serde(default)]
    pub queues: Vec<QueueConfig>,
    /// Scheduled tasks.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    /// Endpoints.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    /// Middlewares.
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,
}

impl EnvironmentConfig {
    /// Parse an environment document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Look up a resource by id.
    pub fn resource(&self, iid: &str) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.iid == iid)
    }

    /// Find the mapping for a logical name in a category.
    pub fn mapping(&self, category: ResourceType, name: &str) -> Option<&ResourceMapping> {
        self.mappings
            .iter()
            .find(|m| m.design.resource_type == category && m.design.name == name)
    }

    /// Mappings of one category.
    pub fn mappings_of(&self, category: ResourceType) -> impl Iterator<Item = &ResourceMapping> {
        self.mappings
            .iter()
            .filter(move |m| m.design.resource_type == category)
    }

    /// Look up a logical database by name.
    pub fn database(&self, name: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.name == name)
    }

    /// Look up a logical database by id.
    pub fn database_by_iid(&self, iid: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.iid == iid)
    }

    /// Look up a logical cache by name.
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }

    /// Look up a logical storage by name.
    pub fn storage(&self, name: &str) -> Option<&StorageConfig> {
        self.storages.iter().find(|s| s.name == name)
    }

    /// Look up a queue by name or id.
    pub fn queue(&self, name_or_iid: &str) -> Option<&QueueConfig> {
        self.queues
            .iter()
            .find(|q| q.name == name_or_iid || q.iid == name_or_iid)
    }

    /// Look up a task by name or id.
    pub fn task(&self, name_or_iid: &str) -> Option<&TaskConfig> {
        self.tasks
            .iter()
            .find(|t| t.name == name_or_iid || t.iid == name_or_iid)
    }

    /// Look up an endpoint by name or id.
    pub fn endpoint(&self, name_or_iid: &str) -> Option<&EndpointConfig> {
        self.endpoints
            .iter()
            .find(|e| e.name == name_or_iid || e.iid == name_or_iid)
    }

    /// Look up a middleware by id.
    pub fn middleware(&self, iid: &str) -> Option<&MiddlewareConfig> {
        self.middlewares.iter().find(|m| m.iid == iid)
    }

    /// Whether the resource set differs from another document.
    ///
    /// A resource counts as changed when it was added, removed, or its `updatedAt`
    /// marker differs.
    pub fn has_resource_change(&self, other: &EnvironmentConfig) -> bool {
        if self.resources.len() != other.resources.len() {
            return true;
        }
        self.resources.iter().any(|res| match other.resource(&res.iid) {
            Some(old) => old.updated_at != res.updated_at,
            None => true,
        })
    }

    /// Check internal references.
    ///
    /// Every mapping must point at a declared resource of the same category, and every
    /// endpoint middleware must exist.
    pub fn validate(&self) -> Result<()> {
        for mapping in &self.mappings {
            let Some(resource) = self.resource(&mapping.resource.iid) else {
                return Err(EngineError::InvalidConfiguration(format!(
                    "{} '{}' is mapped to unknown resource '{}'",
                    mapping.design.resource_type, mapping.design.name, mapping.resource.iid
                )));
            };
            if resource.resource_type != mapping.design.resource_type {
                return Err(EngineError::InvalidConfiguration(format!(
                    "{} '{}' is mapped to {} resource '{}'",
                    mapping.design.resource_type,
                    mapping.design.name,
                    resource.resource_type,
                    resource.iid
                )));
            }
        }

        for endpoint in &self.endpoints {
            for middleware in &endpoint.middlewares {
                if self.middleware(middleware).is_none() {
                    return Err(EngineError::InvalidConfiguration(format!(
                        "endpoint '{}' uses unknown middleware '{}'",
                        endpoint.name, middleware
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Source of environment documents.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Load the current environment document.
    async fn load(&self) -> Result<EnvironmentConfig>;
}

/// Reads the environment document from a JSON file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Create a source reading from `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> Result<EnvironmentConfig> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            EngineError::InvalidConfiguration(format!(
                "cannot read environment document {}: {}",
                self.path.display(),
                e
            ))
        })?;
        EnvironmentConfig::from_json_str(&raw)
    }
}

/// Serves a fixed document; used by embedders that build the document in code.
#[derive(Debug, Clone)]
pub struct StaticConfigSource {
    config: std::sync::Arc<std::sync::RwLock<EnvironmentConfig>>,
}

impl StaticConfigSource {
    /// Create a source serving `config`.
    pub fn new(config: EnvironmentConfig) -> Self {
        Self {
            config: std::sync::Arc::new(std::sync::RwLock::new(config)),
        }
    }

    /// Replace the served document; the next reload picks it up.
    pub fn replace(&self, config: EnvironmentConfig) {
        let mut guard = self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = config;
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn load(&self) -> Result<EnvironmentConfig> {
        let guard = self
            .config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> EnvironmentConfig {
        serde_json::from_value(json!({
            "iid": "env-1",
            "timestamp": "2025-01-01T00:00:00Z",
            "resources": [
                {
                    "iid": "res-pg",
                    "name": "primary-pg",
                    "type": "database",
                    "instance": "PostgreSQL",
                    "access": {"host": "db", "port": 5432},
                    "accessReadOnly": [{"host": "replica-1", "port": 5432}],
                    "updatedAt": "1"
                },
                {
                    "iid": "res-redis",
                    "name": "redis",
                    "type": "cache",
                    "instance": "Redis",
                    "access": {"host": "cache"}
                }
            ],
            "mappings": [
                {
                    "design": {"iid": "db-Main", "type": "database", "name": "main"},
                    "resource": {"iid": "res-pg"}
                },
                {
                    "design": {"iid": "cache-1", "type": "cache", "name": "sessions"},
                    "resource": {"iid": "res-redis"}
                }
            ],
            "databases": [{"iid": "db-Main", "name": "main", "models": []}],
            "caches": [{"iid": "cache-1", "name": "sessions"}],
            "queues": [{"iid": "q-1", "name": "emails", "logExecution": true}],
            "tasks": [{"iid": "t-1", "name": "cleanup", "cronExpression": "*/5 * * * *"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_environment_document() {
        let env = sample();
        assert_eq!(env.resources.len(), 2);
        assert_eq!(env.resources[0].resource_type, ResourceType::Database);
        assert_eq!(env.resources[0].access_read_only.len(), 1);
        assert!(!env.suspended);
        assert!(env.queues[0].log_execution);
        assert!(!env.queues[0].delayed_messages);
        assert!(env.tasks[0].enabled);
        assert_eq!(env.tasks[0].module_id(), "t-1");
        env.validate().unwrap();
    }

    #[test]
    fn test_mapping_lookup_and_handle_key() {
        let env = sample();
        let db = env.mapping(ResourceType::Database, "main").unwrap();
        assert_eq!(db.handle_key(), "db-Main");

        let cache = env.mapping(ResourceType::Cache, "sessions").unwrap();
        assert_eq!(cache.handle_key(), "res-redis");

        assert!(env.mapping(ResourceType::Cache, "main").is_none());
    }

    #[test]
    fn test_applied_names() {
        let env = sample();
        let db = env.database("main").unwrap();
        assert_eq!(db.applied_name("ENV-1"), "env_1_db_main");

        let cache = env.cache("sessions").unwrap();
        assert_eq!(cache.applied_name("env-1"), "cache-1.env-1");

        let plain = CacheConfig {
            iid: "c".to_string(),
            name: "plain".to_string(),
            assign_unique_name: false,
        };
        assert_eq!(plain.applied_name("env-1"), "plain");

        let storage = StorageConfig {
            iid: "st_Files".to_string(),
            name: "files".to_string(),
            assign_unique_name: true,
        };
        assert_eq!(storage.applied_name("Env-1"), "env-1-st-files");
    }

    #[test]
    fn test_validate_rejects_dangling_mapping() {
        let mut env = sample();
        env.mappings[1].resource.iid = "missing".to_string();
        let err = env.validate().unwrap_err();
        assert_eq!(err.error_code(), "invalidConfiguration");
    }

    #[test]
    fn test_validate_rejects_category_mismatch() {
        let mut env = sample();
        env.mappings[1].resource.iid = "res-pg".to_string();
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_resource_change_detection() {
        let old = sample();
        let mut new = sample();
        assert!(!new.has_resource_change(&old));

        new.resources[0].updated_at = Some("2".to_string());
        assert!(new.has_resource_change(&old));

        let mut removed = sample();
        removed.resources.pop();
        assert!(removed.has_resource_change(&old));
    }

    #[test]
    fn test_decrypted_descriptor() {
        let cipher = AccessCipher::new("key");
        let mut env = sample();
        let res = &mut env.resources[0];
        res.access = cipher.encrypt_value(&res.access).unwrap();
        res.access_read_only = vec![cipher.encrypt_value(&json!({"host": "replica-1"})).unwrap()];
        res.encrypted = true;

        let plain = res.decrypted(Some(&cipher)).unwrap();
        assert_eq!(plain.access["host"], "db");
        assert_eq!(plain.access_read_only[0]["host"], "replica-1");
        assert!(!plain.encrypted);

        assert!(matches!(res.decrypted(None), Err(CryptoError::MissingKey)));
    }

    #[tokio::test]
    async fn test_file_config_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.json");
        tokio::fs::write(&path, serde_json::to_string(&sample()).unwrap())
            .await
            .unwrap();

        let loaded = FileConfigSource::new(&path).load().await.unwrap();
        assert_eq!(loaded, sample());

        let missing = FileConfigSource::new(dir.path().join("nope.json"));
        assert!(missing.load().await.is_err());
    }
}
