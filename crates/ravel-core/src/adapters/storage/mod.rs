// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object storage adapters.

mod local;
mod s3;

pub use local::{LocalStorage, LocalStorageFactory};
pub use s3::{S3Factory, S3Storage, S3Settings};

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{EngineError, Result};

/// One stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectInfo {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
}

/// Bucket/object storage.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Backend kind for logs.
    fn backend(&self) -> &'static str;

    /// Create a bucket; succeeds when it already exists.
    async fn create_bucket(&self, bucket: &str) -> Result<()>;

    /// Delete an empty bucket; succeeds when it does not exist.
    async fn delete_bucket(&self, bucket: &str) -> Result<()>;

    /// Store an object, replacing any previous one.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<()>;

    /// Read an object.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete an object; succeeds when it does not exist.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()>;

    /// Objects whose key starts with `prefix`, sorted by key.
    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>>;

    /// Release connections.
    async fn disconnect(&self) -> Result<()>;
}

/// Reject keys that are empty or could escape the bucket.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|segment| segment == ".." || segment == ".");
    if invalid {
        let message = format!("invalid object key '{}'", key);
        return Err(EngineError::backend("storage", "validate_key", message));
    }
    Ok(())
}

/// A logical storage: one bucket on a storage resource.
#[derive(Clone)]
pub struct Storage {
    bucket: String,
    adapter: Arc<dyn StorageAdapter>,
}

impl Storage {
    /// Bind a bucket to an adapter.
    pub fn new(bucket: impl Into<String>, adapter: Arc<dyn StorageAdapter>) -> Self {
        Self {
            bucket: bucket.into(),
            adapter,
        }
    }

    /// Physical bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if missing.
    pub async fn ensure_bucket(&self) -> Result<()> {
        self.adapter.create_bucket(&self.bucket).await
    }

    /// Store an object.
    pub async fn put(&self, key: &str, body: Vec<u8>, content_type: Option<&str>) -> Result<()> {
        validate_key(key)?;
        self.adapter.put_object(&self.bucket, key, body, content_type).await
    }

    /// Read an object.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        self.adapter.get_object(&self.bucket, key).await
    }

    /// Delete an object.
    pub async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.adapter.delete_object(&self.bucket, key).await
    }

    /// List objects by key prefix.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        self.adapter.list_objects(&self.bucket, prefix).await
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("bucket", &self.bucket)
            .field("backend", &self.adapter.backend())
            .finish()
    }
}
