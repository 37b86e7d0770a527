// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem storage: one directory per bucket, keys are relative paths.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use super::{ObjectInfo, StorageAdapter, validate_key};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, access_str};
use crate::descriptor::{ResourceType, backend};
use crate::error::{EngineError, Result};

/// Storage rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Storage under `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == "." || bucket == ".." {
            let message = format!("invalid bucket name '{}'", bucket);
            return Err(EngineError::backend("storage", "bucket", message));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_dir(bucket)?.join(key))
    }
}

fn io_error(operation: &str, path: &Path, err: std::io::Error) -> EngineError {
    EngineError::backend("storage", operation, format!("{}: {}", path.display(), err))
}

#[async_trait]
impl StorageAdapter for LocalStorage {
    fn backend(&self) -> &'static str {
        backend::LOCAL
    }

    async fn create_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create_bucket", &dir, e))
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        match tokio::fs::remove_dir(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete_bucket", &dir, e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if !tokio::fs::try_exists(self.bucket_dir(bucket)?).await.unwrap_or(false) {
            let message = format!("bucket '{}' does not exist", bucket);
            return Err(EngineError::backend("storage", "put_object", message));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("put_object", parent, e))?;
        }
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| io_error("put_object", &path, e))
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("get_object", &path, e)),
        }
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete_object", &path, e)),
        }
    }

    async fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> Result<Vec<ObjectInfo>> {
        let root = self.bucket_dir(bucket)?;
        let mut objects = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error("list_objects", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("list_objects", &dir, e))?
            {
                let path = entry.path();
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| io_error("list_objects", &path, e))?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if prefix.is_none_or(|p| key.starts_with(p)) {
                    objects.push(ObjectInfo {
                        key,
                        size: metadata.len(),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory for `Local` storage. Access: `{path}`, the root directory.
pub struct LocalStorageFactory;

#[async_trait]
impl AdapterFactory for LocalStorageFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Storage
    }

    fn backend(&self) -> &'static str {
        backend::LOCAL
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let root = access_str(request.access, &["path"])
            .ok_or_else(|| request.setup_error("access.path is required"))?;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| request.setup_error(format!("cannot create {}: {}", root, e)))?;
        Ok(Adapter::Storage(Arc::new(LocalStorage::new(root))))
    }
}
