// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process cache. Expired entries are dropped lazily on access.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::time::Instant;

use super::{CacheAdapter, glob_match};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest};
use crate::descriptor::{ResourceType, backend};
use crate::error::{EngineError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// In-process cache backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_live(now) {
            Some(entry)
        } else {
            self.entries.remove_if(key, |_, e| !e.is_live(now));
            None
        }
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live(key).map(|e| e.value))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key)
                && entry.is_live(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let current = if entry.is_live(now) {
                    entry.value.trim().parse::<i64>().map_err(|_| {
                        let message = format!("value of '{}' is not an integer", key);
                        EngineError::backend("cache", "increment", message)
                    })?
                } else {
                    entry.expires_at = None;
                    0
                };
                let next = current
                    .checked_add(by)
                    .ok_or_else(|| EngineError::backend("cache", "increment", "integer overflow"))?;
                entry.value = next.to_string();
                Ok(next)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: by.to_string(),
                    expires_at: None,
                });
                Ok(by)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn disconnect(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// Factory for `Memory` caches.
pub struct MemoryCacheFactory;

#[async_trait]
impl AdapterFactory for MemoryCacheFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Cache
    }

    fn backend(&self) -> &'static str {
        backend::MEMORY
    }

    async fn connect(&self, _request: &ConnectRequest<'_>) -> Result<Adapter> {
        Ok(Adapter::Cache(Arc::new(MemoryCache::new())))
    }
}
