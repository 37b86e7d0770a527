// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis cache.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;

use super::CacheAdapter;
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, redis_url};
use crate::descriptor::{ResourceType, backend};
use crate::error::Result;

/// Keys fetched per SCAN round trip.
const SCAN_COUNT: usize = 500;

/// Redis cache over an auto-reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheAdapter for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = ::redis::cmd("DEL").arg(keys).query_async(&mut conn).await?;
        Ok(removed)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = ::redis::cmd("INCRBY").arg(key).arg(by).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = ::redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn disconnect(&self) -> Result<()> {
        // The connection manager closes when its last clone is dropped.
        Ok(())
    }
}

/// Factory for `Redis` caches. Access: `{url}` or `{host, port, password, db}`.
pub struct RedisCacheFactory;

#[async_trait]
impl AdapterFactory for RedisCacheFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Cache
    }

    fn backend(&self) -> &'static str {
        backend::REDIS
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let url = redis_url(request.access)
            .ok_or_else(|| request.setup_error("access.url or access.host is required"))?;
        let cache = RedisCache::connect(&url).await?;
        Ok(Adapter::Cache(Arc::new(cache)))
    }
}
