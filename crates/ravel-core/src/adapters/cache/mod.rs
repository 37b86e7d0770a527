// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Key-value cache adapters.
//!
//! Adapters store plain strings. [`Cache`] is the handle given to handler code: it
//! prefixes every key with the logical cache's namespace and stores JSON documents.

mod memory;
mod redis;

pub use self::memory::{MemoryCache, MemoryCacheFactory};
pub use self::redis::{RedisCache, RedisCacheFactory};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{EngineError, Result};

/// A key-value store with expiry.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Read a key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a key, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete keys. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Add `by` to an integer value (missing keys count as 0). Returns the new value.
    async fn increment(&self, key: &str, by: i64) -> Result<i64>;

    /// Set a key's time to live. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn list_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Close connections.
    async fn disconnect(&self) -> Result<()>;
}

/// A logical cache: a namespace on a cache resource.
#[derive(Clone)]
pub struct Cache {
    namespace: String,
    adapter: Arc<dyn CacheAdapter>,
}

impl Cache {
    /// Bind a namespace to an adapter.
    pub fn new(namespace: impl Into<String>, adapter: Arc<dyn CacheAdapter>) -> Self {
        Self {
            namespace: namespace.into(),
            adapter,
        }
    }

    /// Key prefix of this cache.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, key: &str) -> String {
        format!("{}.{}", self.namespace, key)
    }

    /// Read a value. Stored text that is not JSON is returned as a string.
    pub async fn get(&self, key: &str) -> Result<Option<Value>> {
        let raw = self.adapter.get(&self.key(key)).await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw))))
    }

    /// Store a value.
    pub async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.adapter.set(&self.key(key), &raw, ttl).await
    }

    /// Delete keys. Returns how many existed.
    pub async fn delete(&self, keys: &[&str]) -> Result<u64> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        if keys.is_empty() {
            return Ok(0);
        }
        self.adapter.delete(&keys).await
    }

    /// Increment an integer value.
    pub async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        self.adapter.increment(&self.key(key), by).await
    }

    /// Decrement an integer value.
    pub async fn decrement(&self, key: &str, by: i64) -> Result<i64> {
        let by = by
            .checked_neg()
            .ok_or_else(|| EngineError::backend("cache", "decrement", "amount out of range"))?;
        self.adapter.increment(&self.key(key), by).await
    }

    /// Set a key's time to live.
    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.adapter.expire(&self.key(key), ttl).await
    }

    /// Keys of this cache matching a glob pattern, without the namespace prefix.
    pub async fn list_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let prefix = self.key("");
        let keys = self.adapter.list_keys(&self.key(pattern)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache").field("namespace", &self.namespace).finish()
    }
}

/// Match `text` against a glob pattern with `*` (any run) and `?` (any one char).
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", ""));
        assert!(glob_match("user:*", "user:42"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match("*.session.*", "ns.session.x"));
        assert!(!glob_match("user:*", "admin:1"));
        assert!(glob_match("a*b*c", "axxbyyc"));
    }

    #[tokio::test]
    async fn test_namespaced_cache() {
        let adapter: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new());
        let sessions = Cache::new("c1.env", adapter.clone());
        let other = Cache::new("c2.env", adapter.clone());

        sessions.set("user", &json!({"id": 1}), None).await.unwrap();
        other.set("user", &json!("other"), None).await.unwrap();

        assert_eq!(sessions.get("user").await.unwrap(), Some(json!({"id": 1})));
        assert_eq!(other.get("user").await.unwrap(), Some(json!("other")));
        assert_eq!(adapter.get("c1.env.user").await.unwrap().unwrap(), "{\"id\":1}");

        assert_eq!(sessions.list_keys("*").await.unwrap(), vec!["user".to_string()]);

        assert_eq!(sessions.increment("hits", 5).await.unwrap(), 5);
        assert_eq!(sessions.decrement("hits", 2).await.unwrap(), 3);
        assert_eq!(sessions.get("hits").await.unwrap(), Some(json!(3)));

        assert_eq!(sessions.delete(&["user", "missing"]).await.unwrap(), 1);
        assert_eq!(sessions.get("user").await.unwrap(), None);
        assert_eq!(other.get("user").await.unwrap(), Some(json!("other")));
    }

    #[tokio::test]
    async fn test_raw_text_is_returned_as_string() {
        let adapter: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new());
        adapter.set("ns.plain", "not json", None).await.unwrap();
        let cache = Cache::new("ns", adapter);
        assert_eq!(cache.get("plain").await.unwrap(), Some(json!("not json")));
    }
}
