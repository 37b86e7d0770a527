// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for ravel-environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Supervisor configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment id served by the worker
    pub env_id: String,
    /// Worker executable (looked up on PATH when not a path)
    pub worker_binary: PathBuf,
    /// Redis URL for reload triggers; no trigger listener when unset
    pub redis_url: Option<String>,
    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may go unanswered
    pub heartbeat_timeout: Duration,
    /// Delay before the first respawn attempt
    pub respawn_backoff: Duration,
    /// How long a signalled worker gets to exit before it is killed
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RAVEL_ENV_ID`: environment id
    ///
    /// Optional (with defaults):
    /// - `RAVEL_WORKER_BINARY`: worker executable (default: ravel-worker)
    /// - `RAVEL_REDIS_URL`: reload trigger pub/sub
    /// - `RAVEL_HEARTBEAT_INTERVAL_SECS`: heartbeat interval (default: 30)
    /// - `RAVEL_HEARTBEAT_TIMEOUT_SECS`: heartbeat reply timeout (default: 10)
    /// - `RAVEL_RESPAWN_BACKOFF_MS`: initial respawn delay (default: 1000)
    /// - `RAVEL_SHUTDOWN_GRACE_SECS`: exit grace period (default: 10)
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_id =
            std::env::var("RAVEL_ENV_ID").map_err(|_| ConfigError::Missing("RAVEL_ENV_ID"))?;
        if env_id.trim().is_empty() {
            return Err(ConfigError::Invalid("RAVEL_ENV_ID", "must not be empty"));
        }

        let worker_binary = PathBuf::from(
            std::env::var("RAVEL_WORKER_BINARY").unwrap_or_else(|_| "ravel-worker".to_string()),
        );
        let redis_url = std::env::var("RAVEL_REDIS_URL")
            .ok()
            .filter(|url| !url.is_empty());

        let heartbeat_interval = Duration::from_secs(nonzero(
            "RAVEL_HEARTBEAT_INTERVAL_SECS",
            parse_var("RAVEL_HEARTBEAT_INTERVAL_SECS", 30)?,
        )?);
        let heartbeat_timeout = Duration::from_secs(nonzero(
            "RAVEL_HEARTBEAT_TIMEOUT_SECS",
            parse_var("RAVEL_HEARTBEAT_TIMEOUT_SECS", 10)?,
        )?);
        let respawn_backoff = Duration::from_millis(parse_var("RAVEL_RESPAWN_BACKOFF_MS", 1000)?);
        let shutdown_grace = Duration::from_secs(parse_var("RAVEL_SHUTDOWN_GRACE_SECS", 10)?);

        Ok(Self {
            env_id,
            worker_binary,
            redis_url,
            heartbeat_interval,
            heartbeat_timeout,
            respawn_backoff,
            shutdown_grace,
        })
    }
}

fn parse_var<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a non-negative integer")),
        Err(_) => Ok(default),
    }
}

fn nonzero(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be at least 1"));
    }
    Ok(value)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "RAVEL_ENV_ID",
        "RAVEL_WORKER_BINARY",
        "RAVEL_REDIS_URL",
        "RAVEL_HEARTBEAT_INTERVAL_SECS",
        "RAVEL_HEARTBEAT_TIMEOUT_SECS",
        "RAVEL_RESPAWN_BACKOFF_MS",
        "RAVEL_SHUTDOWN_GRACE_SECS",
    ];

    /// Restores the touched variables on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn cleared() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.vars.push((key.to_string(), env::var(key).ok()));
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe { env::remove_var(key) };
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();
        guard.set("RAVEL_ENV_ID", "env-1");

        let config = Config::from_env().unwrap();
        assert_eq!(config.env_id, "env-1");
        assert_eq!(config.worker_binary, PathBuf::from("ravel-worker"));
        assert!(config.redis_url.is_none());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(10));
        assert_eq!(config.respawn_backoff, Duration::from_millis(1000));
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();
        guard.set("RAVEL_ENV_ID", "env-2");
        guard.set("RAVEL_WORKER_BINARY", "/opt/ravel/bin/ravel-worker");
        guard.set("RAVEL_REDIS_URL", "redis://localhost:6379");
        guard.set("RAVEL_HEARTBEAT_INTERVAL_SECS", "5");
        guard.set("RAVEL_HEARTBEAT_TIMEOUT_SECS", "2");
        guard.set("RAVEL_RESPAWN_BACKOFF_MS", "250");
        guard.set("RAVEL_SHUTDOWN_GRACE_SECS", "3");

        let config = Config::from_env().unwrap();
        assert_eq!(config.worker_binary, PathBuf::from("/opt/ravel/bin/ravel-worker"));
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(2));
        assert_eq!(config.respawn_backoff, Duration::from_millis(250));
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
    }

    #[test]
    fn test_missing_env_id() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::cleared();
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RAVEL_ENV_ID")));
    }

    #[test]
    fn test_invalid_heartbeat() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();
        guard.set("RAVEL_ENV_ID", "env-3");
        guard.set("RAVEL_HEARTBEAT_INTERVAL_SECS", "0");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("RAVEL_HEARTBEAT_INTERVAL_SECS", _)));

        guard.set("RAVEL_HEARTBEAT_INTERVAL_SECS", "soon");
        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for RAVEL_HEARTBEAT_INTERVAL_SECS: must be a non-negative integer"
        );
    }
}
