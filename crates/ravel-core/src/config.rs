// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default tracking store location when no URL is configured.
pub const DEFAULT_TRACKING_DATABASE_URL: &str = "sqlite:.data/tracking.db?mode=rwc";

/// Ravel worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment id this worker serves
    pub env_id: String,
    /// Path of the environment configuration document
    pub config_path: PathBuf,
    /// Directory holding handler module manifests
    pub code_dir: PathBuf,
    /// PostgreSQL or SQLite URL of the tracking store
    pub tracking_database_url: String,
    /// Pool size used when a database entry does not set one
    pub default_db_pool_size: u32,
    /// Physical broker queues per logical queue
    pub queue_fanout: usize,
    /// Delayed-message exchanges per logical queue
    pub delayed_exchange_count: usize,
    /// Physical broker queues per scheduled task
    pub task_fanout: usize,
    /// Payloads larger than this are not stored in execution logs
    pub max_log_payload_kb: usize,
    /// Endpoint timeout used when an endpoint does not set one
    pub endpoint_timeout: Duration,
    /// Upper bound for a single adapter disconnect during teardown
    pub disconnect_timeout: Duration,
    /// Passphrase for encrypted resource access settings
    pub encryption_key: Option<String>,
}

impl Config {
    /// Configuration with defaults for every optional setting.
    pub fn new(env_id: impl Into<String>) -> Self {
        Self {
            env_id: env_id.into(),
            config_path: PathBuf::from("./config/environment.json"),
            code_dir: PathBuf::from("./code"),
            tracking_database_url: DEFAULT_TRACKING_DATABASE_URL.to_string(),
            default_db_pool_size: 10,
            queue_fanout: 3,
            delayed_exchange_count: 3,
            task_fanout: 1,
            max_log_payload_kb: 256,
            endpoint_timeout: Duration::from_millis(30_000),
            disconnect_timeout: Duration::from_millis(5_000),
            encryption_key: None,
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `RAVEL_ENV_ID`: environment id served by this worker
    ///
    /// Optional (with defaults):
    /// - `RAVEL_CONFIG_PATH`: environment document (default: ./config/environment.json)
    /// - `RAVEL_CODE_DIR`: handler manifests (default: ./code)
    /// - `RAVEL_TRACKING_DATABASE_URL`: tracking store (default: SQLite under .data/)
    /// - `RAVEL_DEFAULT_DB_POOL_SIZE`: default database pool size (default: 10)
    /// - `RAVEL_QUEUE_FANOUT`: physical queues per logical queue (default: 3)
    /// - `RAVEL_DELAYED_EXCHANGE_COUNT`: delayed exchanges per queue (default: 3)
    /// - `RAVEL_TASK_FANOUT`: physical queues per task (default: 1)
    /// - `RAVEL_MAX_LOG_PAYLOAD_KB`: execution log payload cap (default: 256)
    /// - `RAVEL_ENDPOINT_TIMEOUT_MS`: default endpoint timeout (default: 30000)
    /// - `RAVEL_DISCONNECT_TIMEOUT_MS`: per-adapter disconnect bound (default: 5000)
    /// - `RAVEL_ENCRYPTION_KEY`: passphrase for encrypted access settings
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_id =
            std::env::var("RAVEL_ENV_ID").map_err(|_| ConfigError::Missing("RAVEL_ENV_ID"))?;
        if env_id.trim().is_empty() {
            return Err(ConfigError::Invalid("RAVEL_ENV_ID", "must not be empty"));
        }

        let mut config = Self::new(env_id);

        if let Ok(path) = std::env::var("RAVEL_CONFIG_PATH") {
            config.config_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("RAVEL_CODE_DIR") {
            config.code_dir = PathBuf::from(dir);
        }
        if let Ok(url) = std::env::var("RAVEL_TRACKING_DATABASE_URL") {
            config.tracking_database_url = url;
        }

        config.default_db_pool_size = parse_var(
            "RAVEL_DEFAULT_DB_POOL_SIZE",
            config.default_db_pool_size,
            "must be a positive integer",
        )?;
        config.queue_fanout = positive(
            "RAVEL_QUEUE_FANOUT",
            parse_var("RAVEL_QUEUE_FANOUT", config.queue_fanout, "must be a positive integer")?,
        )?;
        config.delayed_exchange_count = positive(
            "RAVEL_DELAYED_EXCHANGE_COUNT",
            parse_var(
                "RAVEL_DELAYED_EXCHANGE_COUNT",
                config.delayed_exchange_count,
                "must be a positive integer",
            )?,
        )?;
        config.task_fanout = positive(
            "RAVEL_TASK_FANOUT",
            parse_var("RAVEL_TASK_FANOUT", config.task_fanout, "must be a positive integer")?,
        )?;
        config.max_log_payload_kb = parse_var(
            "RAVEL_MAX_LOG_PAYLOAD_KB",
            config.max_log_payload_kb,
            "must be a non-negative integer",
        )?;

        let endpoint_timeout_ms: u64 = parse_var(
            "RAVEL_ENDPOINT_TIMEOUT_MS",
            30_000,
            "must be a number of milliseconds",
        )?;
        config.endpoint_timeout = Duration::from_millis(endpoint_timeout_ms);

        let disconnect_timeout_ms: u64 = parse_var(
            "RAVEL_DISCONNECT_TIMEOUT_MS",
            5_000,
            "must be a number of milliseconds",
        )?;
        config.disconnect_timeout = Duration::from_millis(disconnect_timeout_ms);

        config.encryption_key = std::env::var("RAVEL_ENCRYPTION_KEY")
            .ok()
            .filter(|key| !key.is_empty());

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

fn positive(key: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be at least 1"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
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
        "RAVEL_CONFIG_PATH",
        "RAVEL_CODE_DIR",
        "RAVEL_TRACKING_DATABASE_URL",
        "RAVEL_DEFAULT_DB_POOL_SIZE",
        "RAVEL_QUEUE_FANOUT",
        "RAVEL_DELAYED_EXCHANGE_COUNT",
        "RAVEL_TASK_FANOUT",
        "RAVEL_MAX_LOG_PAYLOAD_KB",
        "RAVEL_ENDPOINT_TIMEOUT_MS",
        "RAVEL_DISCONNECT_TIMEOUT_MS",
        "RAVEL_ENCRYPTION_KEY",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }

        fn clear_optional(&mut self) {
            for key in ALL_VARS {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
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
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RAVEL_ENV_ID", "env-123");
        guard.clear_optional();

        let config = Config::from_env().unwrap();

        assert_eq!(config.env_id, "env-123");
        assert_eq!(config.tracking_database_url, DEFAULT_TRACKING_DATABASE_URL);
        assert_eq!(config.default_db_pool_size, 10);
        assert_eq!(config.queue_fanout, 3);
        assert_eq!(config.delayed_exchange_count, 3);
        assert_eq!(config.task_fanout, 1);
        assert_eq!(config.max_log_payload_kb, 256);
        assert_eq!(config.endpoint_timeout, Duration::from_secs(30));
        assert!(config.encryption_key.is_none());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RAVEL_ENV_ID", "env-prod");
        guard.set("RAVEL_CONFIG_PATH", "/etc/ravel/env.json");
        guard.set("RAVEL_CODE_DIR", "/srv/code");
        guard.set("RAVEL_TRACKING_DATABASE_URL", "postgres://db/meta");
        guard.set("RAVEL_DEFAULT_DB_POOL_SIZE", "25");
        guard.set("RAVEL_QUEUE_FANOUT", "8");
        guard.set("RAVEL_DELAYED_EXCHANGE_COUNT", "2");
        guard.set("RAVEL_TASK_FANOUT", "4");
        guard.set("RAVEL_MAX_LOG_PAYLOAD_KB", "64");
        guard.set("RAVEL_ENDPOINT_TIMEOUT_MS", "1500");
        guard.set("RAVEL_DISCONNECT_TIMEOUT_MS", "250");
        guard.set("RAVEL_ENCRYPTION_KEY", "s3cret");

        let config = Config::from_env().unwrap();

        assert_eq!(config.config_path, PathBuf::from("/etc/ravel/env.json"));
        assert_eq!(config.code_dir, PathBuf::from("/srv/code"));
        assert_eq!(config.tracking_database_url, "postgres://db/meta");
        assert_eq!(config.default_db_pool_size, 25);
        assert_eq!(config.queue_fanout, 8);
        assert_eq!(config.delayed_exchange_count, 2);
        assert_eq!(config.task_fanout, 4);
        assert_eq!(config.max_log_payload_kb, 64);
        assert_eq!(config.endpoint_timeout, Duration::from_millis(1500));
        assert_eq!(config.disconnect_timeout, Duration::from_millis(250));
        assert_eq!(config.encryption_key.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_config_missing_env_id() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("RAVEL_ENV_ID");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("RAVEL_ENV_ID")));
        assert!(err.to_string().contains("RAVEL_ENV_ID"));
    }

    #[test]
    fn test_config_zero_fanout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RAVEL_ENV_ID", "env-123");
        guard.clear_optional();
        guard.set("RAVEL_QUEUE_FANOUT", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("RAVEL_QUEUE_FANOUT", _)));
    }

    #[test]
    fn test_config_invalid_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RAVEL_ENV_ID", "env-123");
        guard.clear_optional();
        guard.set("RAVEL_ENDPOINT_TIMEOUT_MS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("RAVEL_ENDPOINT_TIMEOUT_MS", _)
        ));
    }

    #[test]
    fn test_empty_encryption_key_is_ignored() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("RAVEL_ENV_ID", "env-123");
        guard.clear_optional();
        guard.set("RAVEL_ENCRYPTION_KEY", "");

        let config = Config::from_env().unwrap();
        assert!(config.encryption_key.is_none());
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
