// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ravel-environment.

use thiserror::Error;

/// Supervisor errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Launching or signalling a worker failed.
    #[error("Launcher error: {0}")]
    Launcher(#[from] crate::launcher::LauncherError),

    /// Reload trigger subscription failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Result type using SupervisorError.
pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::LauncherError;

    #[test]
    fn test_error_display() {
        let err: SupervisorError = LauncherError::BinaryNotFound("ravel-worker".to_string()).into();
        assert_eq!(err.to_string(), "Launcher error: Worker binary not found: ravel-worker");

        let err: SupervisorError = crate::config::ConfigError::Missing("RAVEL_ENV_ID").into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required environment variable: RAVEL_ENV_ID"
        );
    }
}
