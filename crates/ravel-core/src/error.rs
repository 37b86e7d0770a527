// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for ravel-core.
//!
//! Every failure that can reach a caller outside the engine is an [`EngineError`].
//! Each variant maps to a stable error code and an origin, and can be rendered as the
//! `{origin, code, message, details?}` structure returned to external callers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ConfigError;
use crate::descriptor::crypto::CryptoError;
use crate::query::QueryError;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Which side of the call an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorOrigin {
    /// The caller supplied something the engine cannot act on.
    #[serde(rename = "client_error")]
    Client,
    /// The engine or one of its resources failed.
    #[serde(rename = "server_error")]
    Server,
}

/// Errors produced by the engine core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// A logical resource could not be resolved to a live adapter.
    #[error("{category} '{name}' is not available")]
    ResourceNotFound {
        /// Logical name used by application code.
        name: String,
        /// Resource category (database, cache, ...).
        category: String,
    },

    /// No adapter implementation is registered for a backend kind.
    #[error("no {category} adapter is available for backend '{kind}'")]
    UnsupportedBackend {
        /// Backend kind string from the resource descriptor.
        kind: String,
        /// Resource category.
        category: String,
    },

    /// Establishing a connection to a resource failed.
    #[error("cannot connect to resource '{resource}': {reason}")]
    AdapterSetup {
        /// Resource id.
        resource: String,
        /// Failure description.
        reason: String,
    },

    /// The environment configuration is inconsistent or incomplete.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A model referenced by application code does not exist in the database schema.
    #[error("model '{model}' does not exist in database '{database}'")]
    ModelNotFound {
        /// Logical database name.
        database: String,
        /// Model name.
        model: String,
    },

    /// Query description could not be compiled.
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// Operation that failed.
        operation: String,
        /// Driver error text.
        details: String,
    },

    /// Cache, broker, storage or realtime backend failed.
    #[error("{backend} error during '{operation}': {details}")]
    Backend {
        /// Backend family.
        backend: &'static str,
        /// Operation that failed.
        operation: String,
        /// Error text.
        details: String,
    },

    /// Tracking record storage failed.
    #[error("tracking store error: {0}")]
    Tracking(String),

    /// Handler module resolution or invocation failed.
    #[error("{message}")]
    Handler {
        /// Stable error code (e.g. `missingDefaultExport`).
        code: String,
        /// Human readable message.
        message: String,
        /// Optional structured details.
        details: Option<Value>,
    },

    /// The environment is administratively suspended.
    #[error("environment is suspended")]
    Suspended,

    /// The engine is initializing or stopped and does not accept requests.
    #[error("server is not ready to process requests")]
    ServerNotReady,

    /// An endpoint handler exceeded its time budget.
    #[error("endpoint '{endpoint}' did not respond within {timeout_ms}ms")]
    EndpointTimeout {
        /// Endpoint name.
        endpoint: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// Decrypting resource access settings failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Process configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Shorthand for a [`EngineError::Backend`] error.
    pub fn backend(backend: &'static str, operation: &str, details: impl ToString) -> Self {
        Self::Backend {
            backend,
            operation: operation.to_string(),
            details: details.to_string(),
        }
    }

    /// Shorthand for a [`EngineError::Handler`] error without details.
    pub fn handler(code: &str, message: impl Into<String>) -> Self {
        Self::Handler {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &str {
        match self {
            Self::ResourceNotFound { .. } => "resourceNotFound",
            Self::UnsupportedBackend { .. } => "unsupportedBackend",
            Self::AdapterSetup { .. } => "adapterSetupFailed",
            Self::InvalidConfiguration(_) => "invalidConfiguration",
            Self::ModelNotFound { .. } => "modelNotFound",
            Self::Query(e) => e.error_code(),
            Self::Database { .. } => "databaseError",
            Self::Backend { .. } => "backendError",
            Self::Tracking(_) => "trackingError",
            Self::Handler { code, .. } => code,
            Self::Suspended => "suspendedEnvironment",
            Self::ServerNotReady => "serverNotReady",
            Self::EndpointTimeout { .. } => "endpointTimeout",
            Self::Crypto(_) => "decryptionFailed",
            Self::Config(_) => "invalidConfiguration",
            Self::Io(_) => "ioError",
            Self::Json(_) => "invalidJson",
        }
    }

    /// Get the origin this error is attributed to.
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            Self::ResourceNotFound { .. }
            | Self::ModelNotFound { .. }
            | Self::Query(_)
            | Self::Suspended
            | Self::Json(_) => ErrorOrigin::Client,
            _ => ErrorOrigin::Server,
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Only transient backend failures qualify. Configuration errors, suspension and
    /// missing resources fail the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database { .. } | Self::Backend { .. } | Self::Tracking(_) | Self::Io(_)
        )
    }

    /// Convert this error to the structure returned to external callers.
    pub fn to_error_message(&self) -> ErrorMessage {
        let details = match self {
            Self::Handler { details, .. } => details.clone(),
            _ => None,
        };
        ErrorMessage {
            origin: self.origin(),
            code: self.error_code().to_string(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::backend("redis", "command", err)
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::backend("storage", "request", err)
    }
}

/// A single user-visible error entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Which side the failure is attributed to.
    pub origin: ErrorOrigin,
    /// Stable error code.
    pub code: String,
    /// Human readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorMessage {
    /// Build an error entry from its parts.
    pub fn new(
        origin: ErrorOrigin,
        code: impl Into<String>,
        message: impl Into<String>,
        details: Option<Value>,
    ) -> Self {
        Self {
            origin,
            code: code.into(),
            message: message.into(),
            details,
        }
    }

    /// Wrap this entry in the `{errors: [...]}` envelope.
    pub fn into_response(self) -> ErrorResponse {
        ErrorResponse { errors: vec![self] }
    }
}

/// The `{errors: [...]}` envelope returned to external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error entries, most relevant first.
    pub errors: Vec<ErrorMessage>,
}

impl From<&EngineError> for ErrorResponse {
    fn from(err: &EngineError) -> Self {
        err.to_error_message().into_response()
    }
}
