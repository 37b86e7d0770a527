// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery tracking for queue messages and scheduled task runs.
//!
//! Each message or task run has one tracking record whose status only moves forward:
//! `pending → processing → completed | errors`. The stores enforce this with guarded
//! `UPDATE ... WHERE status IN (...)` statements, so a stale writer can never reopen a
//! finished record.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresTracking;
pub use self::sqlite::SqliteTracking;

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineError;

/// Errors from the tracking store.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TrackingError {
    /// A statement failed.
    #[error("tracking {operation} failed: {details}")]
    Database {
        /// Operation that failed.
        operation: String,
        /// Driver error text.
        details: String,
    },

    /// Applying migrations failed.
    #[error("tracking migrations failed: {0}")]
    Migration(String),

    /// The tracking URL names neither PostgreSQL nor SQLite.
    #[error("unsupported tracking database URL '{0}'")]
    UnsupportedUrl(String),

    /// A stored status string is not one of the known statuses.
    #[error("unknown tracking status '{0}'")]
    UnknownStatus(String),
}

impl From<sqlx::Error> for TrackingError {
    fn from(err: sqlx::Error) -> Self {
        TrackingError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for TrackingError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        TrackingError::Migration(err.to_string())
    }
}

impl From<TrackingError> for EngineError {
    fn from(err: TrackingError) -> Self {
        EngineError::Tracking(err.to_string())
    }
}

/// Result type for tracking operations.
pub type Result<T> = std::result::Result<T, TrackingError>;

/// Lifecycle status of a tracking record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackingStatus {
    /// Submitted, not yet picked up.
    Pending,
    /// A worker is running the handler.
    Processing,
    /// Handler succeeded.
    Completed,
    /// Handler or its resolution failed.
    Errors,
}

impl TrackingStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Errors => "errors",
        }
    }

    /// Whether the record is finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errors)
    }
}

impl std::fmt::Display for TrackingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrackingStatus {
    type Err = TrackingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "errors" => Ok(Self::Errors),
            other => Err(TrackingError::UnknownStatus(other.to_string())),
        }
    }
}

/// What is being tracked; selects the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackingKind {
    /// Queue messages (`messages`, `queue_logs`).
    Message,
    /// Scheduled task runs (`cronjobs`, `task_logs`).
    CronJob,
}

impl TrackingKind {
    /// Tracking table.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Message => "messages",
            Self::CronJob => "cronjobs",
        }
    }

    /// Column holding the submission (messages) or trigger (cron jobs) time.
    pub fn time_column(&self) -> &'static str {
        match self {
            Self::Message => "submitted_at",
            Self::CronJob => "triggered_at",
        }
    }

    /// Execution log table.
    pub fn log_table(&self) -> &'static str {
        match self {
            Self::Message => "queue_logs",
            Self::CronJob => "task_logs",
        }
    }
}

/// A new tracking record, always created as `pending`.
#[derive(Debug, Clone)]
pub struct NewTracking {
    /// Unique tracking id.
    pub tracking_id: String,
    /// Queue or task name.
    pub resource_name: String,
    /// Queue or task id.
    pub resource_iid: String,
    /// Requested delivery delay in milliseconds.
    pub delay_ms: Option<i64>,
}

/// A stored tracking record.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TrackingRecord {
    /// Unique tracking id.
    pub tracking_id: String,
    /// Queue or task name.
    pub resource_name: String,
    /// Queue or task id.
    pub resource_iid: String,
    /// Submission (messages) or trigger (cron jobs) time.
    pub submitted_at: DateTime<Utc>,
    /// When processing started.
    pub started_at: Option<DateTime<Utc>>,
    /// When processing finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Stored status string; see [`TrackingRecord::status`].
    #[sqlx(rename = "status")]
    pub status_raw: String,
    /// Requested delivery delay in milliseconds.
    pub delay: Option<i64>,
    /// JSON-encoded error list for failed records.
    pub errors: Option<String>,
}

impl TrackingRecord {
    /// Parsed status.
    pub fn status(&self) -> Result<TrackingStatus> {
        self.status_raw.parse()
    }

    /// Parsed error list.
    pub fn errors_json(&self) -> Option<Value> {
        self.errors.as_deref().and_then(|e| serde_json::from_str(e).ok())
    }
}

/// One execution log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutionLog {
    /// Queue or task id.
    pub iid: String,
    /// Tracking id of the processed message or run.
    pub tracking_id: String,
    /// Handler wall time.
    pub duration_ms: i64,
    /// Terminal status.
    pub status: String,
    /// Payload (queues) or result text, possibly replaced by a size notice.
    pub message: Option<String>,
    /// JSON-encoded error list.
    pub errors: Option<String>,
}

/// Persistent store of tracking records and execution logs.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Insert a `pending` record.
    async fn create(&self, kind: TrackingKind, record: &NewTracking) -> Result<()>;

    /// Fetch a record.
    async fn get(&self, kind: TrackingKind, tracking_id: &str) -> Result<Option<TrackingRecord>>;

    /// Move a record to `processing`. Returns `false` when the record does not exist
    /// or is already finished.
    async fn mark_processing(&self, kind: TrackingKind, tracking_id: &str) -> Result<bool>;

    /// Move a record to a terminal status. Returns `false` when the record does not
    /// exist or is already finished.
    async fn finish(
        &self,
        kind: TrackingKind,
        tracking_id: &str,
        status: TrackingStatus,
        errors: Option<&Value>,
    ) -> Result<bool>;

    /// Most recent records of one queue or task, newest first.
    async fn list_recent(
        &self,
        kind: TrackingKind,
        resource_iid: &str,
        limit: i64,
    ) -> Result<Vec<TrackingRecord>>;

    /// Append an execution log entry.
    async fn write_log(&self, kind: TrackingKind, log: &ExecutionLog) -> Result<()>;

    /// Most recent execution logs of one queue or task, newest first.
    async fn list_logs(
        &self,
        kind: TrackingKind,
        iid: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionLog>>;
}

/// Reject terminal-status misuse before it reaches SQL.
pub(crate) fn ensure_terminal(status: TrackingStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(TrackingError::Database {
            operation: "finish".to_string(),
            details: format!("'{}' is not a terminal status", status),
        })
    }
}

/// Open the tracking store named by `url` and apply migrations.
///
/// `postgres://` / `postgresql://` URLs select PostgreSQL, `sqlite:` URLs SQLite.
pub async fn connect(url: &str) -> Result<Arc<dyn TrackingStore>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(PostgresTracking::connect(url).await?))
    } else if url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteTracking::connect(url).await?))
    } else {
        Err(TrackingError::UnsupportedUrl(url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            TrackingStatus::Pending,
            TrackingStatus::Processing,
            TrackingStatus::Completed,
            TrackingStatus::Errors,
        ] {
            assert_eq!(status.as_str().parse::<TrackingStatus>().unwrap(), status);
        }
        assert!(TrackingStatus::Errors.is_terminal());
        assert!(!TrackingStatus::Processing.is_terminal());
        assert!("done".parse::<TrackingStatus>().is_err());
        assert!(ensure_terminal(TrackingStatus::Pending).is_err());
    }

    #[test]
    fn test_kind_tables() {
        assert_eq!(TrackingKind::Message.table(), "messages");
        assert_eq!(TrackingKind::CronJob.time_column(), "triggered_at");
        assert_eq!(TrackingKind::CronJob.log_table(), "task_logs");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_url() {
        let err = connect("mysql://localhost/tracking").await.err().unwrap();
        assert!(matches!(err, TrackingError::UnsupportedUrl(_)));

        let store = connect("sqlite::memory:").await.unwrap();
        assert!(store.get(TrackingKind::Message, "nope").await.unwrap().is_none());
    }
}
