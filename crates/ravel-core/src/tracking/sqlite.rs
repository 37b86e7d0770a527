// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite tracking store for single-node and embedded deployments.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use super::{
    ExecutionLog, NewTracking, Result, TrackingError, TrackingKind, TrackingRecord, TrackingStatus,
    TrackingStore, ensure_terminal,
};
use crate::migrations;

/// SQLite-backed tracking store.
#[derive(Clone)]
pub struct SqliteTracking {
    pool: SqlitePool,
}

impl SqliteTracking {
    /// Use an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, creating the file and its directory if needed, and migrate.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| TrackingError::Database {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:");
        if !in_memory
            && let Some(parent) = options.get_filename().parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TrackingError::Database {
                    operation: "create_dir".to_string(),
                    details: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
        }

        // Every in-memory connection is its own database, so keep exactly one alive.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| TrackingError::Database {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl TrackingStore for SqliteTracking {
    async fn create(&self, kind: TrackingKind, record: &NewTracking) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (tracking_id, resource_name, resource_iid, {}, status, delay) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            kind.table(),
            kind.time_column()
        );
        sqlx::query(&sql)
            .bind(&record.tracking_id)
            .bind(&record.resource_name)
            .bind(&record.resource_iid)
            .bind(Utc::now())
            .bind(record.delay_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, kind: TrackingKind, tracking_id: &str) -> Result<Option<TrackingRecord>> {
        let sql = format!(
            "SELECT tracking_id, resource_name, resource_iid, {} AS submitted_at, \
                    started_at, completed_at, status, delay, errors \
             FROM {} WHERE tracking_id = ?1",
            kind.time_column(),
            kind.table()
        );
        let record = sqlx::query_as::<_, TrackingRecord>(&sql)
            .bind(tracking_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn mark_processing(&self, kind: TrackingKind, tracking_id: &str) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET status = 'processing', started_at = ?1 \
             WHERE tracking_id = ?2 AND status IN ('pending', 'processing')",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(Utc::now())
            .bind(tracking_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish(
        &self,
        kind: TrackingKind,
        tracking_id: &str,
        status: TrackingStatus,
        errors: Option<&Value>,
    ) -> Result<bool> {
        ensure_terminal(status)?;
        let sql = format!(
            "UPDATE {} SET status = ?1, completed_at = ?2, errors = ?3 \
             WHERE tracking_id = ?4 AND status IN ('pending', 'processing')",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(errors.map(Value::to_string))
            .bind(tracking_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_recent(
        &self,
        kind: TrackingKind,
        resource_iid: &str,
        limit: i64,
    ) -> Result<Vec<TrackingRecord>> {
        let sql = format!(
            "SELECT tracking_id, resource_name, resource_iid, {0} AS submitted_at, \
                    started_at, completed_at, status, delay, errors \
             FROM {1} WHERE resource_iid = ?1 ORDER BY {0} DESC LIMIT ?2",
            kind.time_column(),
            kind.table()
        );
        let records = sqlx::query_as::<_, TrackingRecord>(&sql)
            .bind(resource_iid)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn write_log(&self, kind: TrackingKind, log: &ExecutionLog) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (iid, tracking_id, duration_ms, status, message, errors, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            kind.log_table()
        );
        sqlx::query(&sql)
            .bind(&log.iid)
            .bind(&log.tracking_id)
            .bind(log.duration_ms)
            .bind(&log.status)
            .bind(&log.message)
            .bind(&log.errors)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_logs(
        &self,
        kind: TrackingKind,
        iid: &str,
        limit: i64,
    ) -> Result<Vec<ExecutionLog>> {
        let sql = format!(
            "SELECT iid, tracking_id, duration_ms, status, message, errors \
             FROM {} WHERE iid = ?1 ORDER BY id DESC LIMIT ?2",
            kind.log_table()
        );
        let logs = sqlx::query_as::<_, ExecutionLog>(&sql)
            .bind(iid)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(logs)
    }
}
