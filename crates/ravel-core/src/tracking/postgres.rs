// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL tracking store.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::{
    ExecutionLog, NewTracking, Result, TrackingError, TrackingKind, TrackingRecord, TrackingStatus,
    TrackingStore, ensure_terminal,
};
use crate::migrations;

/// PostgreSQL-backed tracking store.
#[derive(Clone)]
pub struct PostgresTracking {
    pool: PgPool,
}

impl PostgresTracking {
    /// Use an existing pool. Migrations are not run.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and migrate.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| TrackingError::Database {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;
        migrations::run_postgres(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl TrackingStore for PostgresTracking {
    async fn create(&self, kind: TrackingKind, record: &NewTracking) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (tracking_id, resource_name, resource_iid, {}, status, delay) \
             VALUES ($1, $2, $3, NOW(), 'pending', $4)",
            kind.table(),
            kind.time_column()
        );
        sqlx::query(&sql)
            .bind(&record.tracking_id)
            .bind(&record.resource_name)
            .bind(&record.resource_iid)
            .bind(record.delay_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, kind: TrackingKind, tracking_id: &str) -> Result<Option<TrackingRecord>> {
        let sql = format!(
            "SELECT tracking_id, resource_name, resource_iid, {} AS submitted_at, \
                    started_at, completed_at, status, delay, errors \
             FROM {} WHERE tracking_id = $1",
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
            "UPDATE {} SET status = 'processing', started_at = NOW() \
             WHERE tracking_id = $1 AND status IN ('pending', 'processing')",
            kind.table()
        );
        let result = sqlx::query(&sql).bind(tracking_id).execute(&self.pool).await?;
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
            "UPDATE {} SET status = $1, completed_at = NOW(), errors = $2 \
             WHERE tracking_id = $3 AND status IN ('pending', 'processing')",
            kind.table()
        );
        let result = sqlx::query(&sql)
            .bind(status.as_str())
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
             FROM {1} WHERE resource_iid = $1 ORDER BY {0} DESC LIMIT $2",
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
            "INSERT INTO {} (iid, tracking_id, duration_ms, status, message, errors) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            kind.log_table()
        );
        sqlx::query(&sql)
            .bind(&log.iid)
            .bind(&log.tracking_id)
            .bind(log.duration_ms)
            .bind(&log.status)
            .bind(&log.message)
            .bind(&log.errors)
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
             FROM {} WHERE iid = $1 ORDER BY id DESC LIMIT $2",
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Option<PostgresTracking> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        PostgresTracking::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn test_tracking_lifecycle() {
        let Some(store) = test_store().await else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let tracking_id = uuid::Uuid::new_v4().to_string();
        store
            .create(
                TrackingKind::Message,
                &NewTracking {
                    tracking_id: tracking_id.clone(),
                    resource_name: "emails".to_string(),
                    resource_iid: "q-1".to_string(),
                    delay_ms: None,
                },
            )
            .await
            .unwrap();

        assert!(store.mark_processing(TrackingKind::Message, &tracking_id).await.unwrap());
        assert!(
            store
                .finish(TrackingKind::Message, &tracking_id, TrackingStatus::Completed, None)
                .await
                .unwrap()
        );
        assert!(!store.mark_processing(TrackingKind::Message, &tracking_id).await.unwrap());

        let record = store.get(TrackingKind::Message, &tracking_id).await.unwrap().unwrap();
        assert_eq!(record.status().unwrap(), TrackingStatus::Completed);

        sqlx::query("DELETE FROM messages WHERE tracking_id = $1")
            .bind(&tracking_id)
            .execute(&store.pool)
            .await
            .unwrap();
    }
}
