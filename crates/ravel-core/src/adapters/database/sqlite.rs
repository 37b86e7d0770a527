// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite adapter, used for embedded deployments and tests.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine as _;
use serde_json::{Map, Value};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteQueryResult,
    SqliteRow,
};
use sqlx::{Column, Row as _, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};

use super::{DatabaseAdapter, DatabaseTransaction, ExecOutcome, Row, db_error};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, access_str};
use crate::descriptor::{ResourceType, backend};
use crate::error::Result;
use crate::query::{Dialect, SqlValue, Statement};

/// SQLite database adapter.
pub struct SqliteAdapter {
    name: String,
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Wrap an existing pool.
    pub fn new(name: impl Into<String>, pool: SqlitePool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    /// A private in-memory database.
    ///
    /// The pool holds exactly one connection that is never recycled, since every
    /// in-memory connection is a separate database.
    pub async fn in_memory(name: impl Into<String>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| db_error("connect", e))?;
        Ok(Self::new(name, pool))
    }

    /// Open (creating if needed) a database file.
    pub async fn open(
        name: impl Into<String>,
        options: SqliteConnectOptions,
        pool_size: u32,
    ) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(options.create_if_missing(true))
            .await
            .map_err(|e| db_error("connect", e))?;
        Ok(Self::new(name, pool))
    }

    fn bind<'q>(statement: &'q Statement) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = match param {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Text(s) => query.bind(s.as_str()),
                SqlValue::Json(v) => query.bind(v.to_string()),
                SqlValue::Timestamp(t) => query.bind(t.to_rfc3339()),
                SqlValue::Date(d) => query.bind(d.to_string()),
            };
        }
        query
    }
}

fn outcome(result: SqliteQueryResult) -> ExecOutcome {
    ExecOutcome {
        rows_affected: result.rows_affected(),
        last_insert_id: u64::try_from(result.last_insert_rowid()).ok(),
    }
}

/// Decode a row using each value's storage class.
fn decode_row(row: &SqliteRow) -> Row {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let value = match row.try_get_raw(i) {
            Ok(raw) if raw.is_null() => Value::Null,
            Ok(raw) => {
                let storage = raw.type_info().name().to_string();
                decode_value(row, i, &storage)
            }
            Err(_) => Value::Null,
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

fn decode_value(row: &SqliteRow, i: usize, storage: &str) -> Value {
    let decoded = match storage {
        "INTEGER" | "BOOLEAN" | "INT8" | "BIGINT" => {
            row.try_get_unchecked::<i64, _>(i).map(Value::from)
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => row
            .try_get_unchecked::<f64, _>(i)
            .map(|f| serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)),
        "BLOB" => row
            .try_get_unchecked::<Vec<u8>, _>(i)
            .map(|bytes| Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))),
        _ => row.try_get_unchecked::<String, _>(i).map(Value::String),
    };
    decoded.unwrap_or_else(|e| {
        tracing::debug!(column = i, storage = %storage, error = %e, "Cannot decode SQLite value");
        Value::Null
    })
}

#[async_trait]
impl DatabaseAdapter for SqliteAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<Row>> {
        let rows = Self::bind(statement)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("fetch", e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome> {
        let result = Self::bind(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("execute", e))?;
        Ok(outcome(result))
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await.map_err(|e| db_error("begin", e))?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// A transaction on one SQLite connection.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl DatabaseTransaction for SqliteTransaction {
    async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let conn: &mut SqliteConnection = &mut self.tx;
        let rows = SqliteAdapter::bind(statement)
            .fetch_all(conn)
            .await
            .map_err(|e| db_error("fetch", e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<ExecOutcome> {
        let conn: &mut SqliteConnection = &mut self.tx;
        let result = SqliteAdapter::bind(statement)
            .execute(conn)
            .await
            .map_err(|e| db_error("execute", e))?;
        Ok(outcome(result))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(|e| db_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(|e| db_error("rollback", e))
    }
}

/// Factory for `SQLite` resources.
///
/// Access settings: `{url}` for an explicit connection string, or `{path}` naming a
/// directory that holds one file per logical database. With neither, every logical
/// database is a private in-memory database.
pub struct SqliteFactory;

#[async_trait]
impl AdapterFactory for SqliteFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Database
    }

    fn backend(&self) -> &'static str {
        backend::SQLITE
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let name = request
            .database
            .map(|db| db.applied_name(request.env_id))
            .unwrap_or_else(|| request.descriptor.name.clone());

        let adapter = if let Some(url) = access_str(request.access, &["url"]) {
            if url.contains(":memory:") {
                SqliteAdapter::in_memory(name).await?
            } else {
                let options =
                    SqliteConnectOptions::from_str(url).map_err(|e| request.setup_error(e))?;
                SqliteAdapter::open(name, options, request.pool_size).await?
            }
        } else if let Some(dir) = access_str(request.access, &["path"]) {
            let dir = PathBuf::from(dir);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| {
                    request.setup_error(format!("cannot create {}: {}", dir.display(), e))
                })?;
            let options = SqliteConnectOptions::new().filename(dir.join(format!("{}.db", name)));
            SqliteAdapter::open(name, options, request.pool_size).await?
        } else {
            SqliteAdapter::in_memory(name).await?
        };

        tracing::debug!(
            resource = %request.descriptor.iid,
            database = %adapter.name,
            "Connected SQLite database"
        );
        Ok(Adapter::Database(std::sync::Arc::new(adapter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DatabaseConfig, ResourceDescriptor};
    use serde_json::json;

    #[tokio::test]
    async fn test_decode_storage_classes() {
        let adapter = SqliteAdapter::in_memory("t").await.unwrap();
        let rows = adapter
            .fetch_all(&Statement::raw(
                "SELECT 1 AS i, 2.5 AS f, 'x' AS s, NULL AS n, X'0102' AS b",
            ))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["i"], json!(1));
        assert_eq!(rows[0]["f"], json!(2.5));
        assert_eq!(rows[0]["s"], json!("x"));
        assert_eq!(rows[0]["n"], Value::Null);
        assert_eq!(rows[0]["b"], json!("AQI="));
    }

    #[tokio::test]
    async fn test_bound_parameters() {
        let adapter = SqliteAdapter::in_memory("t").await.unwrap();
        let statement = Statement {
            sql: "SELECT ? AS a, ? AS b, ? AS c".to_string(),
            params: vec![
                SqlValue::Int(7),
                SqlValue::Text("hi".into()),
                SqlValue::Json(json!({"k": 1})),
            ],
            json_columns: vec![],
        };
        let rows = adapter.fetch_all(&statement).await.unwrap();
        assert_eq!(rows[0]["a"], json!(7));
        assert_eq!(rows[0]["b"], json!("hi"));
        assert_eq!(rows[0]["c"], json!("{\"k\":1}"));
    }

    #[tokio::test]
    async fn test_execute_reports_last_insert_id() {
        let adapter = SqliteAdapter::in_memory("t").await.unwrap();
        adapter
            .execute(&Statement::raw(
                "CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)",
            ))
            .await
            .unwrap();
        let outcome = adapter
            .execute(&Statement::raw("INSERT INTO t (v) VALUES ('a'), ('b')"))
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 2);
        assert_eq!(outcome.last_insert_id, Some(2));
    }

    #[tokio::test]
    async fn test_factory_uses_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ResourceDescriptor {
            iid: "res-sqlite".to_string(),
            name: "local".to_string(),
            resource_type: ResourceType::Database,
            instance: backend::SQLITE.to_string(),
            access: json!({"path": dir.path().to_string_lossy()}),
            access_read_only: vec![],
            encrypted: false,
            updated_at: None,
        };
        let database = DatabaseConfig {
            iid: "db-1".to_string(),
            name: "main".to_string(),
            assign_unique_name: true,
            pool_size: None,
            models: vec![],
        };
        let request = ConnectRequest {
            descriptor: &descriptor,
            access: &descriptor.access,
            database: Some(&database),
            env_id: "env-a",
            pool_size: 2,
        };

        let adapter = SqliteFactory.connect(&request).await.unwrap();
        let db = adapter.as_database().unwrap();
        assert_eq!(db.name(), "env_a_db_1");
        assert_eq!(db.dialect(), Dialect::Sqlite);
        db.execute(&Statement::raw("CREATE TABLE t (id INTEGER)")).await.unwrap();
        adapter.disconnect().await.unwrap();

        assert!(dir.path().join("env_a_db_1.db").exists());
    }
}
