// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL adapter.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{
    Column, Connection, PgConnection, PgPool, Postgres, Row as _, Transaction, TypeInfo, ValueRef,
};

use super::{DatabaseAdapter, DatabaseTransaction, ExecOutcome, Row, db_error};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, access_str, access_u16};
use crate::descriptor::{ResourceType, backend};
use crate::error::Result;
use crate::query::{Dialect, SqlValue, Statement};

/// SQLSTATE for "database does not exist".
const INVALID_CATALOG_NAME: &str = "3D000";

/// PostgreSQL database adapter.
pub struct PostgresAdapter {
    name: String,
    pool: PgPool,
}

impl PostgresAdapter {
    /// Wrap an existing pool.
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    /// Connect to `options`' database, creating it first when it does not exist.
    pub async fn connect(options: PgConnectOptions, pool_size: u32) -> Result<Self> {
        let name = options.get_database().unwrap_or("postgres").to_string();
        let pool_options = PgPoolOptions::new().max_connections(pool_size.max(1));

        let pool = match pool_options.clone().connect_with(options.clone()).await {
            Ok(pool) => pool,
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some(INVALID_CATALOG_NAME) => {
                create_database(&options, &name).await?;
                pool_options
                    .connect_with(options)
                    .await
                    .map_err(|e| db_error("connect", e))?
            }
            Err(e) => return Err(db_error("connect", e)),
        };

        Ok(Self::new(name, pool))
    }

    fn bind<'q>(statement: &'q Statement) -> sqlx::query::Query<'q, Postgres, PgArguments> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = match param {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Bool(b) => query.bind(*b),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Text(s) => query.bind(s.as_str()),
                SqlValue::Json(v) => query.bind(sqlx::types::Json(v)),
                SqlValue::Timestamp(t) => query.bind(*t),
                SqlValue::Date(d) => query.bind(*d),
            };
        }
        query
    }
}

async fn create_database(options: &PgConnectOptions, name: &str) -> Result<()> {
    let mut admin = PgConnection::connect_with(&options.clone().database("postgres"))
        .await
        .map_err(|e| db_error("connect", e))?;
    let ddl = format!("CREATE DATABASE \"{}\"", name.replace('"', "\"\""));
    sqlx::query(&ddl)
        .execute(&mut admin)
        .await
        .map_err(|e| db_error("create_database", e))?;
    admin.close().await.map_err(|e| db_error("disconnect", e))?;
    tracing::info!(database = %name, "Created PostgreSQL database");
    Ok(())
}

fn decode_row(row: &PgRow) -> Row {
    let mut out = Map::new();
    for (i, column) in row.columns().iter().enumerate() {
        let is_null = row.try_get_raw(i).map(|raw| raw.is_null()).unwrap_or(true);
        let value = if is_null {
            Value::Null
        } else {
            decode_value(row, i, column.type_info().name())
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

fn float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn decode_value(row: &PgRow, i: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOL" => row.try_get_unchecked::<bool, _>(i).map(Value::Bool),
        "INT2" => row.try_get_unchecked::<i16, _>(i).map(Value::from),
        "INT4" => row.try_get_unchecked::<i32, _>(i).map(Value::from),
        "INT8" => row.try_get_unchecked::<i64, _>(i).map(Value::from),
        "FLOAT4" => row.try_get_unchecked::<f32, _>(i).map(|f| float(f64::from(f))),
        "FLOAT8" => row.try_get_unchecked::<f64, _>(i).map(float),
        "NUMERIC" => row
            .try_get_unchecked::<Decimal, _>(i)
            .map(|d| d.to_f64().map_or(Value::Null, float)),
        "JSON" | "JSONB" => row
            .try_get_unchecked::<sqlx::types::Json<Value>, _>(i)
            .map(|json| json.0),
        "TIMESTAMPTZ" => row
            .try_get_unchecked::<DateTime<Utc>, _>(i)
            .map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get_unchecked::<NaiveDateTime, _>(i)
            .map(|t| Value::String(t.and_utc().to_rfc3339())),
        "DATE" => row
            .try_get_unchecked::<NaiveDate, _>(i)
            .map(|d| Value::String(d.to_string())),
        "UUID" => row
            .try_get_unchecked::<uuid::Uuid, _>(i)
            .map(|u| Value::String(u.to_string())),
        _ => row.try_get_unchecked::<String, _>(i).map(Value::String),
    };
    decoded.unwrap_or_else(|e| {
        tracing::debug!(
            column = i,
            pg_type = %type_name,
            error = %e,
            "Cannot decode PostgreSQL value"
        );
        Value::Null
    })
}

fn outcome(result: PgQueryResult) -> ExecOutcome {
    ExecOutcome {
        rows_affected: result.rows_affected(),
        last_insert_id: None,
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
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
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// A transaction on one PostgreSQL connection.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let conn: &mut PgConnection = &mut self.tx;
        let rows = PostgresAdapter::bind(statement)
            .fetch_all(conn)
            .await
            .map_err(|e| db_error("fetch", e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<ExecOutcome> {
        let conn: &mut PgConnection = &mut self.tx;
        let result = PostgresAdapter::bind(statement)
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

/// Connection options from `{url}` or `{host, port, user|username, password}`.
pub(crate) fn connect_options(request: &ConnectRequest<'_>) -> Result<PgConnectOptions> {
    let access = request.access;
    let mut options = match access_str(access, &["url"]) {
        Some(url) => PgConnectOptions::from_str(url).map_err(|e| request.setup_error(e))?,
        None => {
            let host = access_str(access, &["host"])
                .ok_or_else(|| request.setup_error("access.host is required"))?;
            let mut options = PgConnectOptions::new()
                .host(host)
                .port(access_u16(access, "port").unwrap_or(5432));
            if let Some(user) = access_str(access, &["user", "username"]) {
                options = options.username(user);
            }
            if let Some(password) = access_str(access, &["password"]) {
                options = options.password(password);
            }
            options
        }
    };

    if let Some(database) = request.database {
        options = options.database(&database.applied_name(request.env_id));
    } else if let Some(database) = access_str(access, &["database"]) {
        options = options.database(database);
    }
    Ok(options)
}

/// Factory for `PostgreSQL` resources.
pub struct PostgresFactory;

#[async_trait]
impl AdapterFactory for PostgresFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Database
    }

    fn backend(&self) -> &'static str {
        backend::POSTGRESQL
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let options = connect_options(request)?;
        let adapter = PostgresAdapter::connect(options, request.pool_size).await?;
        tracing::debug!(
            resource = %request.descriptor.iid,
            database = %adapter.name,
            "Connected PostgreSQL database"
        );
        Ok(Adapter::Database(Arc::new(adapter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DatabaseConfig, ResourceDescriptor};
    use serde_json::json;

    fn descriptor(access: Value) -> ResourceDescriptor {
        ResourceDescriptor {
            iid: "res-pg".to_string(),
            name: "pg".to_string(),
            resource_type: ResourceType::Database,
            instance: backend::POSTGRESQL.to_string(),
            access,
            access_read_only: vec![],
            encrypted: false,
            updated_at: None,
        }
    }

    #[test]
    fn test_connect_options_from_parts() {
        let desc = descriptor(json!({
            "host": "db",
            "port": "6432",
            "username": "app",
            "password": "pw"
        }));
        let database = DatabaseConfig {
            iid: "db-Main".to_string(),
            name: "main".to_string(),
            assign_unique_name: true,
            pool_size: None,
            models: vec![],
        };
        let request = ConnectRequest {
            descriptor: &desc,
            access: &desc.access,
            database: Some(&database),
            env_id: "Env-1",
            pool_size: 4,
        };
        let options = connect_options(&request).unwrap();
        assert_eq!(options.get_host(), "db");
        assert_eq!(options.get_port(), 6432);
        assert_eq!(options.get_username(), "app");
        assert_eq!(options.get_database(), Some("env_1_db_main"));
    }

    #[test]
    fn test_connect_options_require_host_or_url() {
        let desc = descriptor(json!({"port": 5432}));
        let request = ConnectRequest {
            descriptor: &desc,
            access: &desc.access,
            database: None,
            env_id: "env",
            pool_size: 1,
        };
        let err = connect_options(&request).unwrap_err();
        assert_eq!(err.error_code(), "adapterSetupFailed");
    }

    /// Runs against a live server when TEST_DATABASE_URL is set.
    #[tokio::test]
    async fn test_round_trip_types() {
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("Skipping test: TEST_DATABASE_URL not set");
            return;
        };
        let options = PgConnectOptions::from_str(&url).unwrap();
        let adapter = PostgresAdapter::connect(options, 2).await.unwrap();
        let statement = Statement {
            sql: "SELECT $1::int8 AS i, $2::text AS s, $3::jsonb AS j, \
                  1.50::numeric AS d, true AS b, NULL::text AS n"
                .to_string(),
            params: vec![
                SqlValue::Int(5),
                SqlValue::Text("x".into()),
                SqlValue::Json(json!({"a": 1})),
            ],
            json_columns: vec![],
        };
        let rows = adapter.fetch_all(&statement).await.unwrap();
        assert_eq!(rows[0]["i"], json!(5));
        assert_eq!(rows[0]["s"], json!("x"));
        assert_eq!(rows[0]["j"], json!({"a": 1}));
        assert_eq!(rows[0]["d"], json!(1.5));
        assert_eq!(rows[0]["b"], json!(true));
        assert_eq!(rows[0]["n"], Value::Null);

        let mut tx = adapter.begin().await.unwrap();
        tx.execute(&Statement::raw("SELECT 1")).await.unwrap();
        tx.rollback().await.unwrap();
        adapter.disconnect().await.unwrap();
    }
}
