// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MySQL adapter.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Map, Value};
use sqlx::mysql::{
    MySqlArguments, MySqlConnectOptions, MySqlPoolOptions, MySqlQueryResult, MySqlRow,
};
use sqlx::{
    Column, Connection, MySql, MySqlConnection, MySqlPool, Row as _, Transaction, TypeInfo,
    ValueRef,
};

use super::{DatabaseAdapter, DatabaseTransaction, ExecOutcome, Row, db_error};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, access_str, access_u16};
use crate::descriptor::{ResourceType, backend};
use crate::error::Result;
use crate::query::{Dialect, SqlValue, Statement};

/// MySQL database adapter.
pub struct MySqlAdapter {
    name: String,
    pool: MySqlPool,
}

impl MySqlAdapter {
    /// Wrap an existing pool.
    pub fn new(name: impl Into<String>, pool: MySqlPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }

    /// Create the database named in `options` if missing, then connect to it.
    pub async fn connect(
        options: MySqlConnectOptions,
        database: &str,
        pool_size: u32,
    ) -> Result<Self> {
        let mut admin = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| db_error("connect", e))?;
        let ddl = format!("CREATE DATABASE IF NOT EXISTS `{}`", database.replace('`', "``"));
        sqlx::query(&ddl)
            .execute(&mut admin)
            .await
            .map_err(|e| db_error("create_database", e))?;
        admin.close().await.map_err(|e| db_error("disconnect", e))?;

        let pool = MySqlPoolOptions::new()
            .max_connections(pool_size.max(1))
            .connect_with(options.database(database))
            .await
            .map_err(|e| db_error("connect", e))?;
        Ok(Self::new(database, pool))
    }

    fn bind<'q>(statement: &'q Statement) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
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

fn decode_row(row: &MySqlRow) -> Row {
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

fn decode_value(row: &MySqlRow, i: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOLEAN" => row.try_get_unchecked::<bool, _>(i).map(Value::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            row.try_get_unchecked::<i64, _>(i).map(Value::from)
        }
        name if name.ends_with("UNSIGNED") => row.try_get_unchecked::<u64, _>(i).map(Value::from),
        "FLOAT" => row.try_get_unchecked::<f32, _>(i).map(|f| float(f64::from(f))),
        "DOUBLE" => row.try_get_unchecked::<f64, _>(i).map(float),
        "DECIMAL" => row
            .try_get_unchecked::<Decimal, _>(i)
            .map(|d| d.to_f64().map_or(Value::Null, float)),
        "JSON" => row
            .try_get_unchecked::<sqlx::types::Json<Value>, _>(i)
            .map(|json| json.0),
        "TIMESTAMP" => row
            .try_get_unchecked::<DateTime<Utc>, _>(i)
            .map(|t| Value::String(t.to_rfc3339())),
        "DATETIME" => row
            .try_get_unchecked::<NaiveDateTime, _>(i)
            .map(|t| Value::String(t.and_utc().to_rfc3339())),
        "DATE" => row
            .try_get_unchecked::<NaiveDate, _>(i)
            .map(|d| Value::String(d.to_string())),
        _ => row.try_get_unchecked::<String, _>(i).map(Value::String),
    };
    decoded.unwrap_or_else(|e| {
        tracing::debug!(
            column = i,
            mysql_type = %type_name,
            error = %e,
            "Cannot decode MySQL value"
        );
        Value::Null
    })
}

fn outcome(result: MySqlQueryResult) -> ExecOutcome {
    ExecOutcome {
        rows_affected: result.rows_affected(),
        // Zero means the statement generated no id.
        last_insert_id: Some(result.last_insert_id()).filter(|id| *id > 0),
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    fn dialect(&self) -> Dialect {
        Dialect::MySql
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
        Ok(Box::new(MySqlTransaction { tx }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// A transaction on one MySQL connection.
pub struct MySqlTransaction {
    tx: Transaction<'static, MySql>,
}

#[async_trait]
impl DatabaseTransaction for MySqlTransaction {
    async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let conn: &mut MySqlConnection = &mut self.tx;
        let rows = MySqlAdapter::bind(statement)
            .fetch_all(conn)
            .await
            .map_err(|e| db_error("fetch", e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    async fn execute(&mut self, statement: &Statement) -> Result<ExecOutcome> {
        let conn: &mut MySqlConnection = &mut self.tx;
        let result = MySqlAdapter::bind(statement)
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

/// Server options (without database) and the database name to use.
pub(crate) fn connect_options(
    request: &ConnectRequest<'_>,
) -> Result<(MySqlConnectOptions, String)> {
    let access = request.access;
    let (options, url_database) = match access_str(access, &["url"]) {
        Some(url) => {
            let parsed = url::Url::parse(url).map_err(|e| request.setup_error(e))?;
            let database = parsed.path().trim_start_matches('/').to_string();
            let options = MySqlConnectOptions::from_str(url).map_err(|e| request.setup_error(e))?;
            (options, Some(database).filter(|d| !d.is_empty()))
        }
        None => {
            let host = access_str(access, &["host"])
                .ok_or_else(|| request.setup_error("access.host is required"))?;
            let mut options = MySqlConnectOptions::new()
                .host(host)
                .port(access_u16(access, "port").unwrap_or(3306));
            if let Some(user) = access_str(access, &["user", "username"]) {
                options = options.username(user);
            }
            if let Some(password) = access_str(access, &["password"]) {
                options = options.password(password);
            }
            (options, None)
        }
    };

    let database = request
        .database
        .map(|db| db.applied_name(request.env_id))
        .or_else(|| access_str(access, &["database"]).map(str::to_string))
        .or(url_database)
        .ok_or_else(|| request.setup_error("no database name"))?;
    Ok((options, database))
}

/// Factory for `MySQL` resources.
pub struct MySqlFactory;

#[async_trait]
impl AdapterFactory for MySqlFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Database
    }

    fn backend(&self) -> &'static str {
        backend::MYSQL
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let (options, database) = connect_options(request)?;
        let adapter = MySqlAdapter::connect(options, &database, request.pool_size).await?;
        tracing::debug!(
            resource = %request.descriptor.iid,
            database = %adapter.name,
            "Connected MySQL database"
        );
        Ok(Adapter::Database(Arc::new(adapter)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ResourceDescriptor;
    use serde_json::json;

    fn descriptor(access: Value) -> ResourceDescriptor {
        ResourceDescriptor {
            iid: "res-mysql".to_string(),
            name: "mysql".to_string(),
            resource_type: ResourceType::Database,
            instance: backend::MYSQL.to_string(),
            access,
            access_read_only: vec![],
            encrypted: false,
            updated_at: None,
        }
    }

    #[test]
    fn test_connect_options_database_name() {
        let desc = descriptor(json!({"url": "mysql://root:pw@db:3306/shop"}));
        let request = ConnectRequest {
            descriptor: &desc,
            access: &desc.access,
            database: None,
            env_id: "env",
            pool_size: 1,
        };
        let (_, database) = connect_options(&request).unwrap();
        assert_eq!(database, "shop");

        let desc = descriptor(json!({"host": "db"}));
        let request = ConnectRequest {
            descriptor: &desc,
            access: &desc.access,
            database: None,
            env_id: "env",
            pool_size: 1,
        };
        assert!(connect_options(&request).is_err());
    }

    /// Runs against a live server when TEST_MYSQL_URL is set.
    #[tokio::test]
    async fn test_insert_reports_generated_id() {
        let Ok(url) = std::env::var("TEST_MYSQL_URL") else {
            eprintln!("Skipping test: TEST_MYSQL_URL not set");
            return;
        };
        let options = MySqlConnectOptions::from_str(&url).unwrap();
        let adapter = MySqlAdapter::connect(options, "ravel_adapter_test", 2).await.unwrap();
        // Temporary tables are per connection; hold one.
        let mut tx = adapter.begin().await.unwrap();
        tx.execute(&Statement::raw(
            "CREATE TEMPORARY TABLE t \
             (id BIGINT AUTO_INCREMENT PRIMARY KEY, v VARCHAR(10), flag BOOLEAN)",
        ))
        .await
        .unwrap();
        let outcome = tx
            .execute(&Statement {
                sql: "INSERT INTO t (v, flag) VALUES (?, ?)".to_string(),
                params: vec![SqlValue::Text("a".into()), SqlValue::Bool(true)],
                json_columns: vec![],
            })
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert!(outcome.last_insert_id.is_some());

        let rows = tx.fetch_all(&Statement::raw("SELECT v, flag FROM t")).await.unwrap();
        assert_eq!(rows[0]["v"], json!("a"));
        tx.rollback().await.unwrap();
        adapter.disconnect().await.unwrap();
    }
}
