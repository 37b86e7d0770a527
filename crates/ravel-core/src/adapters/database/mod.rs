// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relational database adapters and the model-level facade.
//!
//! A [`DatabaseAdapter`] executes compiled [`Statement`]s against one pool.
//!
//! [`Database`] binds a primary adapter, its replicas and the logical schema, and
//! exposes model operations (`create_one`, `find_many`, ...) through [`ModelHandle`].
//! Each `Database` value can hold one open transaction: while it is open, every primary
//! statement issued through that value (and its clones) runs on the transaction's
//! connection. Other callers of the same resource keep using the pool.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::{MySqlAdapter, MySqlFactory};
pub use postgres::{PostgresAdapter, PostgresFactory};
pub use sqlite::{SqliteAdapter, SqliteFactory};

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::query::{
    AggregateQuery, Dialect, Expr, FieldKind, FindQuery, Model, RowTarget, Schema, Statement,
    UpdateInstruction, build_aggregate, build_count, build_delete, build_find, build_find_by_id,
    build_insert, build_search, build_update,
};

/// A result row: column name to JSON value.
pub type Row = Map<String, Value>;

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Rows inserted, updated or deleted.
    pub rows_affected: u64,
    /// Auto-generated id of the last inserted row, where the driver reports one.
    pub last_insert_id: Option<u64>,
}

/// A connection pool to one relational database.
///
/// Adapters are shared by every caller of a resource and hold no transaction state;
/// [`DatabaseAdapter::begin`] checks out a connection owned by the caller.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// SQL dialect spoken by this database.
    fn dialect(&self) -> Dialect;

    /// Physical database name.
    fn name(&self) -> &str;

    /// Run a statement on any pooled connection and return every row.
    async fn fetch_all(&self, statement: &Statement) -> Result<Vec<Row>>;

    /// Run a statement that returns no rows.
    async fn execute(&self, statement: &Statement) -> Result<ExecOutcome>;

    /// Start a transaction on a dedicated connection.
    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>>;

    /// Close the pool.
    async fn disconnect(&self) -> Result<()>;
}

/// A transaction on one checked-out connection.
///
/// Dropping it without committing rolls it back.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Run a statement inside the transaction and return every row.
    async fn fetch_all(&mut self, statement: &Statement) -> Result<Vec<Row>>;

    /// Run a statement inside the transaction that returns no rows.
    async fn execute(&mut self, statement: &Statement) -> Result<ExecOutcome>;

    /// Commit and release the connection.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back and release the connection.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The open transaction of one [`Database`] value, if any.
type TransactionSlot = Arc<Mutex<Option<Box<dyn DatabaseTransaction>>>>;

/// Shorthand for an [`EngineError::Database`] error.
pub(crate) fn db_error(operation: &str, err: impl std::fmt::Display) -> EngineError {
    EngineError::Database {
        operation: operation.to_string(),
        details: err.to_string(),
    }
}

/// Normalize driver values to the model's field kinds.
///
/// JSON documents built by the query (and JSON fields stored as text) are parsed,
/// integer booleans become booleans and decimal strings become numbers.
pub fn normalize_row(model: &Model, json_columns: &[String], mut row: Row) -> Row {
    for (key, value) in row.iter_mut() {
        let replacement = if json_columns.iter().any(|c| c == key) {
            match value {
                Value::String(raw) => serde_json::from_str(raw).ok(),
                _ => None,
            }
        } else {
            match (model.field(key).map(|f| f.kind), &*value) {
                (Some(FieldKind::Boolean), Value::Number(n)) => {
                    Some(Value::Bool(n.as_f64().is_some_and(|n| n != 0.0)))
                }
                (Some(FieldKind::Json), Value::String(raw)) => serde_json::from_str(raw).ok(),
                (Some(FieldKind::Decimal), Value::String(raw)) => raw
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                _ => None,
            }
        };
        if let Some(replacement) = replacement {
            *value = replacement;
        }
    }
    row
}

/// Result of [`ModelHandle::find_many`].
#[derive(Debug, Clone, PartialEq)]
pub struct FindMany {
    /// Matching rows, paged.
    pub data: Vec<Row>,
    /// Total matching rows ignoring paging, when `returnCount` was set.
    pub count: Option<u64>,
}

impl FindMany {
    /// `[rows...]`, or `{info: {count}, data: [rows...]}` when a count was requested.
    pub fn into_value(self) -> Value {
        let data = Value::Array(self.data.into_iter().map(Value::Object).collect());
        match self.count {
            Some(count) => json!({"info": {"count": count}, "data": data}),
            None => data,
        }
    }
}

/// A logical database: schema plus primary and replica adapters.
///
/// Clones share the open transaction; [`Database::new`] starts without one.
#[derive(Clone)]
pub struct Database {
    name: String,
    schema: Arc<Schema>,
    primary: Arc<dyn DatabaseAdapter>,
    replicas: Vec<Arc<dyn DatabaseAdapter>>,
    transaction: TransactionSlot,
}

impl Database {
    /// Bind a schema to its adapters.
    pub fn new(
        name: impl Into<String>,
        schema: Arc<Schema>,
        primary: Arc<dyn DatabaseAdapter>,
        replicas: Vec<Arc<dyn DatabaseAdapter>>,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            primary,
            replicas,
            transaction: Arc::new(Mutex::new(None)),
        }
    }

    /// Logical name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Models of this database.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// The primary adapter.
    pub fn primary(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.primary
    }

    /// Operations on one model.
    pub fn model(&self, name: &str) -> Result<ModelHandle<'_>> {
        let model = self
            .schema
            .model(name)
            .ok_or_else(|| EngineError::ModelNotFound {
                database: self.name.clone(),
                model: name.to_string(),
            })?;
        Ok(ModelHandle { db: self, model })
    }

    /// Open a transaction on the primary. Returns `false` when one was already open.
    pub async fn begin_transaction(&self) -> Result<bool> {
        let mut slot = self.transaction.lock().await;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(self.primary.begin().await?);
        Ok(true)
    }

    /// Commit the open transaction; no-op when none is open.
    pub async fn commit_transaction(&self) -> Result<()> {
        let tx = self.transaction.lock().await.take();
        match tx {
            Some(tx) => tx.commit().await,
            None => Ok(()),
        }
    }

    /// Roll back the open transaction; no-op when none is open.
    pub async fn rollback_transaction(&self) -> Result<()> {
        let tx = self.transaction.lock().await.take();
        match tx {
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }

    /// Whether this value holds an open transaction.
    pub async fn in_transaction(&self) -> bool {
        self.transaction.lock().await.is_some()
    }

    /// A random replica when one is preferred and present.
    fn replica(&self, use_replica: bool) -> Option<&Arc<dyn DatabaseAdapter>> {
        if use_replica {
            self.replicas.choose(&mut rand::thread_rng())
        } else {
            None
        }
    }

    /// Run a statement on the open transaction, or on the primary pool.
    async fn fetch_primary(&self, statement: &Statement) -> Result<Vec<Row>> {
        let mut slot = self.transaction.lock().await;
        match slot.as_mut() {
            Some(tx) => tx.fetch_all(statement).await,
            None => {
                drop(slot);
                self.primary.fetch_all(statement).await
            }
        }
    }

    async fn execute_primary(&self, statement: &Statement) -> Result<ExecOutcome> {
        let mut slot = self.transaction.lock().await;
        match slot.as_mut() {
            Some(tx) => tx.execute(statement).await,
            None => {
                drop(slot);
                self.primary.execute(statement).await
            }
        }
    }

    async fn fetch_from(&self, use_replica: bool, statement: &Statement) -> Result<Vec<Row>> {
        match self.replica(use_replica) {
            Some(replica) => replica.fetch_all(statement).await,
            None => self.fetch_primary(statement).await,
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("dialect", &self.primary.dialect())
            .field("replicas", &self.replicas.len())
            .finish()
    }
}

/// Operations on one model of a [`Database`].
#[derive(Clone, Copy)]
pub struct ModelHandle<'a> {
    db: &'a Database,
    model: &'a Model,
}

impl<'a> ModelHandle<'a> {
    /// The model metadata.
    pub fn model(&self) -> &'a Model {
        self.model
    }

    fn dialect(&self) -> Dialect {
        self.db.primary.dialect()
    }

    async fn fetch(&self, use_replica: bool, statement: &Statement) -> Result<Vec<Row>> {
        let rows = self.db.fetch_from(use_replica, statement).await?;
        Ok(rows
            .into_iter()
            .map(|row| normalize_row(self.model, &statement.json_columns, row))
            .collect())
    }

    /// Insert one row and return it as stored.
    pub async fn create_one(&self, values: Row) -> Result<Row> {
        let dialect = self.dialect();
        let returning = dialect.sql().supports_returning();
        let rows = [values];
        let statement = build_insert(dialect.sql(), self.model, &rows, returning)?
            .ok_or_else(|| db_error("create", "nothing to insert"))?;

        if returning {
            return self
                .fetch(false, &statement)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| db_error("create", "insert returned no row"));
        }

        let outcome = self.db.execute_primary(&statement).await?;
        let id = rows[0]
            .get(self.model.id_field())
            .filter(|id| !id.is_null())
            .cloned()
            .or_else(|| outcome.last_insert_id.map(Value::from))
            .ok_or_else(|| db_error("create", "driver reported no inserted id"))?;
        self.find_by_id(&id, &FindQuery::default())
            .await?
            .ok_or_else(|| db_error("create", format!("inserted row {} not found", id)))
    }

    /// Insert many rows in one statement. Returns the number inserted.
    ///
    /// Runs in a transaction: this caller's open one if any, otherwise one opened and
    /// closed here.
    pub async fn create_many(&self, rows: &[Row]) -> Result<u64> {
        let Some(statement) = build_insert(self.dialect().sql(), self.model, rows, false)? else {
            return Ok(0);
        };

        let opened = self.db.begin_transaction().await?;
        match self.db.execute_primary(&statement).await {
            Ok(outcome) => {
                if opened {
                    self.db.commit_transaction().await?;
                }
                Ok(outcome.rows_affected)
            }
            Err(e) => {
                if opened && let Err(rollback) = self.db.rollback_transaction().await {
                    tracing::warn!(
                        model = %self.model.name,
                        error = %rollback,
                        "Rollback after failed bulk insert failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Find a row by primary key.
    pub async fn find_by_id(&self, id: &Value, query: &FindQuery) -> Result<Option<Row>> {
        let dialect = self.dialect().sql();
        let statement = build_find_by_id(dialect, &self.db.schema, self.model, id, query)?;
        Ok(self.fetch(query.use_read_replica, &statement).await?.into_iter().next())
    }

    /// Find the first row matching the query.
    pub async fn find_one(&self, query: &FindQuery) -> Result<Option<Row>> {
        let mut query = query.clone();
        query.limit = Some(1);
        let statement = build_find(self.dialect().sql(), &self.db.schema, self.model, &query)?;
        Ok(self.fetch(query.use_read_replica, &statement).await?.into_iter().next())
    }

    /// Find every row matching the query, with the total count when requested.
    pub async fn find_many(&self, query: &FindQuery) -> Result<FindMany> {
        let dialect = self.dialect().sql();
        let statement = build_find(dialect, &self.db.schema, self.model, query)?;
        let data = self.fetch(query.use_read_replica, &statement).await?;

        let count = if query.return_count {
            let statement = build_count(dialect, &self.db.schema, self.model, query)?;
            let rows = self.db.fetch_from(query.use_read_replica, &statement).await?;
            Some(
                rows.first()
                    .and_then(|row| row.get("count"))
                    .and_then(count_value)
                    .unwrap_or(0),
            )
        } else {
            None
        };

        Ok(FindMany { data, count })
    }

    /// Update one row by primary key and return it after the update.
    pub async fn update_by_id(
        &self,
        id: &Value,
        update: &UpdateInstruction,
    ) -> Result<Option<Row>> {
        let dialect = self.dialect();
        let returning = dialect.sql().supports_returning();
        let target = RowTarget::Id(id.clone());
        let Some(statement) = build_update(dialect.sql(), self.model, update, &target, returning)?
        else {
            return self.find_by_id(id, &FindQuery::default()).await;
        };

        if returning {
            return Ok(self.fetch(false, &statement).await?.into_iter().next());
        }
        // Affected-row counts exclude matched but unchanged rows on MySQL, so read back
        // regardless.
        self.db.execute_primary(&statement).await?;
        self.find_by_id(id, &FindQuery::default()).await
    }

    /// Update every row matching `filter`. Returns the number of rows affected.
    pub async fn update(&self, filter: Option<Expr>, update: &UpdateInstruction) -> Result<u64> {
        let target = RowTarget::Filter(filter);
        let dialect = self.dialect().sql();
        let Some(statement) = build_update(dialect, self.model, update, &target, false)? else {
            return Ok(0);
        };
        Ok(self.db.execute_primary(&statement).await?.rows_affected)
    }

    /// Delete one row by primary key and return it.
    pub async fn delete_by_id(&self, id: &Value) -> Result<Option<Row>> {
        let dialect = self.dialect();
        let target = RowTarget::Id(id.clone());
        if dialect.sql().supports_returning() {
            let statement = build_delete(dialect.sql(), self.model, &target, true)?;
            return Ok(self.fetch(false, &statement).await?.into_iter().next());
        }

        let Some(existing) = self.find_by_id(id, &FindQuery::default()).await? else {
            return Ok(None);
        };
        let statement = build_delete(dialect.sql(), self.model, &target, false)?;
        self.db.execute_primary(&statement).await?;
        Ok(Some(existing))
    }

    /// Delete every row matching `filter`. Returns the number of rows deleted.
    pub async fn delete(&self, filter: Option<Expr>) -> Result<u64> {
        let target = RowTarget::Filter(filter);
        let statement = build_delete(self.dialect().sql(), self.model, &target, false)?;
        Ok(self.db.execute_primary(&statement).await?.rows_affected)
    }

    /// Group and aggregate rows.
    pub async fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<Row>> {
        let dialect = self.dialect().sql();
        let statement = build_aggregate(dialect, &self.db.schema, self.model, query)?;
        self.fetch(query.use_read_replica, &statement).await
    }

    /// Full-text search over the model's searchable fields.
    pub async fn search_text(&self, text: &str, query: &FindQuery) -> Result<Vec<Row>> {
        let dialect = self.dialect().sql();
        let statement = build_search(dialect, &self.db.schema, self.model, text, query)?;
        self.fetch(query.use_read_replica, &statement).await
    }
}

fn count_value(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FieldKind, UpdateOp};

    fn orders() -> Model {
        Model::new("orders")
            .with_field("status", FieldKind::Text)
            .with_field("total", FieldKind::Decimal)
            .with_field("paid", FieldKind::Boolean)
            .with_field("meta", FieldKind::Json)
    }

    async fn test_db() -> Database {
        let adapter = SqliteAdapter::in_memory("main").await.unwrap();
        adapter
            .execute(&Statement::raw(
                r#"
                CREATE TABLE orders (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT,
                    total REAL,
                    paid BOOLEAN,
                    meta TEXT
                )
                "#,
            ))
            .await
            .unwrap();
        Database::new(
            "main",
            Arc::new(Schema::new([orders()])),
            Arc::new(adapter),
            vec![],
        )
    }

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_normalize_row() {
        let model = orders();
        let normalized = normalize_row(
            &model,
            &["customer".to_string()],
            row(json!({
                "paid": 1,
                "meta": "{\"a\":1}",
                "total": "12.50",
                "status": "{\"not\":\"parsed\"}",
                "customer": "{\"name\":\"Ann\"}"
            })),
        );
        assert_eq!(normalized["paid"], json!(true));
        assert_eq!(normalized["meta"], json!({"a": 1}));
        assert_eq!(normalized["total"], json!(12.5));
        assert_eq!(normalized["status"], json!("{\"not\":\"parsed\"}"));
        assert_eq!(normalized["customer"], json!({"name": "Ann"}));
    }

    #[test]
    fn test_find_many_value_shape() {
        let rows = vec![row(json!({"id": 1}))];
        let plain = FindMany { data: rows.clone(), count: None }.into_value();
        assert_eq!(plain, json!([{"id": 1}]));

        let counted = FindMany { data: rows, count: Some(7) }.into_value();
        assert_eq!(counted, json!({"info": {"count": 7}, "data": [{"id": 1}]}));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let db = test_db().await;
        let err = db.model("customers").err().unwrap();
        assert_eq!(err.error_code(), "modelNotFound");
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();

        let created = orders
            .create_one(row(json!({
                "status": "new",
                "total": 10.5,
                "paid": false,
                "meta": {"src": "web"}
            })))
            .await
            .unwrap();
        assert_eq!(created["status"], "new");
        assert_eq!(created["paid"], json!(false));
        assert_eq!(created["meta"], json!({"src": "web"}));
        let id = created["id"].clone();

        let found = orders.find_by_id(&id, &FindQuery::default()).await.unwrap().unwrap();
        assert_eq!(found["total"], json!(10.5));

        let missing = orders.find_by_id(&json!(999), &FindQuery::default()).await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_create_many_and_count() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();

        assert_eq!(orders.create_many(&[]).await.unwrap(), 0);

        let rows: Vec<Row> = (0..5)
            .map(|i| row(json!({"status": if i % 2 == 0 { "open" } else { "closed" }, "total": i})))
            .collect();
        assert_eq!(orders.create_many(&rows).await.unwrap(), 5);
        assert!(!db.in_transaction().await);

        let query: FindQuery = serde_json::from_value(json!({
            "where": {"status": "open"},
            "sort": [{"field": "total", "direction": "desc"}],
            "limit": 2,
            "returnCount": true
        }))
        .unwrap();
        let result = orders.find_many(&query).await.unwrap();
        assert_eq!(result.count, Some(3));
        assert_eq!(result.data.len(), 2);
        assert_eq!(result.data[0]["total"], json!(4.0));

        let first = orders.find_one(&FindQuery::default()).await.unwrap().unwrap();
        assert_eq!(first["status"], "open");
    }

    #[tokio::test]
    async fn test_failed_bulk_insert_rolls_back() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();
        orders.create_one(row(json!({"id": 1, "status": "a"}))).await.unwrap();

        // Second row collides with the existing primary key.
        let rows = vec![row(json!({"id": 2, "status": "b"})), row(json!({"id": 1, "status": "c"}))];
        assert!(orders.create_many(&rows).await.is_err());
        assert!(!db.in_transaction().await);

        let all = orders.find_many(&FindQuery::default()).await.unwrap();
        assert_eq!(all.data.len(), 1);
    }

    #[tokio::test]
    async fn test_update_operations() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();
        let created = orders
            .create_one(row(json!({"status": "new", "total": 10})))
            .await
            .unwrap();
        let id = created["id"].clone();

        let update = UpdateInstruction::set(row(json!({"status": "paid"})))
            .with("total", UpdateOp::Inc, json!(5))
            .with("unknown", UpdateOp::Inc, json!(1));
        let updated = orders.update_by_id(&id, &update).await.unwrap().unwrap();
        assert_eq!(updated["status"], "paid");
        assert_eq!(updated["total"], json!(15.0));

        let capped = UpdateInstruction::default().with("total", UpdateOp::Min, json!(12));
        let updated = orders.update_by_id(&id, &capped).await.unwrap().unwrap();
        assert_eq!(updated["total"], json!(12.0));

        let conflicting =
            UpdateInstruction::set(row(json!({"total": 1}))).with("total", UpdateOp::Inc, json!(1));
        let err = orders.update_by_id(&id, &conflicting).await.unwrap_err();
        assert_eq!(err.error_code(), "conflictingUpdate");

        let affected = orders
            .update(
                Some(Expr::field("status").eq("paid")),
                &UpdateInstruction::set(row(json!({"paid": true}))),
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn test_delete_operations() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();
        let rows: Vec<Row> = (1..=3).map(|i| row(json!({"id": i, "status": "x"}))).collect();
        orders.create_many(&rows).await.unwrap();

        let deleted = orders.delete_by_id(&json!(2)).await.unwrap().unwrap();
        assert_eq!(deleted["id"], json!(2));
        assert!(orders.delete_by_id(&json!(2)).await.unwrap().is_none());

        assert_eq!(orders.delete(Some(Expr::field("id").gt(1))).await.unwrap(), 1);
        assert_eq!(orders.delete(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pinned_transaction() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();

        assert!(db.begin_transaction().await.unwrap());
        assert!(!db.begin_transaction().await.unwrap());
        orders.create_one(row(json!({"status": "draft"}))).await.unwrap();
        // create_many joins the pinned transaction and leaves it open.
        orders.create_many(&[row(json!({"status": "draft"}))]).await.unwrap();
        assert!(db.in_transaction().await);
        db.rollback_transaction().await.unwrap();

        let all = orders.find_many(&FindQuery::default()).await.unwrap();
        assert!(all.data.is_empty());

        db.begin_transaction().await.unwrap();
        orders.create_one(row(json!({"status": "kept"}))).await.unwrap();
        db.commit_transaction().await.unwrap();
        // Commit and rollback without an open transaction are no-ops.
        db.commit_transaction().await.unwrap();
        db.rollback_transaction().await.unwrap();

        let all = orders.find_many(&FindQuery::default()).await.unwrap();
        assert_eq!(all.data.len(), 1);
    }

    /// Two callers over one file-backed adapter, as the registry hands them out.
    async fn shared_callers() -> (tempfile::TempDir, Database, Database) {
        let dir = tempfile::tempdir().unwrap();
        let options =
            sqlx::sqlite::SqliteConnectOptions::new().filename(dir.path().join("shared.db"));
        let adapter: Arc<dyn DatabaseAdapter> =
            Arc::new(SqliteAdapter::open("shared", options, 4).await.unwrap());
        adapter
            .execute(&Statement::raw(
                "CREATE TABLE orders (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 status TEXT, total REAL, paid BOOLEAN, meta TEXT)",
            ))
            .await
            .unwrap();
        let schema = Arc::new(Schema::new([orders()]));
        let a = Database::new("main", schema.clone(), adapter.clone(), vec![]);
        let b = Database::new("main", schema, adapter, vec![]);
        (dir, a, b)
    }

    #[tokio::test]
    async fn test_rollback_keeps_other_callers_writes() {
        let (_dir, a, b) = shared_callers().await;

        assert!(a.begin_transaction().await.unwrap());
        assert!(!b.in_transaction().await);
        b.model("orders")
            .unwrap()
            .create_one(row(json!({"status": "b-write"})))
            .await
            .unwrap();
        a.rollback_transaction().await.unwrap();

        let seen = b.model("orders").unwrap().find_many(&FindQuery::default()).await.unwrap();
        assert_eq!(seen.data.len(), 1);
        assert_eq!(seen.data[0]["status"], "b-write");
    }

    #[tokio::test]
    async fn test_uncommitted_writes_stay_private() {
        let (_dir, a, b) = shared_callers().await;

        a.begin_transaction().await.unwrap();
        a.model("orders")
            .unwrap()
            .create_one(row(json!({"status": "a-draft"})))
            .await
            .unwrap();
        // The caller reads its own write through its transaction.
        let own = a.model("orders").unwrap().find_many(&FindQuery::default()).await.unwrap();
        assert_eq!(own.data.len(), 1);
        let other = b.model("orders").unwrap().find_many(&FindQuery::default()).await.unwrap();
        assert!(other.data.is_empty());

        a.commit_transaction().await.unwrap();
        let other = b.model("orders").unwrap().find_many(&FindQuery::default()).await.unwrap();
        assert_eq!(other.data.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_bulk_insert_beside_open_transaction() {
        let (_dir, a, b) = shared_callers().await;
        b.model("orders")
            .unwrap()
            .create_one(row(json!({"id": 1, "status": "seed"})))
            .await
            .unwrap();

        assert!(b.begin_transaction().await.unwrap());
        let rows = vec![
            row(json!({"id": 2, "status": "a"})),
            row(json!({"id": 1, "status": "dup"})),
        ];
        assert!(a.model("orders").unwrap().create_many(&rows).await.is_err());
        assert!(!a.in_transaction().await);
        // B's transaction is untouched by A's bulk insert and its rollback.
        assert!(b.in_transaction().await);

        b.model("orders")
            .unwrap()
            .create_one(row(json!({"id": 3, "status": "b-tx"})))
            .await
            .unwrap();
        b.commit_transaction().await.unwrap();

        let all = a.model("orders").unwrap().find_many(&FindQuery::default()).await.unwrap();
        let ids: Vec<Value> = all.data.iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn test_aggregate_and_search() {
        let db = test_db().await;
        let orders = db.model("orders").unwrap();
        let rows: Vec<Row> = [("open", 5), ("open", 20), ("closed", 1)]
            .iter()
            .map(|(status, total)| row(json!({"status": status, "total": total})))
            .collect();
        orders.create_many(&rows).await.unwrap();

        let query: AggregateQuery = serde_json::from_value(json!({
            "groupBy": ["status"],
            "computations": [{"as": "sum", "compute": {"$sum": "$total"}}],
            "having": {"sum": {"$gt": 10}}
        }))
        .unwrap();
        let groups = orders.aggregate(&query).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["sum"], json!(25.0));

        let hits = orders.search_text("clos", &FindQuery::default()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0]["status"], "closed");
    }
}
