// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Find queries: projection, joins, filtering, sorting and pagination.

use serde::Deserialize;
use serde_json::Value;

use super::QueryError;
use super::dialect::SqlDialect;
use super::expr::{Expr, FieldRef};
use super::model::{Field, FieldKind, Model, Schema};
use super::writer::{Scope, ScopeEntry, SqlWriter, Statement};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending.
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    /// Descending.
    #[serde(alias = "DESC")]
    Desc,
}

impl SortDirection {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Sort {
    /// Field (`field` or `alias.field`), or a computation alias in aggregations.
    pub field: String,
    /// Direction.
    #[serde(default)]
    pub direction: SortDirection,
}

impl Sort {
    /// Ascending sort on `field`.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on `field`.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

fn default_join_target() -> String {
    "id".to_string()
}

/// How a joined model is matched.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JoinKind {
    /// Foreign-key equality yielding at most one related row.
    #[serde(alias = "join")]
    Simple {
        /// Field of the base model holding the reference.
        from: String,
        /// Field of the joined model it matches.
        #[serde(default = "default_join_target")]
        to: String,
    },
    /// Correlated lookup yielding an array of related rows.
    Complex {
        /// Predicate over the joined model. `model.field` reaches the base row.
        #[serde(default, rename = "where")]
        filter: Option<Expr>,
        /// Order of related rows.
        #[serde(default)]
        sort: Vec<Sort>,
        /// Related rows to skip.
        #[serde(default)]
        skip: Option<u64>,
        /// Maximum related rows.
        #[serde(default)]
        limit: Option<u64>,
    },
}

/// A join specification.
#[derive(Debug, Clone, Deserialize)]
pub struct Join {
    /// Output key and SQL alias.
    #[serde(rename = "as")]
    pub alias: String,
    /// Joined model name.
    pub model: String,
    /// Match strategy.
    #[serde(flatten)]
    pub kind: JoinKind,
    /// Fields of the joined model to include.
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// Fields of the joined model to exclude.
    #[serde(default)]
    pub omit: Option<Vec<String>>,
}

impl Join {
    /// Simple join `alias` on `base.from = model.id`.
    pub fn simple(alias: &str, model: &str, from: &str) -> Self {
        Self {
            alias: alias.to_string(),
            model: model.to_string(),
            kind: JoinKind::Simple {
                from: from.to_string(),
                to: default_join_target(),
            },
            select: None,
            omit: None,
        }
    }

    /// Complex join `alias` with a correlated predicate.
    pub fn complex(alias: &str, model: &str, filter: Expr) -> Self {
        Self {
            alias: alias.to_string(),
            model: model.to_string(),
            kind: JoinKind::Complex {
                filter: Some(filter),
                sort: Vec::new(),
                skip: None,
                limit: None,
            },
            select: None,
            omit: None,
        }
    }
}

/// A find query description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindQuery {
    /// Fields to include.
    pub select: Option<Vec<String>>,
    /// Fields to exclude.
    pub omit: Option<Vec<String>>,
    /// Row predicate.
    #[serde(rename = "where")]
    pub filter: Option<Expr>,
    /// Joined models.
    #[serde(alias = "lookup")]
    pub joins: Vec<Join>,
    /// Sort keys.
    pub sort: Vec<Sort>,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Maximum rows.
    pub limit: Option<u64>,
    /// Also return the total count ignoring skip and limit.
    pub return_count: bool,
    /// Read from a replica when one is available.
    pub use_read_replica: bool,
}

impl FindQuery {
    /// Add a conjunct to the filter.
    pub fn and_filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => expr.and(existing),
            None => expr,
        });
        self
    }
}

/// Fields kept by a select/omit pair, in declaration order.
///
/// Returns `None` when neither list is given.
pub(crate) fn projected_fields<'m>(
    model: &'m Model,
    select: Option<&[String]>,
    omit: Option<&[String]>,
) -> Result<Option<Vec<&'m Field>>, QueryError> {
    let check = |names: &[String]| {
        names
            .iter()
            .find(|name| model.field(name).is_none())
            .map_or(Ok(()), |name| Err(QueryError::unknown_field(model, name)))
    };

    match (select, omit) {
        (Some(_), Some(_)) => Err(QueryError::Invalid(format!(
            "select and omit cannot be combined on '{}'",
            model.name
        ))),
        (Some(select), None) => {
            check(select)?;
            Ok(Some(
                model
                    .fields
                    .iter()
                    .filter(|f| select.iter().any(|s| s == &f.name))
                    .collect(),
            ))
        }
        (None, Some(omit)) => {
            check(omit)?;
            Ok(Some(
                model
                    .fields
                    .iter()
                    .filter(|f| !omit.iter().any(|o| o == &f.name))
                    .collect(),
            ))
        }
        (None, None) => Ok(None),
    }
}

struct ResolvedJoin<'q, 'm> {
    join: &'q Join,
    model: &'m Model,
    fields: Vec<&'m Field>,
}

fn resolve_joins<'q, 'm>(
    schema: &'m Schema,
    base: &'m Model,
    joins: &'q [Join],
) -> Result<Vec<ResolvedJoin<'q, 'm>>, QueryError> {
    let mut resolved = Vec::with_capacity(joins.len());
    for join in joins {
        if resolved.iter().any(|r: &ResolvedJoin<'_, '_>| r.join.alias == join.alias) {
            return Err(QueryError::DuplicateAlias(join.alias.clone()));
        }
        let model = schema
            .model(&join.model)
            .ok_or_else(|| QueryError::UnknownModel(join.model.clone()))?;
        if let JoinKind::Simple { from, to } = &join.kind {
            if base.field(from).is_none() {
                return Err(QueryError::unknown_field(base, from));
            }
            if model.field(to).is_none() {
                return Err(QueryError::unknown_field(model, to));
            }
        }
        let fields = projected_fields(model, join.select.as_deref(), join.omit.as_deref())?
            .unwrap_or_else(|| model.fields.iter().collect());
        resolved.push(ResolvedJoin { join, model, fields });
    }
    Ok(resolved)
}

fn base_scope<'m>(
    dialect: &dyn SqlDialect,
    model: &'m Model,
    joins: &[ResolvedJoin<'_, 'm>],
) -> Scope<'m> {
    joins
        .iter()
        .filter(|j| matches!(j.join.kind, JoinKind::Simple { .. }))
        .fold(Scope::table(dialect, model), |scope, j| {
            scope.with(ScopeEntry {
                name: j.join.alias.clone(),
                qualifier: dialect.quote_ident(&j.join.alias),
                model: j.model,
            })
        })
}

fn column_expr(dialect: &dyn SqlDialect, qualifier: &str, field: &Field) -> String {
    let column = format!("{}.{}", qualifier, dialect.quote_ident(&field.name));
    if field.kind == FieldKind::Geometry {
        dialect.geometry_output(&column)
    } else {
        column
    }
}

fn json_row(dialect: &dyn SqlDialect, qualifier: &str, fields: &[&Field]) -> String {
    let pairs = fields
        .iter()
        .map(|f| (f.name.clone(), column_expr(dialect, qualifier, f)))
        .collect::<Vec<_>>();
    dialect.json_object(&pairs)
}

fn write_projection(
    w: &mut SqlWriter<'_>,
    model: &Model,
    query: &FindQuery,
    joins: &[ResolvedJoin<'_, '_>],
    base: &Scope<'_>,
) -> Result<(), QueryError> {
    let dialect = w.dialect();
    let qualifier = base.default.qualifier.clone();
    let explicit = projected_fields(model, query.select.as_deref(), query.omit.as_deref())?;
    let has_geometry = model.fields.iter().any(|f| f.kind == FieldKind::Geometry);

    if explicit.is_none() && joins.is_empty() && !has_geometry {
        w.push(&qualifier).push(".*");
        return Ok(());
    }

    let mut items: Vec<String> = explicit
        .unwrap_or_else(|| model.fields.iter().collect())
        .into_iter()
        // a join output replaces a field with the same name
        .filter(|f| !joins.iter().any(|j| j.join.alias == f.name))
        .map(|f| {
            let expr = column_expr(dialect, &qualifier, f);
            if f.kind == FieldKind::Geometry {
                format!("{} AS {}", expr, dialect.quote_ident(&f.name))
            } else {
                expr
            }
        })
        .collect();

    let mut wrote_any = false;
    for item in items.drain(..) {
        if wrote_any {
            w.push(", ");
        }
        w.push(&item);
        wrote_any = true;
    }

    for resolved in joins {
        if resolved.fields.is_empty() {
            continue;
        }
        if wrote_any {
            w.push(", ");
        }
        wrote_any = true;

        let alias = &resolved.join.alias;
        let alias_q = dialect.quote_ident(alias);
        match &resolved.join.kind {
            JoinKind::Simple { .. } => {
                let id = dialect.quote_ident(resolved.model.id_field());
                w.push("CASE WHEN ")
                    .push(&alias_q)
                    .push(".")
                    .push(&id)
                    .push(" IS NULL THEN NULL ELSE ")
                    .push(&json_row(dialect, &alias_q, &resolved.fields))
                    .push(" END AS ")
                    .push(&alias_q);
            }
            JoinKind::Complex {
                filter,
                sort,
                skip,
                limit,
            } => {
                let rows_q = dialect.quote_ident(&format!("{}_rows", alias));
                let object = json_row(dialect, &rows_q, &resolved.fields);
                w.push("(SELECT COALESCE(")
                    .push(&dialect.json_array_agg(&object))
                    .push(", ")
                    .push(dialect.empty_json_array())
                    .push(") FROM (SELECT ")
                    .push(&alias_q)
                    .push(".* FROM ")
                    .ident(resolved.model.table_name())
                    .push(" AS ")
                    .push(&alias_q);

                let own = ScopeEntry {
                    name: alias.clone(),
                    qualifier: alias_q.clone(),
                    model: resolved.model,
                };
                let scope = Scope {
                    default: own.clone(),
                    named: vec![own, base.default.clone()],
                };
                w.push_where(filter.as_ref(), &scope)?;
                write_order(w, sort, &scope)?;
                w.push(&dialect.limit_offset(*limit, *skip));
                w.push(") AS ").push(&rows_q).push(") AS ").push(&alias_q);
            }
        }
        w.mark_json_column(alias);
    }

    if !wrote_any {
        return Err(QueryError::Invalid(format!(
            "nothing to select from '{}'",
            model.name
        )));
    }
    Ok(())
}

fn write_join_clauses(w: &mut SqlWriter<'_>, base: &Scope<'_>, joins: &[ResolvedJoin<'_, '_>]) {
    let dialect = w.dialect();
    for resolved in joins {
        if let JoinKind::Simple { from, to } = &resolved.join.kind {
            let alias_q = dialect.quote_ident(&resolved.join.alias);
            w.push(" LEFT JOIN ")
                .ident(resolved.model.table_name())
                .push(" AS ")
                .push(&alias_q)
                .push(" ON ")
                .push(&alias_q)
                .push(".")
                .ident(to)
                .push(" = ")
                .push(&base.default.qualifier)
                .push(".")
                .ident(from);
        }
    }
}

pub(crate) fn write_order(
    w: &mut SqlWriter<'_>,
    sort: &[Sort],
    scope: &Scope<'_>,
) -> Result<(), QueryError> {
    for (i, key) in sort.iter().enumerate() {
        let column = scope.resolve(w.dialect(), &FieldRef::parse(&key.field))?;
        w.push(if i == 0 { " ORDER BY " } else { ", " })
            .push(&column.sql)
            .push(" ")
            .push(key.direction.as_sql());
    }
    Ok(())
}

/// Compile a find query.
pub fn build_find(
    dialect: &dyn SqlDialect,
    schema: &Schema,
    model: &Model,
    query: &FindQuery,
) -> Result<Statement, QueryError> {
    let joins = resolve_joins(schema, model, &query.joins)?;
    let scope = base_scope(dialect, model, &joins);

    let mut w = SqlWriter::new(dialect);
    w.push("SELECT ");
    write_projection(&mut w, model, query, &joins, &scope)?;
    w.push(" FROM ").ident(model.table_name());
    write_join_clauses(&mut w, &scope, &joins);
    w.push_where(query.filter.as_ref(), &scope)?;
    write_order(&mut w, &query.sort, &scope)?;
    w.push(&dialect.limit_offset(query.limit, query.skip));
    Ok(w.finish())
}

/// Compile a count of rows matching the query filter, ignoring paging.
pub fn build_count(
    dialect: &dyn SqlDialect,
    schema: &Schema,
    model: &Model,
    query: &FindQuery,
) -> Result<Statement, QueryError> {
    let joins = resolve_joins(schema, model, &query.joins)?;
    let scope = base_scope(dialect, model, &joins);

    let mut w = SqlWriter::new(dialect);
    w.push("SELECT COUNT(*) AS ").ident("count").push(" FROM ").ident(model.table_name());
    write_join_clauses(&mut w, &scope, &joins);
    w.push_where(query.filter.as_ref(), &scope)?;
    Ok(w.finish())
}

/// Compile a lookup of one row by primary key.
pub fn build_find_by_id(
    dialect: &dyn SqlDialect,
    schema: &Schema,
    model: &Model,
    id: &Value,
    query: &FindQuery,
) -> Result<Statement, QueryError> {
    let mut query = query.clone();
    query.sort.clear();
    query.skip = None;
    query.limit = Some(1);
    let query = query.and_filter(Expr::field(model.id_field()).eq(id.clone()));
    build_find(dialect, schema, model, &query)
}

/// Compile a full-text search over the model's searchable fields.
pub fn build_search(
    dialect: &dyn SqlDialect,
    schema: &Schema,
    model: &Model,
    text: &str,
    query: &FindQuery,
) -> Result<Statement, QueryError> {
    let query = query.clone().and_filter(Expr::text_search(text));
    build_find(dialect, schema, model, &query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::dialect::{MySqlDialect, PostgresDialect, SqliteDialect};
    use crate::query::value::SqlValue;
    use serde_json::json;

    fn schema() -> Schema {
        let customers = Model::new("customers")
            .with_field("name", FieldKind::Text)
            .with_field("country", FieldKind::Text);
        let orders = Model::new("orders")
            .with_reference("customer", "customers")
            .with_field("status", FieldKind::Text)
            .with_field("total", FieldKind::Decimal);
        let items = Model::new("items")
            .with_reference("order", "orders")
            .with_field("sku", FieldKind::Text)
            .with_field("position", FieldKind::Integer);
        Schema::new([customers, orders, items])
    }

    fn find(dialect: &dyn SqlDialect, model: &str, query: Value) -> Statement {
        let schema = schema();
        let query: FindQuery = serde_json::from_value(query).unwrap();
        build_find(dialect, &schema, schema.model(model).unwrap(), &query).unwrap()
    }

    fn find_err(model: &str, query: Value) -> QueryError {
        let schema = schema();
        let query: FindQuery = serde_json::from_value(query).unwrap();
        build_find(&PostgresDialect, &schema, schema.model(model).unwrap(), &query).unwrap_err()
    }

    #[test]
    fn test_plain_find_selects_star() {
        let stmt = find(&PostgresDialect, "orders", json!({}));
        assert_eq!(stmt.sql, "SELECT \"orders\".* FROM \"orders\"");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_select_keeps_declaration_order() {
        let stmt = find(&MySqlDialect, "orders", json!({"select": ["total", "id"]}));
        assert_eq!(stmt.sql, "SELECT `orders`.`id`, `orders`.`total` FROM `orders`");
    }

    #[test]
    fn test_select_and_omit_are_complementary() {
        let schema = schema();
        let model = schema.model("orders").unwrap();
        let all: Vec<String> = model.field_names().map(str::to_string).collect();

        for mask in 1u32..(1 << all.len()) {
            let selected: Vec<String> = all
                .iter()
                .enumerate()
                .filter(|(i, _)| mask & (1 << i) != 0)
                .map(|(_, n)| n.clone())
                .collect();
            let omitted: Vec<String> = all
                .iter()
                .filter(|n| !selected.contains(n))
                .cloned()
                .collect();

            let by_select = FindQuery {
                select: Some(selected.clone()),
                ..Default::default()
            };
            let by_omit = FindQuery {
                omit: Some(omitted),
                ..Default::default()
            };
            assert_eq!(
                build_find(&PostgresDialect, &schema, model, &by_select).unwrap().sql,
                build_find(&PostgresDialect, &schema, model, &by_omit).unwrap().sql,
                "select {:?}",
                selected
            );
        }
    }

    #[test]
    fn test_select_and_omit_together_is_invalid() {
        assert!(matches!(
            find_err("orders", json!({"select": ["id"], "omit": ["total"]})),
            QueryError::Invalid(_)
        ));
        assert!(matches!(
            find_err("orders", json!({"select": ["nope"]})),
            QueryError::UnknownField { .. }
        ));
    }

    #[test]
    fn test_simple_join_projection() {
        let stmt = find(
            &PostgresDialect,
            "orders",
            json!({
                "select": ["id", "total"],
                "joins": [{
                    "as": "buyer",
                    "model": "customers",
                    "type": "simple",
                    "from": "customer",
                    "select": ["name"]
                }],
                "where": {"buyer.country": "PL"}
            }),
        );
        assert_eq!(
            stmt.sql,
            "SELECT \"orders\".\"id\", \"orders\".\"total\", \
             CASE WHEN \"buyer\".\"id\" IS NULL THEN NULL \
             ELSE json_build_object('name', \"buyer\".\"name\") END AS \"buyer\" \
             FROM \"orders\" LEFT JOIN \"customers\" AS \"buyer\" \
             ON \"buyer\".\"id\" = \"orders\".\"customer\" \
             WHERE \"buyer\".\"country\" = $1"
        );
        assert_eq!(stmt.params, vec![SqlValue::Text("PL".into())]);
        assert_eq!(stmt.json_columns, vec!["buyer".to_string()]);
    }

    #[test]
    fn test_join_alias_replaces_reference_field() {
        let stmt = find(
            &SqliteDialect,
            "orders",
            json!({
                "joins": [{
                    "as": "customer",
                    "model": "customers",
                    "type": "join",
                    "from": "customer"
                }]
            }),
        );
        assert!(stmt.sql.starts_with(
            "SELECT \"orders\".\"id\", \"orders\".\"status\", \"orders\".\"total\", CASE WHEN"
        ));
        assert!(!stmt.sql.contains("\"orders\".\"customer\","));
    }

    #[test]
    fn test_join_with_empty_projection_is_skipped() {
        let stmt = find(
            &PostgresDialect,
            "orders",
            json!({
                "joins": [{
                    "as": "buyer",
                    "model": "customers",
                    "type": "simple",
                    "from": "customer",
                    "omit": ["id", "name", "country"]
                }]
            }),
        );
        assert!(!stmt.sql.contains("CASE WHEN"));
        assert!(stmt.sql.contains("LEFT JOIN \"customers\" AS \"buyer\""));
        assert!(stmt.json_columns.is_empty());
    }

    #[test]
    fn test_complex_join_with_paging() {
        let stmt = find(
            &PostgresDialect,
            "orders",
            json!({
                "select": ["id"],
                "where": {"status": "paid"},
                "joins": [{
                    "as": "lines",
                    "model": "items",
                    "type": "complex",
                    "where": {"$expr": {"$eq": ["$order", "$orders.id"]}, "sku": {"$ne": "X"}},
                    "sort": [{"field": "position", "direction": "desc"}],
                    "limit": 5,
                    "select": ["sku"]
                }]
            }),
        );
        assert_eq!(
            stmt.sql,
            "SELECT \"orders\".\"id\", \
             (SELECT COALESCE(json_agg(json_build_object('sku', \"lines_rows\".\"sku\")), \
             '[]'::json) \
             FROM (SELECT \"lines\".* FROM \"items\" AS \"lines\" \
             WHERE (\"lines\".\"order\" = \"orders\".\"id\" AND \"lines\".\"sku\" <> $1) \
             ORDER BY \"lines\".\"position\" DESC LIMIT 5) AS \"lines_rows\") AS \"lines\" \
             FROM \"orders\" WHERE \"orders\".\"status\" = $2"
        );
        assert_eq!(
            stmt.params,
            vec![SqlValue::Text("X".into()), SqlValue::Text("paid".into())]
        );
    }

    #[test]
    fn test_complex_join_mysql_aggregation() {
        let stmt = find(
            &MySqlDialect,
            "orders",
            json!({"joins": [{"as": "lines", "model": "items", "type": "complex", "skip": 2}]}),
        );
        assert!(stmt.sql.contains("COALESCE(JSON_ARRAYAGG(JSON_OBJECT("));
        assert!(stmt.sql.contains("JSON_ARRAY())"));
        assert!(stmt.sql.contains("LIMIT 18446744073709551615 OFFSET 2"));
    }

    #[test]
    fn test_unknown_join_model() {
        assert_eq!(
            find_err(
                "orders",
                json!({"joins": [{"as": "x", "model": "ghosts", "type": "complex"}]})
            ),
            QueryError::UnknownModel("ghosts".into())
        );
    }

    #[test]
    fn test_sort_and_paging() {
        let stmt = find(
            &SqliteDialect,
            "orders",
            json!({
                "sort": [{"field": "total", "direction": "desc"}, {"field": "id"}],
                "skip": 20,
                "limit": 10
            }),
        );
        assert_eq!(
            stmt.sql,
            "SELECT \"orders\".* FROM \"orders\" \
             ORDER BY \"orders\".\"total\" DESC, \"orders\".\"id\" ASC LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn test_find_by_id_and_count() {
        let schema = schema();
        let model = schema.model("customers").unwrap();
        let stmt = build_find_by_id(&MySqlDialect, &schema, model, &json!(7), &FindQuery::default())
            .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT `customers`.* FROM `customers` WHERE `customers`.`id` = ? LIMIT 1"
        );
        assert_eq!(stmt.params, vec![SqlValue::Int(7)]);

        let query = FindQuery {
            filter: Some(Expr::field("country").eq(json!("PL"))),
            limit: Some(10),
            ..Default::default()
        };
        let stmt = build_count(&PostgresDialect, &schema, model, &query).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT COUNT(*) AS \"count\" FROM \"customers\" WHERE \"customers\".\"country\" = $1"
        );
    }

    #[test]
    fn test_search() {
        let schema = schema();
        let model = schema.model("customers").unwrap();
        let stmt =
            build_search(&PostgresDialect, &schema, model, "anna", &FindQuery::default()).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"customers\".* FROM \"customers\" WHERE to_tsvector('simple', concat_ws(' ', \
             \"customers\".\"name\", \"customers\".\"country\")) @@ plainto_tsquery('simple', $1)"
        );
    }

    #[test]
    fn test_geometry_is_read_as_text() {
        let places = Model::new("places").with_field("location", FieldKind::Geometry);
        let schema = Schema::new([places]);
        let stmt = build_find(
            &PostgresDialect,
            &schema,
            schema.model("places").unwrap(),
            &FindQuery::default(),
        )
        .unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"places\".\"id\", ST_AsText(\"places\".\"location\") AS \"location\" \
             FROM \"places\""
        );
    }
}
