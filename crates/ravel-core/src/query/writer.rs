// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL text accumulation and expression rendering.

use serde_json::Value;

use super::QueryError;
use super::dialect::SqlDialect;
use super::expr::{Aggregate, Expr, FieldRef, Function, LogicalOp};
use super::model::{Field, FieldKind, Model};
use super::value::SqlValue;

/// A compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// SQL text with dialect placeholders.
    pub sql: String,
    /// Values for the placeholders, in placeholder order.
    pub params: Vec<SqlValue>,
    /// Result columns holding JSON documents built by the query (join projections).
    pub json_columns: Vec<String>,
}

impl Statement {
    /// A statement without parameters, e.g. DDL issued by embedders and tests.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            json_columns: Vec::new(),
        }
    }
}

/// One table visible to an expression.
#[derive(Debug, Clone)]
pub(crate) struct ScopeEntry<'m> {
    /// Name used in `scope.field` references.
    pub name: String,
    /// SQL qualifier (quoted table name or alias).
    pub qualifier: String,
    pub model: &'m Model,
}

/// Tables visible to an expression. Unqualified fields resolve to `default`.
#[derive(Debug, Clone)]
pub(crate) struct Scope<'m> {
    pub default: ScopeEntry<'m>,
    pub named: Vec<ScopeEntry<'m>>,
}

/// A resolved column.
pub(crate) struct Column<'m> {
    pub sql: String,
    pub field: &'m Field,
}

impl<'m> Scope<'m> {
    /// Scope of a single table addressed by its own name.
    pub fn table(dialect: &dyn SqlDialect, model: &'m Model) -> Self {
        let entry = ScopeEntry {
            name: model.name.clone(),
            qualifier: dialect.quote_ident(model.table_name()),
            model,
        };
        Self {
            default: entry.clone(),
            named: vec![entry],
        }
    }

    pub fn with(mut self, entry: ScopeEntry<'m>) -> Self {
        self.named.push(entry);
        self
    }

    pub fn resolve(
        &self,
        dialect: &dyn SqlDialect,
        field: &FieldRef,
    ) -> Result<Column<'m>, QueryError> {
        let entry = match &field.scope {
            None => &self.default,
            Some(scope) => self
                .named
                .iter()
                .find(|e| &e.name == scope)
                .ok_or_else(|| QueryError::UnknownField {
                    model: self.default.model.name.clone(),
                    field: field.to_string(),
                })?,
        };
        let meta = entry
            .model
            .field(&field.name)
            .ok_or_else(|| QueryError::unknown_field(entry.model, &field.name))?;
        Ok(Column {
            sql: format!("{}.{}", entry.qualifier, dialect.quote_ident(&meta.name)),
            field: meta,
        })
    }
}

/// Appends SQL text and binds values in textual order.
pub(crate) struct SqlWriter<'d> {
    dialect: &'d dyn SqlDialect,
    sql: String,
    params: Vec<SqlValue>,
    json_columns: Vec<String>,
}

impl<'d> SqlWriter<'d> {
    pub fn new(dialect: &'d dyn SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::with_capacity(256),
            params: Vec::new(),
            json_columns: Vec::new(),
        }
    }

    pub fn dialect(&self) -> &'d dyn SqlDialect {
        self.dialect
    }

    pub fn push(&mut self, sql: &str) -> &mut Self {
        self.sql.push_str(sql);
        self
    }

    pub fn ident(&mut self, ident: &str) -> &mut Self {
        let quoted = self.dialect.quote_ident(ident);
        self.sql.push_str(&quoted);
        self
    }

    /// Record a value and return its placeholder without writing it.
    pub fn bind(&mut self, value: SqlValue) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    /// Bind a value and write its placeholder. NULL is written inline so it takes the
    /// column's type instead of the parameter's.
    pub fn push_bind(&mut self, value: SqlValue) -> &mut Self {
        if value.is_null() {
            self.sql.push_str("NULL");
            return self;
        }
        let placeholder = self.bind(value);
        self.sql.push_str(&placeholder);
        self
    }

    /// Bind a value for `field`, wrapping geometry input.
    pub fn push_field_value(
        &mut self,
        field: &Field,
        value: &Value,
    ) -> Result<&mut Self, QueryError> {
        let bound = SqlValue::for_field(field, value)?;
        if bound.is_null() {
            self.sql.push_str("NULL");
            return Ok(self);
        }
        let placeholder = self.bind(bound);
        if field.kind == FieldKind::Geometry {
            let wrapped = self.dialect.geometry_input(&placeholder);
            self.sql.push_str(&wrapped);
        } else {
            self.sql.push_str(&placeholder);
        }
        Ok(self)
    }

    pub fn mark_json_column(&mut self, alias: &str) {
        self.json_columns.push(alias.to_string());
    }

    /// Run `f` and return the text it wrote, removing it from the buffer.
    ///
    /// Values bound inside `f` stay bound, so the captured text must be written back
    /// before anything else binds.
    pub fn capture<F>(&mut self, f: F) -> Result<String, QueryError>
    where
        F: FnOnce(&mut Self) -> Result<(), QueryError>,
    {
        let start = self.sql.len();
        f(self)?;
        Ok(self.sql.split_off(start))
    }

    pub fn finish(self) -> Statement {
        Statement {
            sql: self.sql,
            params: self.params,
            json_columns: self.json_columns,
        }
    }

    /// Write ` WHERE <expr>` if a predicate is present.
    pub fn push_where(
        &mut self,
        filter: Option<&Expr>,
        scope: &Scope<'_>,
    ) -> Result<(), QueryError> {
        if let Some(filter) = filter {
            self.push(" WHERE ");
            self.push_expr(filter, scope)?;
        }
        Ok(())
    }

    pub fn push_expr(&mut self, expr: &Expr, scope: &Scope<'_>) -> Result<(), QueryError> {
        match expr {
            Expr::Field(field) => {
                let column = scope.resolve(self.dialect, field)?;
                self.push(&column.sql);
            }
            Expr::Value(value) => {
                self.push_bind(SqlValue::from_untyped(value));
            }
            Expr::Aggregate(aggregate) => self.push_aggregate(aggregate, scope)?,
            Expr::Compare { op, left, right } => {
                let hint = field_hint(self.dialect, scope, left, right)?;
                self.push_operand(left, hint, scope)?;
                self.push(" ").push(op.as_sql()).push(" ");
                self.push_operand(right, hint, scope)?;
            }
            Expr::Logical { op, operands } if operands.is_empty() => {
                self.push(if *op == LogicalOp::And { "1 = 1" } else { "1 = 0" });
            }
            Expr::Logical { op, operands } => {
                let sep = if *op == LogicalOp::And { " AND " } else { " OR " };
                self.push("(");
                for (i, operand) in operands.iter().enumerate() {
                    if i > 0 {
                        self.push(sep);
                    }
                    self.push_expr(operand, scope)?;
                }
                self.push(")");
            }
            Expr::Not(inner) => {
                self.push("NOT (");
                self.push_expr(inner, scope)?;
                self.push(")");
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // IN () is not valid SQL
                    self.push(if *negated { "1 = 1" } else { "1 = 0" });
                    return Ok(());
                }
                let hint = field_hint(self.dialect, scope, expr, expr)?;
                self.push_expr(expr, scope)?;
                self.push(if *negated { " NOT IN (" } else { " IN (" });
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        self.push(", ");
                    }
                    self.push_typed_value(value, hint)?;
                }
                self.push(")");
            }
            Expr::IsNull { expr, negated } => {
                self.push_expr(expr, scope)?;
                self.push(if *negated { " IS NOT NULL" } else { " IS NULL" });
            }
            Expr::Like {
                expr,
                pattern,
                case_insensitive,
            } => {
                let subject = self.capture(|w| w.push_expr(expr, scope))?;
                let placeholder = self.bind(SqlValue::Text(pattern.clone()));
                let sql = self.dialect.like(&subject, &placeholder, *case_insensitive);
                self.push(&sql);
            }
            Expr::Regex {
                expr,
                pattern,
                case_insensitive,
            } => {
                let subject = self.capture(|w| w.push_expr(expr, scope))?;
                let placeholder = self.bind(SqlValue::Text(pattern.clone()));
                let sql = self.dialect.regex(&subject, &placeholder, *case_insensitive)?;
                self.push(&sql);
            }
            Expr::Arithmetic { op, left, right } => {
                self.push("(");
                self.push_expr(left, scope)?;
                self.push(" ").push(op.as_sql()).push(" ");
                self.push_expr(right, scope)?;
                self.push(")");
            }
            Expr::Function { func, args } => self.push_function(*func, args, scope)?,
            Expr::TextSearch { fields, query } => {
                let columns = if fields.is_empty() {
                    let model = scope.default.model;
                    let qualifier = &scope.default.qualifier;
                    model
                        .fields
                        .iter()
                        .filter(|f| f.is_searchable())
                        .map(|f| format!("{}.{}", qualifier, self.dialect.quote_ident(&f.name)))
                        .collect::<Vec<_>>()
                } else {
                    fields
                        .iter()
                        .map(|f| scope.resolve(self.dialect, f).map(|c| c.sql))
                        .collect::<Result<Vec<_>, _>>()?
                };
                if columns.is_empty() {
                    return Err(QueryError::Invalid(format!(
                        "model '{}' has no searchable fields",
                        scope.default.model.name
                    )));
                }
                let dialect = self.dialect;
                let sql = dialect.text_search(&columns, query, &mut |value| self.bind(value));
                self.push(&sql);
            }
        }
        Ok(())
    }

    /// Write an operand of a comparison, typing literals after the sibling field.
    fn push_operand(
        &mut self,
        expr: &Expr,
        hint: Option<&Field>,
        scope: &Scope<'_>,
    ) -> Result<(), QueryError> {
        match expr {
            Expr::Value(value) => self.push_typed_value(value, hint),
            other => self.push_expr(other, scope),
        }
    }

    fn push_typed_value(&mut self, value: &Value, hint: Option<&Field>) -> Result<(), QueryError> {
        match hint {
            Some(field) => {
                self.push_field_value(field, value)?;
            }
            None => {
                self.push_bind(SqlValue::from_untyped(value));
            }
        }
        Ok(())
    }

    pub fn push_aggregate(
        &mut self,
        aggregate: &Aggregate,
        scope: &Scope<'_>,
    ) -> Result<(), QueryError> {
        match aggregate {
            Aggregate::Count => {
                self.push("COUNT(*)");
            }
            Aggregate::CountIf(condition) => {
                let inner = self.capture(|w| w.push_expr(condition, scope))?;
                let sql = self.dialect.count_if(&inner);
                self.push(&sql);
            }
            Aggregate::Sum(arg)
            | Aggregate::Avg(arg)
            | Aggregate::Min(arg)
            | Aggregate::Max(arg) => {
                self.push(aggregate.name()).push("(");
                self.push_expr(arg, scope)?;
                self.push(")");
            }
        }
        Ok(())
    }

    fn push_function(
        &mut self,
        func: Function,
        args: &[Expr],
        scope: &Scope<'_>,
    ) -> Result<(), QueryError> {
        let mut rendered = Vec::with_capacity(args.len());
        let first = args
            .first()
            .ok_or_else(|| QueryError::Invalid(format!("{} needs an argument", func.name())))?;

        let sql = match func {
            Function::Concat => {
                for arg in args {
                    rendered.push(self.capture(|w| w.push_expr(arg, scope))?);
                }
                self.dialect.concat(&rendered)
            }
            Function::Length => {
                let inner = self.capture(|w| w.push_expr(first, scope))?;
                self.dialect.char_length(&inner)
            }
            Function::Round => {
                let places = match args.get(1) {
                    None => 0,
                    Some(Expr::Value(v)) => v
                        .as_u64()
                        .and_then(|p| u32::try_from(p).ok())
                        .ok_or_else(|| {
                            let message = "round places must be a non-negative integer";
                            QueryError::Invalid(message.to_string())
                        })?,
                    Some(_) => {
                        return Err(QueryError::Invalid(
                            "round places must be a literal".to_string(),
                        ));
                    }
                };
                let inner = self.capture(|w| w.push_expr(first, scope))?;
                self.dialect.round(&inner, places)
            }
            Function::Lower | Function::Upper | Function::Trim | Function::Abs => {
                let inner = self.capture(|w| w.push_expr(first, scope))?;
                format!("{}({})", func.name(), inner)
            }
        };
        self.push(&sql);
        Ok(())
    }
}

/// Field metadata of whichever comparison side is a plain field.
fn field_hint<'m>(
    dialect: &dyn SqlDialect,
    scope: &Scope<'m>,
    left: &Expr,
    right: &Expr,
) -> Result<Option<&'m Field>, QueryError> {
    for side in [left, right] {
        if let Expr::Field(r) = side {
            return Ok(Some(scope.resolve(dialect, r)?.field));
        }
    }
    Ok(None)
}
