// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Grouping and aggregation queries.
//!
//! `having` is written against output aliases. Before rendering, the predicate tree is
//! rewritten: every reference to a computation alias is replaced by that computation's
//! aggregate node, and references to group fields stay field references. Anything
//! else is an [`QueryError::UnknownAlias`].

use serde::Deserialize;

use super::QueryError;
use super::dialect::SqlDialect;
use super::expr::{Aggregate, Expr, FieldRef};
use super::model::{Model, Schema};
use super::select::{Join, JoinKind, Sort};
use super::writer::{Scope, ScopeEntry, SqlWriter, Statement};

/// An aggregate bound to an output alias.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Computation {
    /// Output alias.
    #[serde(rename = "as")]
    pub alias: String,
    /// Aggregate to compute.
    #[serde(rename = "compute")]
    pub aggregate: Aggregate,
}

impl Computation {
    /// Bind `aggregate` to `alias`.
    pub fn new(alias: impl Into<String>, aggregate: Aggregate) -> Self {
        Self {
            alias: alias.into(),
            aggregate,
        }
    }
}

/// An aggregation query description.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateQuery {
    /// Row predicate applied before grouping.
    #[serde(rename = "where")]
    pub filter: Option<Expr>,
    /// Simple joins usable in the filter and group keys.
    pub joins: Vec<Join>,
    /// Group keys (`field` or `alias.field`).
    pub group_by: Vec<String>,
    /// Computed columns.
    pub computations: Vec<Computation>,
    /// Group predicate over aliases.
    pub having: Option<Expr>,
    /// Sort keys over aliases.
    pub sort: Vec<Sort>,
    /// Groups to skip.
    pub skip: Option<u64>,
    /// Maximum groups.
    pub limit: Option<u64>,
    /// Read from a replica when one is available.
    pub use_read_replica: bool,
}

impl AggregateQuery {
    fn check_aliases(&self) -> Result<(), QueryError> {
        if self.group_by.is_empty() && self.computations.is_empty() {
            return Err(QueryError::Invalid(
                "aggregation needs groupBy or computations".to_string(),
            ));
        }
        let mut seen: Vec<&str> = self.group_by.iter().map(String::as_str).collect();
        for computation in &self.computations {
            if seen.contains(&computation.alias.as_str()) {
                return Err(QueryError::DuplicateAlias(computation.alias.clone()));
            }
            seen.push(&computation.alias);
        }
        Ok(())
    }

    fn computation(&self, alias: &str) -> Option<&Computation> {
        self.computations.iter().find(|c| c.alias == alias)
    }

    fn is_alias(&self, name: &str) -> bool {
        self.group_by.iter().any(|g| g == name) || self.computation(name).is_some()
    }

    /// Rewrite `having` so computation aliases become aggregate nodes.
    pub fn resolved_having(&self) -> Result<Option<Expr>, QueryError> {
        let Some(having) = self.having.clone() else {
            return Ok(None);
        };
        having
            .try_map_fields(&mut |field: FieldRef| {
                let path = field.to_string();
                if field.scope.is_none() {
                    if let Some(computation) = self.computation(&field.name) {
                        return Ok(Expr::Aggregate(Box::new(computation.aggregate.clone())));
                    }
                }
                if self.group_by.contains(&path) {
                    Ok(Expr::Field(field))
                } else {
                    Err(QueryError::UnknownAlias(path))
                }
            })
            .map(Some)
    }
}

/// Compile an aggregation query.
pub fn build_aggregate(
    dialect: &dyn SqlDialect,
    schema: &Schema,
    model: &Model,
    query: &AggregateQuery,
) -> Result<Statement, QueryError> {
    query.check_aliases()?;

    let mut scope = Scope::table(dialect, model);
    for join in &query.joins {
        let JoinKind::Simple { .. } = join.kind else {
            return Err(QueryError::Invalid(format!(
                "join '{}' must be simple to be used in an aggregation",
                join.alias
            )));
        };
        let joined = schema
            .model(&join.model)
            .ok_or_else(|| QueryError::UnknownModel(join.model.clone()))?;
        scope = scope.with(ScopeEntry {
            name: join.alias.clone(),
            qualifier: dialect.quote_ident(&join.alias),
            model: joined,
        });
    }

    let having = query.resolved_having()?;
    for key in &query.sort {
        if !query.is_alias(&key.field) {
            return Err(QueryError::UnknownAlias(key.field.clone()));
        }
    }

    let mut w = SqlWriter::new(dialect);
    w.push("SELECT ");
    let mut first = true;
    for group in &query.group_by {
        let column = scope.resolve(dialect, &FieldRef::parse(group))?;
        if !first {
            w.push(", ");
        }
        first = false;
        w.push(&column.sql).push(" AS ").ident(group);
    }
    for computation in &query.computations {
        if !first {
            w.push(", ");
        }
        first = false;
        w.push_aggregate(&computation.aggregate, &scope)?;
        w.push(" AS ").ident(&computation.alias);
    }

    w.push(" FROM ").ident(model.table_name());
    for join in &query.joins {
        if let JoinKind::Simple { from, to } = &join.kind {
            let alias_q = dialect.quote_ident(&join.alias);
            let target = scope
                .resolve(dialect, &FieldRef {
                    scope: Some(join.alias.clone()),
                    name: to.clone(),
                })?
                .sql;
            let source = scope.resolve(dialect, &FieldRef::parse(from))?.sql;
            let table = schema
                .model(&join.model)
                .map(|m| m.table_name())
                .unwrap_or(&join.model);
            w.push(" LEFT JOIN ")
                .ident(table)
                .push(" AS ")
                .push(&alias_q)
                .push(" ON ")
                .push(&target)
                .push(" = ")
                .push(&source);
        }
    }

    w.push_where(query.filter.as_ref(), &scope)?;

    if !query.group_by.is_empty() {
        w.push(" GROUP BY ");
        for (i, group) in query.group_by.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            let column = scope.resolve(dialect, &FieldRef::parse(group))?;
            w.push(&column.sql);
        }
    }

    if let Some(having) = &having {
        w.push(" HAVING ");
        w.push_expr(having, &scope)?;
    }

    for (i, key) in query.sort.iter().enumerate() {
        w.push(if i == 0 { " ORDER BY " } else { ", " })
            .ident(&key.field)
            .push(match key.direction {
                super::select::SortDirection::Asc => " ASC",
                super::select::SortDirection::Desc => " DESC",
            });
    }
    w.push(&dialect.limit_offset(query.limit, query.skip));

    Ok(w.finish())
}
