// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! INSERT, UPDATE and DELETE statements.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::QueryError;
use super::dialect::SqlDialect;
use super::expr::Expr;
use super::model::{Field, FieldKind, Model};
use super::writer::{Scope, SqlWriter, Statement};

/// Update operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum UpdateOp {
    /// Assign a bound value.
    #[serde(rename = "$set")]
    Set,
    /// Add a numeric literal.
    #[serde(rename = "$inc")]
    Inc,
    /// Multiply by a numeric literal.
    #[serde(rename = "$mul")]
    Mul,
    /// Keep the larger of the current value and a numeric literal.
    #[serde(rename = "$max")]
    Max,
    /// Keep the smaller of the current value and a numeric literal.
    #[serde(rename = "$min")]
    Min,
}

/// One operator-based assignment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdate {
    /// Target field.
    pub field_name: String,
    /// Operator.
    pub op: UpdateOp,
    /// Operand.
    pub value: Value,
}

/// An update description.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpdateInstruction {
    /// Plain assignments.
    pub set: Map<String, Value>,
    /// Operator assignments.
    pub others: Vec<FieldUpdate>,
}

impl UpdateInstruction {
    /// Assignments from a plain field map.
    pub fn set(values: Map<String, Value>) -> Self {
        Self {
            set: values,
            others: Vec::new(),
        }
    }

    /// Append an operator assignment.
    pub fn with(mut self, field: &str, op: UpdateOp, value: Value) -> Self {
        self.others.push(FieldUpdate {
            field_name: field.to_string(),
            op,
            value,
        });
        self
    }
}

/// Rows targeted by an update or delete.
#[derive(Debug, Clone)]
pub enum RowTarget {
    /// One row by primary key.
    Id(Value),
    /// Rows matching a predicate; `None` targets every row.
    Filter(Option<Expr>),
}

fn write_target(
    w: &mut SqlWriter<'_>,
    model: &Model,
    target: &RowTarget,
    scope: &Scope<'_>,
) -> Result<(), QueryError> {
    match target {
        RowTarget::Id(id) => {
            let expr = Expr::field(model.id_field()).eq(id.clone());
            w.push_where(Some(&expr), scope)
        }
        RowTarget::Filter(filter) => w.push_where(filter.as_ref(), scope),
    }
}

/// Unqualified output columns of `model`, with geometry read as text.
pub(crate) fn returning_columns(dialect: &dyn SqlDialect, model: &Model) -> String {
    model
        .fields
        .iter()
        .map(|f| {
            let column = dialect.quote_ident(&f.name);
            if f.kind == FieldKind::Geometry {
                format!("{} AS {}", dialect.geometry_output(&column), column)
            } else {
                column
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_returning(w: &mut SqlWriter<'_>, model: &Model, returning: bool) {
    let dialect = w.dialect();
    if returning && dialect.supports_returning() {
        w.push(" RETURNING ").push(&returning_columns(dialect, model));
    }
}

fn numeric_literal(update: &FieldUpdate) -> Result<String, QueryError> {
    match &update.value {
        Value::Number(n) => Ok(n.to_string()),
        other => Err(QueryError::InvalidValue {
            field: update.field_name.clone(),
            reason: format!("{:?} needs a numeric operand, got {}", update.op, other),
        }),
    }
}

/// Compile an update.
///
/// Fields unknown to the model are skipped. Returns `None` when nothing is left to
/// assign.
pub fn build_update(
    dialect: &dyn SqlDialect,
    model: &Model,
    update: &UpdateInstruction,
    target: &RowTarget,
    returning: bool,
) -> Result<Option<Statement>, QueryError> {
    let mut seen = BTreeSet::new();
    for other in &update.others {
        if update.set.contains_key(&other.field_name) || !seen.insert(other.field_name.as_str()) {
            return Err(QueryError::ConflictingUpdate(other.field_name.clone()));
        }
    }

    let scope = Scope::table(dialect, model);
    let mut w = SqlWriter::new(dialect);
    w.push("UPDATE ").ident(model.table_name()).push(" SET ");

    let mut assigned = 0usize;
    let mut separator = |w: &mut SqlWriter<'_>| {
        if assigned > 0 {
            w.push(", ");
        }
        assigned += 1;
    };

    for field in &model.fields {
        if let Some(value) = update.set.get(&field.name) {
            separator(&mut w);
            w.ident(&field.name).push(" = ");
            w.push_field_value(field, value)?;
        }
    }

    for other in &update.others {
        let Some(field) = model.field(&other.field_name) else {
            tracing::debug!(
                model = %model.name,
                field = %other.field_name,
                "Skipping update of unknown field"
            );
            continue;
        };
        separator(&mut w);
        write_operator(&mut w, field, other)?;
    }

    if assigned == 0 {
        return Ok(None);
    }

    write_target(&mut w, model, target, &scope)?;
    push_returning(&mut w, model, returning);
    Ok(Some(w.finish()))
}

fn write_operator(
    w: &mut SqlWriter<'_>,
    field: &Field,
    update: &FieldUpdate,
) -> Result<(), QueryError> {
    let dialect = w.dialect();
    let column = dialect.quote_ident(&field.name);
    w.push(&column).push(" = ");
    match update.op {
        UpdateOp::Set => {
            w.push_field_value(field, &update.value)?;
        }
        UpdateOp::Inc => {
            let literal = numeric_literal(update)?;
            w.push(&format!("{} + {}", column, literal));
        }
        UpdateOp::Mul => {
            let literal = numeric_literal(update)?;
            w.push(&format!("{} * {}", column, literal));
        }
        UpdateOp::Max => {
            let literal = numeric_literal(update)?;
            w.push(&dialect.greatest(&column, &literal));
        }
        UpdateOp::Min => {
            let literal = numeric_literal(update)?;
            w.push(&dialect.least(&column, &literal));
        }
    }
    Ok(())
}

fn known_keys<'r>(model: &Model, row: &'r Map<String, Value>) -> BTreeSet<&'r str> {
    row.keys()
        .filter(|k| model.field(k).is_some())
        .map(String::as_str)
        .collect()
}

/// Compile a (multi-row) insert.
///
/// Columns come from the first row, in model declaration order; unknown keys are
/// ignored. Every other row must carry the same known keys. Returns `None` for an
/// empty batch.
pub fn build_insert(
    dialect: &dyn SqlDialect,
    model: &Model,
    rows: &[Map<String, Value>],
    returning: bool,
) -> Result<Option<Statement>, QueryError> {
    let Some(first) = rows.first() else {
        return Ok(None);
    };

    let keys = known_keys(model, first);
    for (index, row) in rows.iter().enumerate().skip(1) {
        if known_keys(model, row) != keys {
            return Err(QueryError::HeterogeneousBatch { row: index });
        }
    }

    if let Some(missing) = model
        .fields
        .iter()
        .find(|f| f.required && !keys.contains(f.name.as_str()))
    {
        return Err(QueryError::InvalidValue {
            field: missing.name.clone(),
            reason: "required field is missing".to_string(),
        });
    }

    let columns: Vec<&Field> = model
        .fields
        .iter()
        .filter(|f| keys.contains(f.name.as_str()))
        .collect();
    if columns.is_empty() {
        return Err(QueryError::Invalid(format!(
            "insert into '{}' has no known fields",
            model.name
        )));
    }

    let mut w = SqlWriter::new(dialect);
    w.push("INSERT INTO ").ident(model.table_name()).push(" (");
    for (i, field) in columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.ident(&field.name);
    }
    w.push(") VALUES ");

    for (r, row) in rows.iter().enumerate() {
        w.push(if r == 0 { "(" } else { ", (" });
        for (i, field) in columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            let value = row.get(&field.name).unwrap_or(&Value::Null);
            w.push_field_value(field, value)?;
        }
        w.push(")");
    }

    push_returning(&mut w, model, returning);
    Ok(Some(w.finish()))
}

/// Compile a delete.
pub fn build_delete(
    dialect: &dyn SqlDialect,
    model: &Model,
    target: &RowTarget,
    returning: bool,
) -> Result<Statement, QueryError> {
    let scope = Scope::table(dialect, model);
    let mut w = SqlWriter::new(dialect);
    w.push("DELETE FROM ").ident(model.table_name());
    write_target(&mut w, model, target, &scope)?;
    push_returning(&mut w, model, returning);
    Ok(w.finish())
}
