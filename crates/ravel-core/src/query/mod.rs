// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cross-dialect relational query builder.
//!
//! Query descriptions (projection, predicate trees, joins, grouping, aggregation,
//! sorting, pagination and updates) compile to a [`Statement`]: SQL text plus the
//! values bound to its placeholders, in placeholder order. Identifiers come from
//! [`model::Model`] metadata only. Values supplied by callers are always bound.
//!
//! Three dialects are supported through [`dialect::SqlDialect`]: PostgreSQL, MySQL
//! and SQLite.

pub mod aggregate;
pub mod dialect;
pub mod expr;
pub mod model;
pub mod mutation;
pub mod select;
pub mod value;
pub mod writer;

use thiserror::Error;

pub use aggregate::{AggregateQuery, Computation, build_aggregate};
pub use dialect::{Dialect, SqlDialect};
pub use expr::{Aggregate, Expr, FieldRef};
pub use model::{Field, FieldKind, Model, Schema};
pub use mutation::{
    FieldUpdate, RowTarget, UpdateInstruction, UpdateOp, build_delete, build_insert, build_update,
};
pub use select::{
    FindQuery, Join, JoinKind, Sort, SortDirection, build_count, build_find, build_find_by_id,
    build_search,
};
pub use value::SqlValue;
pub use writer::Statement;

/// Errors raised while compiling a query description.
///
/// All of them are caller errors detected before any SQL reaches a database.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum QueryError {
    /// A field name is not declared on the model.
    #[error("unknown field '{field}' on model '{model}'")]
    UnknownField {
        /// Model name.
        model: String,
        /// Field name as supplied.
        field: String,
    },

    /// An alias in `having` or `sort` is neither a group field nor a computation.
    #[error("unknown alias '{0}'")]
    UnknownAlias(String),

    /// A join refers to a model missing from the schema.
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    /// A value cannot be stored in the target field.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The same field is updated by both `set` and `others`.
    #[error("field '{0}' appears in both set and others")]
    ConflictingUpdate(String),

    /// A bulk insert row does not have the same fields as the first row.
    #[error("row {row} of the batch has a different set of fields than the first row")]
    HeterogeneousBatch {
        /// Zero based index of the offending row.
        row: usize,
    },

    /// A computation alias is declared twice or shadows a group field.
    #[error("duplicate alias '{0}'")]
    DuplicateAlias(String),

    /// The description is malformed.
    #[error("invalid query: {0}")]
    Invalid(String),
}

impl QueryError {
    /// Stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownField { .. } => "unknownField",
            Self::UnknownAlias(_) => "unknownAlias",
            Self::UnknownModel(_) => "unknownModel",
            Self::InvalidValue { .. } => "invalidValue",
            Self::ConflictingUpdate(_) => "conflictingUpdate",
            Self::HeterogeneousBatch { .. } => "heterogeneousBatch",
            Self::DuplicateAlias(_) => "duplicateAlias",
            Self::Invalid(_) => "invalidQuery",
        }
    }

    pub(crate) fn unknown_field(model: &Model, field: &str) -> Self {
        Self::UnknownField {
            model: model.name.clone(),
            field: field.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(QueryError::UnknownAlias("x".into()).error_code(), "unknownAlias");
        assert_eq!(
            QueryError::HeterogeneousBatch { row: 2 }.error_code(),
            "heterogeneousBatch"
        );
        assert_eq!(
            QueryError::ConflictingUpdate("price".into()).to_string(),
            "field 'price' appears in both set and others"
        );
    }
}
