// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQL dialects.
//!
//! A dialect only produces text. Placeholder numbering and parameter order are owned
//! by [`super::writer::SqlWriter`], which asks the dialect how to spell each piece.

use std::fmt;

use super::QueryError;
use super::value::SqlValue;

/// SQL text generation that differs between database engines.
pub trait SqlDialect: Send + Sync + fmt::Debug {
    /// Dialect name for logs.
    fn name(&self) -> &'static str;

    /// Quote an identifier.
    fn quote_ident(&self, ident: &str) -> String;

    /// Placeholder for the `index`-th bound value (1-based).
    fn placeholder(&self, index: usize) -> String;

    /// Build a JSON object from `(key, expression)` pairs.
    fn json_object(&self, pairs: &[(String, String)]) -> String {
        let args = pairs
            .iter()
            .map(|(key, expr)| format!("{}, {}", self.string_literal(key), expr))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.json_object_fn(), args)
    }

    /// Name of the JSON object constructor.
    fn json_object_fn(&self) -> &'static str;

    /// Aggregate expressions into a JSON array.
    fn json_array_agg(&self, expr: &str) -> String;

    /// An empty JSON array literal.
    fn empty_json_array(&self) -> &'static str;

    /// LIMIT/OFFSET clause with a leading space, or an empty string.
    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut out = String::new();
        if let Some(limit) = limit {
            out.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = offset.filter(|o| *o > 0) {
            out.push_str(&format!(" OFFSET {}", offset));
        }
        out
    }

    /// Whether `INSERT/UPDATE/DELETE ... RETURNING` is available.
    fn supports_returning(&self) -> bool;

    /// Wrap a bound WKT value for a geometry column.
    fn geometry_input(&self, placeholder: &str) -> String {
        format!("ST_GeomFromText({}, 4326)", placeholder)
    }

    /// Read a geometry column as WKT.
    fn geometry_output(&self, column: &str) -> String {
        format!("ST_AsText({})", column)
    }

    /// Pattern match.
    fn like(&self, expr: &str, pattern: &str, case_insensitive: bool) -> String {
        if case_insensitive {
            format!("LOWER({}) LIKE LOWER({}){}", expr, pattern, self.like_escape())
        } else {
            format!("{} LIKE {}{}", expr, pattern, self.like_escape())
        }
    }

    /// Escape clause appended to LIKE so `\` escapes wildcards.
    fn like_escape(&self) -> &'static str {
        ""
    }

    /// Regular expression match.
    fn regex(
        &self,
        expr: &str,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<String, QueryError>;

    /// String concatenation.
    fn concat(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    /// Larger of two scalars.
    fn greatest(&self, left: &str, right: &str) -> String {
        format!("GREATEST({}, {})", left, right)
    }

    /// Smaller of two scalars.
    fn least(&self, left: &str, right: &str) -> String {
        format!("LEAST({}, {})", left, right)
    }

    /// Character length of a string.
    fn char_length(&self, expr: &str) -> String {
        format!("LENGTH({})", expr)
    }

    /// Round a number to `places` decimals.
    fn round(&self, expr: &str, places: u32) -> String {
        format!("ROUND({}, {})", expr, places)
    }

    /// Count rows matching a condition inside an aggregation.
    fn count_if(&self, condition: &str) -> String;

    /// Full-text search over `columns`, binding values through `bind`.
    fn text_search(
        &self,
        columns: &[String],
        text: &str,
        bind: &mut dyn FnMut(SqlValue) -> String,
    ) -> String;

    /// Quote a string literal. Only used for trusted metadata such as JSON keys.
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }
}

/// PostgreSQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn json_object_fn(&self) -> &'static str {
        "json_build_object"
    }

    fn json_array_agg(&self, expr: &str) -> String {
        format!("json_agg({})", expr)
    }

    fn empty_json_array(&self) -> &'static str {
        "'[]'::json"
    }

    fn supports_returning(&self) -> bool {
        true
    }

    fn like(&self, expr: &str, pattern: &str, case_insensitive: bool) -> String {
        let op = if case_insensitive { "ILIKE" } else { "LIKE" };
        format!("{} {} {}", expr, op, pattern)
    }

    fn regex(
        &self,
        expr: &str,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<String, QueryError> {
        let op = if case_insensitive { "~*" } else { "~" };
        Ok(format!("{} {} {}", expr, op, pattern))
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("({})", parts.join(" || "))
    }

    fn round(&self, expr: &str, places: u32) -> String {
        format!("ROUND(CAST({} AS numeric), {})", expr, places)
    }

    fn count_if(&self, condition: &str) -> String {
        format!("COUNT(*) FILTER (WHERE {})", condition)
    }

    fn text_search(
        &self,
        columns: &[String],
        text: &str,
        bind: &mut dyn FnMut(SqlValue) -> String,
    ) -> String {
        let placeholder = bind(SqlValue::Text(text.to_string()));
        format!(
            "to_tsvector('simple', concat_ws(' ', {})) @@ plainto_tsquery('simple', {})",
            columns.join(", "),
            placeholder
        )
    }
}

/// MySQL 8.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl SqlDialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn json_object_fn(&self) -> &'static str {
        "JSON_OBJECT"
    }

    fn json_array_agg(&self, expr: &str) -> String {
        format!("JSON_ARRAYAGG({})", expr)
    }

    fn empty_json_array(&self) -> &'static str {
        "JSON_ARRAY()"
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset.filter(|o| *o > 0)) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            // MySQL has no OFFSET without LIMIT
            (None, Some(offset)) => format!(" LIMIT 18446744073709551615 OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }

    fn supports_returning(&self) -> bool {
        false
    }

    fn regex(
        &self,
        expr: &str,
        pattern: &str,
        case_insensitive: bool,
    ) -> Result<String, QueryError> {
        let mode = if case_insensitive { "i" } else { "c" };
        Ok(format!("REGEXP_LIKE({}, {}, '{}')", expr, pattern, mode))
    }

    fn char_length(&self, expr: &str) -> String {
        format!("CHAR_LENGTH({})", expr)
    }

    fn count_if(&self, condition: &str) -> String {
        format!("SUM(CASE WHEN {} THEN 1 ELSE 0 END)", condition)
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn text_search(
        &self,
        columns: &[String],
        text: &str,
        bind: &mut dyn FnMut(SqlValue) -> String,
    ) -> String {
        let placeholder = bind(SqlValue::Text(text.to_string()));
        format!(
            "MATCH ({}) AGAINST ({} IN NATURAL LANGUAGE MODE)",
            columns.join(", "),
            placeholder
        )
    }
}

/// SQLite 3 with the JSON1 functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn json_object_fn(&self) -> &'static str {
        "json_object"
    }

    fn json_array_agg(&self, expr: &str) -> String {
        format!("json_group_array({})", expr)
    }

    fn empty_json_array(&self) -> &'static str {
        "json_array()"
    }

    fn limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        match (limit, offset.filter(|o| *o > 0)) {
            (Some(limit), Some(offset)) => format!(" LIMIT {} OFFSET {}", limit, offset),
            (Some(limit), None) => format!(" LIMIT {}", limit),
            (None, Some(offset)) => format!(" LIMIT -1 OFFSET {}", offset),
            (None, None) => String::new(),
        }
    }

    fn supports_returning(&self) -> bool {
        true
    }

    // Points are stored as WKT text.
    fn geometry_input(&self, placeholder: &str) -> String {
        placeholder.to_string()
    }

    fn geometry_output(&self, column: &str) -> String {
        column.to_string()
    }

    fn like_escape(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    fn regex(
        &self,
        _expr: &str,
        _pattern: &str,
        _case_insensitive: bool,
    ) -> Result<String, QueryError> {
        Err(QueryError::Invalid(
            "regular expressions are not supported on SQLite".to_string(),
        ))
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("({})", parts.join(" || "))
    }

    fn greatest(&self, left: &str, right: &str) -> String {
        format!("MAX({}, {})", left, right)
    }

    fn least(&self, left: &str, right: &str) -> String {
        format!("MIN({}, {})", left, right)
    }

    fn count_if(&self, condition: &str) -> String {
        format!("COUNT(CASE WHEN {} THEN 1 END)", condition)
    }

    fn text_search(
        &self,
        columns: &[String],
        text: &str,
        bind: &mut dyn FnMut(SqlValue) -> String,
    ) -> String {
        let pattern = format!("%{}%", escape_like(text));
        let parts = columns
            .iter()
            .map(|column| {
                let placeholder = bind(SqlValue::Text(pattern.clone()));
                format!("{} LIKE {} ESCAPE '\\'", column, placeholder)
            })
            .collect::<Vec<_>>();
        format!("({})", parts.join(" OR "))
    }
}

/// Escape LIKE wildcards with a backslash.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// The supported dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// PostgreSQL.
    Postgres,
    /// MySQL.
    MySql,
    /// SQLite.
    Sqlite,
}

impl Dialect {
    /// Text generator for this dialect.
    pub fn sql(&self) -> &'static dyn SqlDialect {
        match self {
            Self::Postgres => &PostgresDialect,
            Self::MySql => &MySqlDialect,
            Self::Sqlite => &SqliteDialect,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql().name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting_and_placeholders() {
        assert_eq!(PostgresDialect.quote_ident("order"), "\"order\"");
        assert_eq!(MySqlDialect.quote_ident("order"), "`order`");
        assert_eq!(MySqlDialect.quote_ident("a`b"), "`a``b`");
        assert_eq!(PostgresDialect.placeholder(3), "$3");
        assert_eq!(MySqlDialect.placeholder(3), "?");
        assert_eq!(SqliteDialect.placeholder(3), "?");
    }

    #[test]
    fn test_limit_offset() {
        assert_eq!(PostgresDialect.limit_offset(Some(10), Some(20)), " LIMIT 10 OFFSET 20");
        assert_eq!(PostgresDialect.limit_offset(None, Some(5)), " OFFSET 5");
        assert_eq!(
            MySqlDialect.limit_offset(None, Some(5)),
            " LIMIT 18446744073709551615 OFFSET 5"
        );
        assert_eq!(SqliteDialect.limit_offset(None, Some(5)), " LIMIT -1 OFFSET 5");
        assert_eq!(SqliteDialect.limit_offset(Some(1), Some(0)), " LIMIT 1");
        assert_eq!(MySqlDialect.limit_offset(None, None), "");
    }

    #[test]
    fn test_predicates_differ() {
        assert_eq!(PostgresDialect.like("a", "$1", true), "a ILIKE $1");
        assert_eq!(MySqlDialect.like("a", "?", true), "LOWER(a) LIKE LOWER(?)");
        assert_eq!(PostgresDialect.regex("a", "$1", false).unwrap(), "a ~ $1");
        assert_eq!(
            MySqlDialect.regex("a", "?", true).unwrap(),
            "REGEXP_LIKE(a, ?, 'i')"
        );
        assert!(SqliteDialect.regex("a", "?", false).is_err());
        assert_eq!(
            PostgresDialect.concat(&["a".into(), "b".into()]),
            "(a || b)"
        );
        assert_eq!(MySqlDialect.concat(&["a".into(), "b".into()]), "CONCAT(a, b)");
    }

    #[test]
    fn test_count_if() {
        assert_eq!(PostgresDialect.count_if("x > 1"), "COUNT(*) FILTER (WHERE x > 1)");
        assert_eq!(
            MySqlDialect.count_if("x > 1"),
            "SUM(CASE WHEN x > 1 THEN 1 ELSE 0 END)"
        );
        assert_eq!(SqliteDialect.count_if("x > 1"), "COUNT(CASE WHEN x > 1 THEN 1 END)");
    }

    #[test]
    fn test_json_object() {
        let pairs = vec![("id".to_string(), "c.id".to_string())];
        assert_eq!(PostgresDialect.json_object(&pairs), "json_build_object('id', c.id)");
        assert_eq!(MySqlDialect.json_object(&pairs), "JSON_OBJECT('id', c.id)");
        assert_eq!(SqliteDialect.json_object(&pairs), "json_object('id', c.id)");
    }

    #[test]
    fn test_text_search_binds_per_dialect() {
        let columns = vec!["t.a".to_string(), "t.b".to_string()];
        let mut bound = Vec::new();
        let sql = SqliteDialect.text_search(&columns, "50%", &mut |v| {
            bound.push(v);
            "?".to_string()
        });
        assert_eq!(sql, "(t.a LIKE ? ESCAPE '\\' OR t.b LIKE ? ESCAPE '\\')");
        assert_eq!(bound.len(), 2);
        assert_eq!(bound[0], SqlValue::Text("%50\\%%".to_string()));

        let mut count = 0;
        let sql = PostgresDialect.text_search(&columns, "red shoes", &mut |_| {
            count += 1;
            format!("${}", count)
        });
        assert!(sql.ends_with("@@ plainto_tsquery('simple', $1)"));
        assert_eq!(count, 1);
    }
}
