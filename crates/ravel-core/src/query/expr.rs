// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Predicate and value expression trees.
//!
//! Filters arrive as JSON documents in a document-database style:
//!
//! ```json
//! {
//!   "status": "paid",
//!   "total": {"$gte": 100},
//!   "$or": [{"vip": true}, {"country": {"$in": ["PL", "DE"]}}]
//! }
//! ```
//!
//! Keys are field names (optionally `alias.field`) or logical operators; field values
//! are literals (equality) or operator objects. `$expr` switches to the expression form,
//! where `"$field"` strings are field references and operators take argument arrays.
//!
//! The tree is dialect neutral. [`super::writer::SqlWriter`] renders it, and its
//! `Display` form is a readable, unbound rendering used in logs and tests.

use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::QueryError;

/// A reference to a field, optionally qualified by a join alias or model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef {
    /// Join alias or model name.
    pub scope: Option<String>,
    /// Field name.
    pub name: String,
}

impl FieldRef {
    /// Parse `field` or `scope.field`.
    pub fn parse(path: &str) -> Self {
        match path.split_once('.') {
            Some((scope, name)) => Self {
                scope: Some(scope.to_string()),
                name: name.to_string(),
            },
            None => Self {
                scope: None,
                name: path.to_string(),
            },
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}.{}", scope, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
}

impl CompareOp {
    /// SQL operator text.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
        }
    }

    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "$eq" => Self::Eq,
            "$ne" => Self::Ne,
            "$gt" => Self::Gt,
            "$gte" => Self::Gte,
            "$lt" => Self::Lt,
            "$lte" => Self::Lte,
            _ => return None,
        })
    }
}

/// Boolean connectives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// All operands hold. An empty conjunction is true.
    And,
    /// At least one operand holds. An empty disjunction is false.
    Or,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulo,
}

impl ArithmeticOp {
    /// SQL operator text.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Modulo => "%",
        }
    }

    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "$add" => Self::Add,
            "$subtract" => Self::Subtract,
            "$multiply" => Self::Multiply,
            "$divide" => Self::Divide,
            "$mod" => Self::Modulo,
            _ => return None,
        })
    }
}

/// Scalar functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Lowercase a string.
    Lower,
    /// Uppercase a string.
    Upper,
    /// Character length.
    Length,
    /// Strip surrounding whitespace.
    Trim,
    /// Absolute value.
    Abs,
    /// Round to a number of decimals (second argument, default 0).
    Round,
    /// Concatenate strings.
    Concat,
}

impl Function {
    /// Neutral function name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lower => "LOWER",
            Self::Upper => "UPPER",
            Self::Length => "LENGTH",
            Self::Trim => "TRIM",
            Self::Abs => "ABS",
            Self::Round => "ROUND",
            Self::Concat => "CONCAT",
        }
    }

    fn from_operator(op: &str) -> Option<Self> {
        Some(match op {
            "$lower" | "$toLower" => Self::Lower,
            "$upper" | "$toUpper" => Self::Upper,
            "$length" | "$strLenCP" => Self::Length,
            "$trim" => Self::Trim,
            "$abs" => Self::Abs,
            "$round" => Self::Round,
            "$concat" => Self::Concat,
            _ => return None,
        })
    }
}

/// Aggregate functions usable in computations and `having`.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregate {
    /// Number of rows in the group.
    Count,
    /// Number of rows matching a predicate.
    CountIf(Expr),
    /// Sum.
    Sum(Expr),
    /// Average.
    Avg(Expr),
    /// Minimum.
    Min(Expr),
    /// Maximum.
    Max(Expr),
}

impl Aggregate {
    /// `SUM(field)`.
    pub fn sum(field: &str) -> Self {
        Self::Sum(Expr::field(field))
    }

    /// `AVG(field)`.
    pub fn avg(field: &str) -> Self {
        Self::Avg(Expr::field(field))
    }

    /// Parse `{"$sum": "$price"}`, `{"$count": {}}`, `{"$countIf": {<filter>}}`, ...
    pub fn parse(value: &Value) -> Result<Self, QueryError> {
        let (op, arg) = single_operator(value)
            .ok_or_else(|| QueryError::Invalid(format!("expected an aggregate, got {}", value)))?;
        Self::from_parts(op, arg)?
            .ok_or_else(|| QueryError::Invalid(format!("unknown aggregate '{}'", op)))
    }

    fn from_parts(op: &str, arg: &Value) -> Result<Option<Self>, QueryError> {
        Ok(Some(match op {
            "$count" => Self::Count,
            "$countIf" => Self::CountIf(Expr::parse_filter(arg)?),
            "$sum" => Self::Sum(Expr::parse_operand(arg)?),
            "$avg" => Self::Avg(Expr::parse_operand(arg)?),
            "$min" => Self::Min(Expr::parse_operand(arg)?),
            "$max" => Self::Max(Expr::parse_operand(arg)?),
            _ => return Ok(None),
        }))
    }

    /// Neutral function name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::CountIf(_) => "COUNT_IF",
            Self::Sum(_) => "SUM",
            Self::Avg(_) => "AVG",
            Self::Min(_) => "MIN",
            Self::Max(_) => "MAX",
        }
    }

    /// Argument expression, if any.
    pub fn argument(&self) -> Option<&Expr> {
        match self {
            Self::Count => None,
            Self::CountIf(e) | Self::Sum(e) | Self::Avg(e) | Self::Min(e) | Self::Max(e) => Some(e),
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.argument() {
            None => write!(f, "{}(*)", self.name()),
            Some(arg) => write!(f, "{}({})", self.name(), arg),
        }
    }
}

impl<'de> Deserialize<'de> for Aggregate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Aggregate::parse(&value).map_err(serde::de::Error::custom)
    }
}

/// An expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference.
    Field(FieldRef),
    /// Literal, bound as a parameter when rendered.
    Value(Value),
    /// Aggregate call.
    Aggregate(Box<Aggregate>),
    /// Binary comparison.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Conjunction or disjunction.
    Logical {
        /// Connective.
        op: LogicalOp,
        /// Operands.
        operands: Vec<Expr>,
    },
    /// Negation.
    Not(Box<Expr>),
    /// Membership in a literal list.
    In {
        /// Tested expression.
        expr: Box<Expr>,
        /// Candidate values.
        values: Vec<Value>,
        /// `NOT IN`.
        negated: bool,
    },
    /// NULL test.
    IsNull {
        /// Tested expression.
        expr: Box<Expr>,
        /// `IS NOT NULL`.
        negated: bool,
    },
    /// SQL LIKE pattern match.
    Like {
        /// Tested expression.
        expr: Box<Expr>,
        /// Pattern with `%` and `_` wildcards.
        pattern: String,
        /// Ignore case.
        case_insensitive: bool,
    },
    /// Regular expression match.
    Regex {
        /// Tested expression.
        expr: Box<Expr>,
        /// Pattern.
        pattern: String,
        /// Ignore case.
        case_insensitive: bool,
    },
    /// Binary arithmetic.
    Arithmetic {
        /// Operator.
        op: ArithmeticOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// Scalar function call.
    Function {
        /// Function.
        func: Function,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// Full-text search. An empty field list searches every searchable field.
    TextSearch {
        /// Fields to search.
        fields: Vec<FieldRef>,
        /// Search text.
        query: String,
    },
}

impl Expr {
    /// Field reference from `field` or `scope.field`.
    pub fn field(path: &str) -> Self {
        Self::Field(FieldRef::parse(path))
    }

    /// Literal value.
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    fn compare(self, op: CompareOp, other: Expr) -> Self {
        Self::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `self = value`, or `IS NULL` for a null value.
    pub fn eq(self, value: impl Into<Value>) -> Self {
        let value = value.into();
        if value.is_null() {
            return self.is_null();
        }
        self.compare(CompareOp::Eq, Expr::Value(value))
    }

    /// `self <> value`.
    pub fn ne(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Ne, Expr::Value(value.into()))
    }

    /// `self > value`.
    pub fn gt(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Gt, Expr::Value(value.into()))
    }

    /// `self >= value`.
    pub fn gte(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Gte, Expr::Value(value.into()))
    }

    /// `self < value`.
    pub fn lt(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Lt, Expr::Value(value.into()))
    }

    /// `self <= value`.
    pub fn lte(self, value: impl Into<Value>) -> Self {
        self.compare(CompareOp::Lte, Expr::Value(value.into()))
    }

    /// `self IS NULL`.
    pub fn is_null(self) -> Self {
        Self::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// `self IN (values)`.
    pub fn in_list(self, values: Vec<Value>) -> Self {
        Self::In {
            expr: Box::new(self),
            values,
            negated: false,
        }
    }

    /// `self AND other`, flattening nested conjunctions.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Self::Logical {
                op: LogicalOp::And,
                mut operands,
            } => {
                operands.push(other);
                Self::Logical {
                    op: LogicalOp::And,
                    operands,
                }
            }
            first => Self::Logical {
                op: LogicalOp::And,
                operands: vec![first, other],
            },
        }
    }

    /// `self OR other`.
    pub fn or(self, other: Expr) -> Self {
        Self::Logical {
            op: LogicalOp::Or,
            operands: vec![self, other],
        }
    }

    /// Full-text search over every searchable field.
    pub fn text_search(query: impl Into<String>) -> Self {
        Self::TextSearch {
            fields: Vec::new(),
            query: query.into(),
        }
    }

    /// Parse a filter document.
    pub fn parse_filter(value: &Value) -> Result<Self, QueryError> {
        let map = match value {
            Value::Object(map) => map,
            Value::Array(items) => {
                return Ok(Self::Logical {
                    op: LogicalOp::And,
                    operands: items.iter().map(Self::parse_filter).collect::<Result<_, _>>()?,
                });
            }
            other => {
                return Err(QueryError::Invalid(format!(
                    "filter must be an object, got {}",
                    other
                )));
            }
        };

        let mut conditions = Vec::with_capacity(map.len());
        for (key, cond) in map {
            let expr = match key.as_str() {
                "$and" => Self::Logical {
                    op: LogicalOp::And,
                    operands: parse_filter_list(key, cond)?,
                },
                "$or" => Self::Logical {
                    op: LogicalOp::Or,
                    operands: parse_filter_list(key, cond)?,
                },
                "$nor" => Self::Not(Box::new(Self::Logical {
                    op: LogicalOp::Or,
                    operands: parse_filter_list(key, cond)?,
                })),
                "$not" => Self::Not(Box::new(Self::parse_filter(cond)?)),
                "$expr" => Self::parse_expression(cond)?,
                "$text" => parse_text_search(cond)?,
                op if op.starts_with('$') => {
                    return Err(QueryError::Invalid(format!("unknown operator '{}'", op)));
                }
                field => parse_field_condition(FieldRef::parse(field), cond)?,
            };
            conditions.push(expr);
        }

        Ok(conjunction(conditions))
    }

    /// Parse the expression form used under `$expr`.
    pub fn parse_expression(value: &Value) -> Result<Self, QueryError> {
        let Some((op, arg)) = single_operator(value) else {
            return Self::parse_operand(value);
        };

        match op {
            "$and" | "$or" => {
                let items = arg.as_array().ok_or_else(|| {
                    QueryError::Invalid(format!("{} expects an array", op))
                })?;
                Ok(Self::Logical {
                    op: if op == "$and" { LogicalOp::And } else { LogicalOp::Or },
                    operands: items
                        .iter()
                        .map(Self::parse_expression)
                        .collect::<Result<_, _>>()?,
                })
            }
            "$not" => {
                let inner = match arg {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    other => other,
                };
                Ok(Self::Not(Box::new(Self::parse_expression(inner)?)))
            }
            "$in" | "$nin" => {
                let [subject, list] = pair(op, arg)?;
                let values = list
                    .as_array()
                    .ok_or_else(|| QueryError::Invalid(format!("{} expects a list", op)))?;
                Ok(Self::In {
                    expr: Box::new(Self::parse_operand(subject)?),
                    values: values.clone(),
                    negated: op == "$nin",
                })
            }
            _ => match CompareOp::from_operator(op) {
                Some(cmp) => {
                    let [left, right] = pair(op, arg)?;
                    let left = Self::parse_operand(left)?;
                    let right = Self::parse_operand(right)?;
                    Ok(match (cmp, &right) {
                        (CompareOp::Eq, Expr::Value(Value::Null)) => left.is_null(),
                        (CompareOp::Ne, Expr::Value(Value::Null)) => Self::IsNull {
                            expr: Box::new(left),
                            negated: true,
                        },
                        _ => left.compare(cmp, right),
                    })
                }
                None => Self::parse_operand(value),
            },
        }
    }

    /// Parse an operand: `"$field"`, an operator object, or a literal.
    pub fn parse_operand(value: &Value) -> Result<Self, QueryError> {
        if let Value::String(s) = value {
            if let Some(path) = s.strip_prefix('$') {
                if let Some(literal) = path.strip_prefix('$') {
                    return Ok(Self::Value(Value::String(format!("${}", literal))));
                }
                return Ok(Self::field(path));
            }
            return Ok(Self::Value(value.clone()));
        }

        let Some((op, arg)) = single_operator(value) else {
            return Ok(Self::Value(value.clone()));
        };

        if let Some(arith) = ArithmeticOp::from_operator(op) {
            let items = arg
                .as_array()
                .filter(|items| items.len() >= 2)
                .ok_or_else(|| {
                    QueryError::Invalid(format!("{} expects at least two operands", op))
                })?;
            let mut operands = items.iter().map(Self::parse_operand);
            let first = operands
                .next()
                .ok_or_else(|| QueryError::Invalid(format!("{} expects operands", op)))??;
            return operands.try_fold(first, |acc, next| {
                Ok(Self::Arithmetic {
                    op: arith,
                    left: Box::new(acc),
                    right: Box::new(next?),
                })
            });
        }

        if let Some(func) = Function::from_operator(op) {
            let args = match arg {
                Value::Array(items) => items
                    .iter()
                    .map(Self::parse_operand)
                    .collect::<Result<Vec<_>, _>>()?,
                single => vec![Self::parse_operand(single)?],
            };
            let arity_ok = match func {
                Function::Concat => !args.is_empty(),
                Function::Round => (1..=2).contains(&args.len()),
                _ => args.len() == 1,
            };
            if !arity_ok {
                return Err(QueryError::Invalid(format!(
                    "{} called with {} arguments",
                    op,
                    args.len()
                )));
            }
            return Ok(Self::Function { func, args });
        }

        if let Some(aggregate) = Aggregate::from_parts(op, arg)? {
            return Ok(Self::Aggregate(Box::new(aggregate)));
        }

        if CompareOp::from_operator(op).is_some()
            || matches!(op, "$and" | "$or" | "$not" | "$in" | "$nin")
        {
            return Self::parse_expression(value);
        }

        Err(QueryError::Invalid(format!("unknown operator '{}'", op)))
    }

    /// Rewrite every field reference outside aggregate arguments.
    pub fn try_map_fields<F>(self, f: &mut F) -> Result<Self, QueryError>
    where
        F: FnMut(FieldRef) -> Result<Expr, QueryError>,
    {
        let boxed = |e: Box<Expr>, f: &mut F| e.try_map_fields(f).map(Box::new);
        Ok(match self {
            Self::Field(r) => f(r)?,
            Self::Value(_) | Self::Aggregate(_) | Self::TextSearch { .. } => self,
            Self::Compare { op, left, right } => Self::Compare {
                op,
                left: boxed(left, f)?,
                right: boxed(right, f)?,
            },
            Self::Logical { op, operands } => Self::Logical {
                op,
                operands: operands
                    .into_iter()
                    .map(|e| e.try_map_fields(f))
                    .collect::<Result<_, _>>()?,
            },
            Self::Not(inner) => Self::Not(boxed(inner, f)?),
            Self::In { expr, values, negated } => Self::In {
                expr: boxed(expr, f)?,
                values,
                negated,
            },
            Self::IsNull { expr, negated } => Self::IsNull {
                expr: boxed(expr, f)?,
                negated,
            },
            Self::Like {
                expr,
                pattern,
                case_insensitive,
            } => Self::Like {
                expr: boxed(expr, f)?,
                pattern,
                case_insensitive,
            },
            Self::Regex {
                expr,
                pattern,
                case_insensitive,
            } => Self::Regex {
                expr: boxed(expr, f)?,
                pattern,
                case_insensitive,
            },
            Self::Arithmetic { op, left, right } => Self::Arithmetic {
                op,
                left: boxed(left, f)?,
                right: boxed(right, f)?,
            },
            Self::Function { func, args } => Self::Function {
                func,
                args: args
                    .into_iter()
                    .map(|e| e.try_map_fields(f))
                    .collect::<Result<_, _>>()?,
            },
        })
    }
}

impl<'de> Deserialize<'de> for Expr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Expr::parse_filter(&value).map_err(serde::de::Error::custom)
    }
}

fn conjunction(mut conditions: Vec<Expr>) -> Expr {
    if conditions.len() == 1 {
        if let Some(only) = conditions.pop() {
            return only;
        }
    }
    Expr::Logical {
        op: LogicalOp::And,
        operands: conditions,
    }
}

fn single_operator(value: &Value) -> Option<(&str, &Value)> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let (key, arg) = map.iter().next()?;
    key.starts_with('$').then_some((key.as_str(), arg))
}

fn pair<'v>(op: &str, arg: &'v Value) -> Result<[&'v Value; 2], QueryError> {
    match arg.as_array().map(|items| items.as_slice()) {
        Some([a, b]) => Ok([a, b]),
        _ => Err(QueryError::Invalid(format!("{} expects two operands", op))),
    }
}

fn parse_filter_list(op: &str, value: &Value) -> Result<Vec<Expr>, QueryError> {
    value
        .as_array()
        .ok_or_else(|| QueryError::Invalid(format!("{} expects an array of filters", op)))?
        .iter()
        .map(Expr::parse_filter)
        .collect()
}

fn parse_text_search(value: &Value) -> Result<Expr, QueryError> {
    match value {
        Value::String(query) => Ok(Expr::text_search(query.clone())),
        Value::Object(map) => {
            let query = map
                .get("$search")
                .and_then(Value::as_str)
                .ok_or_else(|| QueryError::Invalid("$text requires $search".to_string()))?;
            let fields = match map.get("$fields") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(|item| {
                        item.as_str().map(FieldRef::parse).ok_or_else(|| {
                            QueryError::Invalid("$fields must list field names".to_string())
                        })
                    })
                    .collect::<Result<_, _>>()?,
                Some(_) => {
                    return Err(QueryError::Invalid("$fields must list field names".to_string()));
                }
                None => Vec::new(),
            };
            Ok(Expr::TextSearch {
                fields,
                query: query.to_string(),
            })
        }
        _ => Err(QueryError::Invalid("$text expects a string or object".to_string())),
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value.as_object() {
        Some(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        None => false,
    }
}

fn parse_field_condition(field: FieldRef, cond: &Value) -> Result<Expr, QueryError> {
    let subject = || Box::new(Expr::Field(field.clone()));

    if !is_operator_object(cond) {
        return Ok(Expr::Field(field.clone()).eq(cond.clone()));
    }

    let ops = cond.as_object().into_iter().flatten();
    let regex_ci = cond
        .get("$options")
        .and_then(Value::as_str)
        .is_some_and(|o| o.contains('i'));

    let mut conditions = Vec::new();
    for (op, arg) in ops {
        let expr = match op.as_str() {
            "$in" | "$nin" => Expr::In {
                expr: subject(),
                values: arg
                    .as_array()
                    .ok_or_else(|| {
                        QueryError::Invalid(format!("{} on '{}' expects a list", op, field))
                    })?
                    .clone(),
                negated: op == "$nin",
            },
            "$exists" => Expr::IsNull {
                expr: subject(),
                negated: arg.as_bool().ok_or_else(|| {
                    QueryError::Invalid(format!("$exists on '{}' expects a boolean", field))
                })?,
            },
            "$like" | "$ilike" => Expr::Like {
                expr: subject(),
                pattern: string_arg(op, &field, arg)?.to_string(),
                case_insensitive: op == "$ilike",
            },
            "$startsWith" | "$endsWith" | "$contains" => {
                let text = super::dialect::escape_like(string_arg(op, &field, arg)?);
                let pattern = match op.as_str() {
                    "$startsWith" => format!("{}%", text),
                    "$endsWith" => format!("%{}", text),
                    _ => format!("%{}%", text),
                };
                Expr::Like {
                    expr: subject(),
                    pattern,
                    case_insensitive: false,
                }
            }
            "$regex" => Expr::Regex {
                expr: subject(),
                pattern: string_arg(op, &field, arg)?.to_string(),
                case_insensitive: regex_ci,
            },
            "$options" => {
                if cond.get("$regex").is_none() {
                    return Err(QueryError::Invalid(format!(
                        "$options on '{}' without $regex",
                        field
                    )));
                }
                continue;
            }
            "$not" => Expr::Not(Box::new(parse_field_condition(field.clone(), arg)?)),
            "$eq" if arg.is_null() => Expr::Field(field.clone()).is_null(),
            "$ne" if arg.is_null() => Expr::IsNull {
                expr: subject(),
                negated: true,
            },
            other => match CompareOp::from_operator(other) {
                Some(cmp) => Expr::Field(field.clone()).compare(cmp, Expr::Value(arg.clone())),
                None => {
                    return Err(QueryError::Invalid(format!(
                        "unknown operator '{}' on '{}'",
                        other, field
                    )));
                }
            },
        };
        conditions.push(expr);
    }

    Ok(conjunction(conditions))
}

fn string_arg<'v>(op: &str, field: &FieldRef, arg: &'v Value) -> Result<&'v str, QueryError> {
    arg.as_str()
        .ok_or_else(|| QueryError::Invalid(format!("{} on '{}' expects a string", op, field)))
}

struct Literal<'a>(&'a Value);

impl fmt::Display for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Value::String(s) => write!(f, "'{}'", s),
            other => write!(f, "{}", other),
        }
    }
}

fn join_display<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(sep)
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(r) => write!(f, "{}", r),
            Self::Value(v) => write!(f, "{}", Literal(v)),
            Self::Aggregate(a) => write!(f, "{}", a),
            Self::Compare { op, left, right } => write!(f, "{} {} {}", left, op.as_sql(), right),
            Self::Logical { op, operands } if operands.is_empty() => {
                f.write_str(if *op == LogicalOp::And { "TRUE" } else { "FALSE" })
            }
            Self::Logical { op, operands } => {
                let sep = if *op == LogicalOp::And { " AND " } else { " OR " };
                write!(f, "({})", join_display(operands, sep))
            }
            Self::Not(inner) => write!(f, "NOT ({})", inner),
            Self::In {
                expr,
                values,
                negated,
            } => {
                let list = values.iter().map(Literal).collect::<Vec<_>>();
                let not = if *negated { "NOT " } else { "" };
                write!(f, "{} {}IN ({})", expr, not, join_display(&list, ", "))
            }
            Self::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Self::Like {
                expr,
                pattern,
                case_insensitive,
            } => {
                let op = if *case_insensitive { "ILIKE" } else { "LIKE" };
                write!(f, "{} {} '{}'", expr, op, pattern)
            }
            Self::Regex {
                expr,
                pattern,
                case_insensitive,
            } => {
                let op = if *case_insensitive { "~*" } else { "~" };
                write!(f, "{} {} '{}'", expr, op, pattern)
            }
            Self::Arithmetic { op, left, right } => {
                write!(f, "({} {} {})", left, op.as_sql(), right)
            }
            Self::Function { func, args } => {
                write!(f, "{}({})", func.name(), join_display(args, ", "))
            }
            Self::TextSearch { fields, query } => {
                write!(f, "MATCH({}) '{}'", join_display(fields, ", "), query)
            }
        }
    }
}
