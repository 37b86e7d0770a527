// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bound parameter values and their conversion from JSON.

use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use super::QueryError;
use super::model::{Field, FieldKind};

/// A value bound to a statement placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// Double precision number.
    Float(f64),
    /// Text.
    Text(String),
    /// JSON document.
    Json(Value),
    /// Timestamp in UTC.
    Timestamp(DateTime<Utc>),
    /// Calendar date.
    Date(NaiveDate),
}

impl SqlValue {
    /// Convert a JSON value without field metadata.
    pub fn from_untyped(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Convert a JSON value destined for `field`.
    pub fn for_field(field: &Field, value: &Value) -> Result<Self, QueryError> {
        if value.is_null() {
            return Ok(Self::Null);
        }

        let invalid = |reason: &str| QueryError::InvalidValue {
            field: field.name.clone(),
            reason: reason.to_string(),
        };

        match field.kind {
            FieldKind::Id | FieldKind::Reference => match value {
                Value::Number(n) => n
                    .as_i64()
                    .map(Self::Int)
                    .ok_or_else(|| invalid("ids must be integers or strings")),
                Value::String(s) => Ok(s
                    .parse::<i64>()
                    .map(Self::Int)
                    .unwrap_or_else(|_| Self::Text(s.clone()))),
                _ => Err(invalid("ids must be integers or strings")),
            },
            FieldKind::Text => match value {
                Value::String(s) => Ok(Self::Text(s.clone())),
                Value::Number(n) => Ok(Self::Text(n.to_string())),
                Value::Bool(b) => Ok(Self::Text(b.to_string())),
                _ => Err(invalid("expected text")),
            },
            FieldKind::Integer => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Self::Int(i))
                    } else {
                        match n.as_f64() {
                            Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                                Ok(Self::Int(f as i64))
                            }
                            _ => Err(invalid("expected an integer")),
                        }
                    }
                }
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Self::Int)
                    .map_err(|_| invalid("expected an integer")),
                _ => Err(invalid("expected an integer")),
            },
            FieldKind::Decimal => match value {
                Value::Number(n) => {
                    n.as_f64().map(Self::Float).ok_or_else(|| invalid("expected a number"))
                }
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Self::Float)
                    .ok_or_else(|| invalid("expected a number")),
                _ => Err(invalid("expected a number")),
            },
            FieldKind::Boolean => match value {
                Value::Bool(b) => Ok(Self::Bool(*b)),
                Value::Number(n) if n.as_i64() == Some(0) => Ok(Self::Bool(false)),
                Value::Number(n) if n.as_i64() == Some(1) => Ok(Self::Bool(true)),
                Value::String(s) if s == "true" => Ok(Self::Bool(true)),
                Value::String(s) if s == "false" => Ok(Self::Bool(false)),
                _ => Err(invalid("expected a boolean")),
            },
            FieldKind::Datetime => match value {
                Value::String(s) => DateTime::parse_from_rfc3339(s)
                    .map(|dt| Self::Timestamp(dt.with_timezone(&Utc)))
                    .map_err(|_| invalid("expected an RFC 3339 timestamp")),
                Value::Number(n) => n
                    .as_i64()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                    .map(Self::Timestamp)
                    .ok_or_else(|| invalid("expected epoch milliseconds")),
                _ => Err(invalid("expected a timestamp")),
            },
            FieldKind::Date => match value {
                Value::String(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map(Self::Date)
                    .map_err(|_| invalid("expected a YYYY-MM-DD date")),
                _ => Err(invalid("expected a date")),
            },
            FieldKind::Json => Ok(Self::Json(value.clone())),
            FieldKind::Geometry => point_wkt(value)
                .map(Self::Text)
                .ok_or_else(|| invalid("expected a point as [lng, lat], GeoJSON or WKT")),
        }
    }

    /// Whether this is SQL NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Convert a point in any accepted shape into WKT.
fn point_wkt(value: &Value) -> Option<String> {
    let (lng, lat) = match value {
        Value::String(s) => return Some(s.clone()),
        Value::Array(coords) if coords.len() == 2 => (coords[0].as_f64()?, coords[1].as_f64()?),
        Value::Object(map) => {
            if let Some(Value::Array(coords)) = map.get("coordinates") {
                if coords.len() != 2 {
                    return None;
                }
                (coords[0].as_f64()?, coords[1].as_f64()?)
            } else {
                (map.get("lng")?.as_f64()?, map.get("lat")?.as_f64()?)
            }
        }
        _ => return None,
    };
    if !(-180.0..=180.0).contains(&lng) || !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    Some(format!("POINT({} {})", lng, lat))
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Json(v) => write!(f, "'{}'", v.to_string().replace('\'', "''")),
            Self::Timestamp(t) => write!(f, "'{}'", t.to_rfc3339()),
            Self::Date(d) => write!(f, "'{}'", d),
        }
    }
}
