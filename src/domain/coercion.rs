use chrono::NaiveDateTime;
use serde_json::Value;

use crate::domain::changeset::RowMap;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::schema::{ColumnDefinition, TableStructure};
use crate::domain::statement::{Binding, SqlValue};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// How a destination column type is treated when binding values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeFamily {
    Integer,
    Float,
    /// `datetime` / `timestamp`: only `YYYY-MM-DD HH:MM:SS` is accepted.
    DateTime,
    Boolean,
    Text,
}

impl TypeFamily {
    pub fn of(column: &ColumnDefinition) -> Self {
        let base = column.base_type();
        match base.as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2"
            | "int4" | "int8" | "serial" | "smallserial" | "bigserial" => TypeFamily::Integer,
            "float" | "double" | "double precision" | "real" | "decimal" | "numeric"
            | "float4" | "float8" => TypeFamily::Float,
            "bool" | "boolean" => TypeFamily::Boolean,
            b if b == "datetime" || b.starts_with("timestamp") => TypeFamily::DateTime,
            _ => TypeFamily::Text,
        }
    }
}

/// Cast a raw value to the destination column's type.
pub fn coerce(column: &ColumnDefinition, value: &Value) -> SyncResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null);
    }
    let coerced = match TypeFamily::of(column) {
        TypeFamily::Integer => to_int(value).map(SqlValue::Int),
        TypeFamily::Float => to_float(value).map(SqlValue::Float),
        TypeFamily::Boolean => to_bool(value).map(SqlValue::Bool),
        TypeFamily::DateTime => match value {
            Value::String(s) if is_fixed_datetime(s) => Some(SqlValue::DateTime(s.clone())),
            _ => None,
        },
        TypeFamily::Text => Some(SqlValue::Text(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
    };
    coerced.ok_or_else(|| SyncError::Coercion {
        column: column.name.clone(),
        column_type: column.declared_type.clone(),
        value: value.to_string(),
    })
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Some(true),
            "0" | "f" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// `YYYY-MM-DD HH:MM:SS` exactly, and a real calendar date.
pub fn is_fixed_datetime(s: &str) -> bool {
    let b = s.as_bytes();
    if b.len() != 19 {
        return false;
    }
    let shape_ok = b.iter().enumerate().all(|(i, c)| match i {
        4 | 7 => *c == b'-',
        10 => *c == b' ',
        13 | 16 => *c == b':',
        _ => c.is_ascii_digit(),
    });
    shape_ok && NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).is_ok()
}

/// A row turned into bindings for one destination.
#[derive(Debug, Default)]
pub struct PreparedRow {
    pub bindings: Vec<Binding>,
    /// Fields that failed coercion; each is bound as NULL.
    pub failures: Vec<SyncError>,
}

/// Bind every column of `row` that exists at the destination.
///
/// Columns unknown to the destination are dropped. A value that fails
/// coercion is replaced by NULL and reported in `failures`; the row itself is
/// kept.
pub fn prepare_row(row: &RowMap, dest: &TableStructure) -> PreparedRow {
    let mut prepared = PreparedRow::default();
    for column in dest.columns() {
        let Some(value) = row.get(&column.name) else {
            continue;
        };
        let value = match coerce(column, value) {
            Ok(v) => v,
            Err(e) => {
                prepared.failures.push(e);
                SqlValue::Null
            }
        };
        prepared
            .bindings
            .push(Binding::new(&column.name, &column.declared_type, value));
    }
    prepared
}

/// Equality predicate over the non-null, coercible columns of `row`.
pub fn prepare_predicate(row: &RowMap, dest: &TableStructure) -> PreparedRow {
    let mut prepared = prepare_row(row, dest);
    prepared.bindings.retain(|b| !b.value.is_null());
    prepared
}
