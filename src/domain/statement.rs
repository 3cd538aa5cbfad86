use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;

use crate::domain::schema::SchemaChange;
use crate::domain::value_objects::{ColumnName, TableName};

/// A value after coercion against the destination column type, ready to be
/// bound as a statement parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// `YYYY-MM-DD HH:MM:SS`, already validated.
    DateTime(String),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// JSON form, matching what a row read back from the database decodes to.
    pub fn to_json(&self) -> Value {
        match self {
            SqlValue::Null => Value::Null,
            SqlValue::Bool(b) => Value::Bool(*b),
            SqlValue::Int(i) => json!(i),
            SqlValue::Float(f) => json!(f),
            SqlValue::DateTime(s) | SqlValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(b) => write!(f, "{}", b),
            SqlValue::Int(i) => write!(f, "{}", i),
            SqlValue::Float(v) => write!(f, "{}", v),
            SqlValue::DateTime(s) | SqlValue::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
        }
    }
}

/// A column/value pair bound into a statement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Binding {
    pub column: ColumnName,
    /// Destination declared type (used by dialects that cast parameters).
    pub declared_type: String,
    pub value: SqlValue,
}

impl Binding {
    pub fn new(column: &str, declared_type: &str, value: SqlValue) -> Self {
        Self {
            column: ColumnName(column.to_string()),
            declared_type: declared_type.to_string(),
            value,
        }
    }
}

/// Everything the engine writes to a destination, in typed form.
///
/// Sessions render statements through their dialect with bound parameters;
/// nothing in the engine assembles SQL text from values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Statement {
    /// Insert-or-update keyed by `primary_key`.
    Upsert {
        table: TableName,
        primary_key: ColumnName,
        bindings: Vec<Binding>,
    },
    /// Delete rows matching every binding (equality over non-null columns).
    Delete {
        table: TableName,
        predicate: Vec<Binding>,
    },
    /// Multi-row upsert used by the bulk-transfer fallback.
    BulkUpsert {
        table: TableName,
        primary_key: ColumnName,
        columns: Vec<(ColumnName, String)>,
        rows: Vec<Vec<SqlValue>>,
    },
    /// Corrective DDL.
    Schema {
        table: TableName,
        change: SchemaChange,
    },
}

impl Statement {
    pub fn table(&self) -> &TableName {
        match self {
            Statement::Upsert { table, .. }
            | Statement::Delete { table, .. }
            | Statement::BulkUpsert { table, .. }
            | Statement::Schema { table, .. } => table,
        }
    }

    /// Short human-readable form for logs: `upsert t (id=1)`.
    pub fn describe(&self) -> String {
        match self {
            Statement::Upsert {
                table,
                primary_key,
                bindings,
            } => {
                let key = bindings
                    .iter()
                    .find(|b| &b.column == primary_key)
                    .map(|b| b.value.to_string())
                    .unwrap_or_else(|| "?".to_string());
                format!("upsert {} ({}={})", table, primary_key, key)
            }
            Statement::Delete { table, predicate } => {
                let cond = predicate
                    .iter()
                    .map(|b| format!("{}={}", b.column, b.value))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                format!("delete {} ({})", table, cond)
            }
            Statement::BulkUpsert { table, rows, .. } => {
                format!("bulk upsert {} ({} rows)", table, rows.len())
            }
            Statement::Schema { table, change } => format!("alter {}: {}", table, change),
        }
    }
}
