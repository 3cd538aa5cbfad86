use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::value_objects::{ColumnName, TableName};

/// Type alias for a database row represented as a sorted map of column name → JSON value.
pub type RowMap = BTreeMap<String, Value>;

/// Rows to write to the destination of one pass over one table.
///
/// Computed once per table per pass and consumed immediately by the applier.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ChangeSet {
    pub table: TableName,
    /// Single primary-key column the rows are keyed by.
    pub primary_key: ColumnName,
    /// Source rows absent from, or different at, the destination.
    pub upserts: Vec<RowMap>,
    /// Destination rows absent from the source.
    pub deletes: Vec<RowMap>,
}

impl ChangeSet {
    pub fn new(table: TableName, primary_key: ColumnName) -> Self {
        Self {
            table,
            primary_key,
            upserts: Vec::new(),
            deletes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Total number of row changes.
    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}
