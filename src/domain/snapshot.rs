use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::changeset::RowMap;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::value_objects::{ColumnName, TableName};

/// Full read of one side of a table, indexed by primary-key value.
///
/// Rows keep the order they were read in; the index maps the canonical key
/// string (see [`pk_key`]) to the row position. Building a snapshot enforces
/// the row ceiling and the uniqueness of keys.
#[derive(Debug, Clone)]
pub struct RowSnapshot {
    table: TableName,
    primary_key: ColumnName,
    rows: Vec<RowMap>,
    index: BTreeMap<String, usize>,
}

impl RowSnapshot {
    pub fn build(
        table: &TableName,
        primary_key: &ColumnName,
        rows: Vec<RowMap>,
        max_rows: usize,
    ) -> SyncResult<Self> {
        if rows.len() > max_rows {
            return Err(SyncError::SnapshotTooLarge {
                table: table.0.clone(),
                limit: max_rows,
            });
        }

        let mut index = BTreeMap::new();
        for (pos, row) in rows.iter().enumerate() {
            let key = pk_key(row, primary_key)
                .ok_or_else(|| SyncError::MissingPrimaryKey(table.0.clone()))?;
            if index.insert(key.clone(), pos).is_some() {
                return Err(SyncError::DuplicateKey {
                    table: table.0.clone(),
                    key,
                });
            }
        }

        Ok(Self {
            table: table.clone(),
            primary_key: primary_key.clone(),
            rows,
            index,
        })
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn primary_key(&self) -> &ColumnName {
        &self.primary_key
    }

    pub fn get(&self, key: &str) -> Option<&RowMap> {
        self.index.get(key).map(|&pos| &self.rows[pos])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// `(key, row)` pairs in read order.
    pub fn iter(&self) -> impl Iterator<Item = (String, &RowMap)> + '_ {
        self.rows.iter().filter_map(move |row| {
            pk_key(row, &self.primary_key).map(|key| (key, row))
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Canonical string form of a row's primary-key value.
///
/// Strings are used verbatim and other values through their JSON text, so
/// `1` and `"1"` index to the same key when the two sides disagree on type.
/// Returns `None` when the row has no such column or the value is NULL.
pub fn pk_key(row: &RowMap, pk: &ColumnName) -> Option<String> {
    match row.get(&pk.0)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
