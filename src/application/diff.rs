use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tracing::{debug, instrument};

use crate::domain::{
    changeset::{ChangeSet, RowMap},
    error::{SyncError, SyncResult},
    ports::{Differ, Session},
    snapshot::RowSnapshot,
    value_objects::TableName,
};

// ─── Diff entry point ───

/// Read both sides of `table` and compute what the destination needs.
///
/// Both snapshots are keyed by the source's primary key; a destination keyed
/// by another column is refused rather than diffed on mismatched identities.
#[instrument(
    name = "diff",
    skip(source, dest, differ),
    fields(table = %table, source = source.endpoint(), dest = dest.endpoint())
)]
pub async fn diff(
    source: &mut dyn Session,
    dest: &mut dyn Session,
    table: &TableName,
    max_rows: usize,
    differ: &dyn Differ,
) -> SyncResult<ChangeSet> {
    let primary_key = source.primary_key(table).await?;
    let dest_key = dest.primary_key(table).await?;
    if dest_key != primary_key {
        return Err(SyncError::Schema {
            table: table.0.clone(),
            message: format!(
                "primary key differs: source `{}`, destination `{}`",
                primary_key, dest_key
            ),
        });
    }

    let source_rows = source.fetch_rows(table, max_rows).await?;
    let dest_rows = dest.fetch_rows(table, max_rows).await?;

    let source_snapshot = RowSnapshot::build(table, &primary_key, source_rows, max_rows)?;
    let dest_snapshot = RowSnapshot::build(table, &primary_key, dest_rows, max_rows)?;

    let changes = differ.diff_table(&source_snapshot, &dest_snapshot);
    debug!(
        upserts = changes.upserts.len(),
        deletes = changes.deletes.len(),
        "change set computed"
    );
    Ok(changes)
}

// ─── Table Differ (implementation of the port) ───

#[derive(Default)]
pub struct TableDiffer;

impl TableDiffer {
    pub fn new() -> Self {
        Self
    }
}

impl Differ for TableDiffer {
    fn diff_table(&self, source: &RowSnapshot, dest: &RowSnapshot) -> ChangeSet {
        let mut changes = ChangeSet::new(source.table().clone(), source.primary_key().clone());

        for (key, source_row) in source.iter() {
            match dest.get(&key) {
                None => changes.upserts.push(source_row.clone()),
                Some(dest_row) => {
                    let changed = diff_columns(source_row, dest_row);
                    if !changed.is_empty() {
                        debug!(table = %source.table(), key = %key, columns = ?changed, "row differs");
                        changes.upserts.push(source_row.clone());
                    }
                }
            }
        }

        changes.deletes = dest
            .iter()
            .filter(|(key, _)| !source.contains_key(key))
            .map(|(_, row)| row.clone())
            .collect();

        changes
    }
}

// ─── Row comparison ───

/// Columns of `source` whose value differs at `dest`.
///
/// Only the source row's columns are compared: a column that exists only at
/// the destination is never written by an upsert, so it cannot make the row
/// converge and must not keep it in the change set.
fn diff_columns(source: &RowMap, dest: &RowMap) -> Vec<String> {
    source
        .iter()
        .filter(|(col, source_val)| {
            let dest_val = dest.get(col.as_str()).unwrap_or(&Value::Null);
            // Fast path: hash equality
            json_hash(source_val) != json_hash(dest_val) && !json_equal(source_val, dest_val)
        })
        .map(|(col, _)| col.clone())
        .collect()
}

fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(na), Value::Number(nb)) => match (na.as_f64(), nb.as_f64()) {
            (Some(fa), Some(fb)) => float_eq(fa, fb),
            _ => na == nb,
        },
        // Decimal columns come back as text from some drivers and as numbers
        // from others.
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            match (n.as_f64(), s.trim().parse::<f64>()) {
                (Some(fa), Ok(fb)) => float_eq(fa, fb),
                _ => false,
            }
        }
        _ => normalize_json(a) == normalize_json(b),
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

fn json_hash(v: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_json(v, &mut hasher);
    hasher.finish()
}

fn hash_json(v: &Value, state: &mut impl Hasher) {
    match v {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => b.hash(state),
        Value::Number(n) => n.to_string().hash(state),
        Value::String(s) => s.hash(state),
        Value::Array(arr) => {
            for el in arr {
                hash_json(el, state);
            }
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by_key(|(k, _)| *k);
            for (k, v) in entries {
                k.hash(state);
                hash_json(v, state);
            }
        }
    }
}

fn normalize_json(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by_key(|(k, _)| *k);
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), normalize_json(v)))
                    .collect(),
            )
        }
        Value::Array(arr) => Value::Array(arr.iter().map(normalize_json).collect()),
        _ => v.clone(),
    }
}
