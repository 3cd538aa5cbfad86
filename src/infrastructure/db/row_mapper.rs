use anyhow::Result;
use sqlx::any::AnyRow;
use sqlx::{Column, Row, TypeInfo};
use std::collections::BTreeMap;

use crate::domain::changeset::RowMap;
use crate::infrastructure::db::dialect::RowDecoder;

/// Convert a sqlx `AnyRow` into a `RowMap`.
///
/// `col_types` maps column names to their base declared type. When a column
/// is missing from it (SQLite's `SELECT *` path) the AnyRow runtime type name
/// is used as the hint instead.
pub fn row_to_map(
    row: &AnyRow,
    col_types: &BTreeMap<String, String>,
    decoder: &dyn RowDecoder,
) -> Result<RowMap> {
    let mut map = BTreeMap::new();
    for col in row.columns() {
        let name = col.name().to_string();
        let anyrow_type = col.type_info().name();
        let type_hint = col_types
            .get(&name)
            .map(|s| s.as_str())
            .unwrap_or(anyrow_type);

        let value = decoder.decode_column(row, col.ordinal(), type_hint)?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Read a catalog column as `String`. MySQL hands `information_schema`
/// strings to AnyRow as BLOB.
pub fn text_column(row: &AnyRow, idx: usize) -> Result<String> {
    Ok(opt_text_column(row, idx)?.unwrap_or_default())
}

/// Nullable variant of [`text_column`].
pub fn opt_text_column(row: &AnyRow, idx: usize) -> Result<Option<String>> {
    let type_name = row.column(idx).type_info().name();
    if type_name == "BLOB" {
        let bytes: Option<Vec<u8>> = row.try_get(idx)?;
        Ok(bytes.map(|b| String::from_utf8_lossy(&b).into_owned()))
    } else {
        Ok(row.try_get(idx)?)
    }
}

/// Read a scalar of unknown type (e.g. the `Checksum` column of
/// `CHECKSUM TABLE`, an unsigned BIGINT) as text.
pub fn scalar_text(row: &AnyRow, idx: usize) -> Result<String> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(|n| n.to_string()).unwrap_or_default());
    }
    Ok(opt_text_column(row, idx)?.unwrap_or_default())
}
