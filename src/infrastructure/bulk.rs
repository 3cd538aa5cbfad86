use async_trait::async_trait;
use std::io::{BufWriter, Write};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::{debug, warn};

use crate::domain::changeset::RowMap;
use crate::domain::coercion::coerce;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::ports::{BulkFile, BulkTransfer, Session};
use crate::domain::schema::TableStructure;
use crate::domain::statement::{SqlValue, Statement};
use crate::domain::value_objects::{ColumnName, TableName};

/// Rows per multi-row upsert.
const DEFAULT_CHUNK: usize = 500;

/// Bulk copy through a newline-delimited JSON file: one row object per line.
///
/// The import streams the file and holds one chunk of rows at a time.
pub struct NdjsonBulkTransfer {
    chunk_size: usize,
}

impl NdjsonBulkTransfer {
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl Default for NdjsonBulkTransfer {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid_line(e: serde_json::Error) -> SyncError {
    SyncError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Next row of the file, skipping blank lines.
async fn next_row(lines: &mut Lines<BufReader<tokio::fs::File>>) -> SyncResult<Option<RowMap>> {
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line).map(Some).map_err(invalid_line);
    }
    Ok(None)
}

async fn open_lines(file: &BulkFile) -> SyncResult<Lines<BufReader<tokio::fs::File>>> {
    let handle = tokio::fs::File::open(file.path()).await?;
    Ok(BufReader::new(handle).lines())
}

/// Write `rows` to a fresh temporary file, off the async runtime.
async fn write_file(table: &TableName, rows: Vec<RowMap>) -> SyncResult<BulkFile> {
    let prefix = format!("dbmirror_{}_", table);
    tokio::task::spawn_blocking(move || -> std::io::Result<BulkFile> {
        let tmp = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(".ndjson")
            .tempfile()?;
        let mut writer = BufWriter::new(tmp.as_file());
        for row in &rows {
            serde_json::to_writer(&mut writer, row)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        drop(writer);
        Ok(BulkFile::new(tmp, rows.len()))
    })
    .await
    .map_err(|e| SyncError::Io(std::io::Error::other(e)))?
    .map_err(SyncError::from)
}

/// Destination columns carried by the exported rows, in destination order.
fn carried_columns(dest: &TableStructure, first: &RowMap) -> Vec<(ColumnName, String)> {
    dest.columns()
        .iter()
        .filter(|c| first.contains_key(&c.name))
        .map(|c| (ColumnName(c.name.clone()), c.declared_type.clone()))
        .collect()
}

fn to_tuple(
    table: &TableName,
    dest: &TableStructure,
    columns: &[(ColumnName, String)],
    row: &RowMap,
) -> Vec<SqlValue> {
    columns
        .iter()
        .map(|(column, _)| {
            let raw = row.get(column.as_str()).cloned().unwrap_or_default();
            match dest.get(column.as_str()).map(|def| coerce(def, &raw)) {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    warn!(table = %table, column = %column, error = %e, "coercion failed; writing NULL");
                    SqlValue::Null
                }
                None => SqlValue::Null,
            }
        })
        .collect()
}

async fn send_chunk(
    session: &mut dyn Session,
    table: &TableName,
    primary_key: &ColumnName,
    columns: &[(ColumnName, String)],
    rows: Vec<Vec<SqlValue>>,
) -> SyncResult<u64> {
    let n = rows.len() as u64;
    let statement = Statement::BulkUpsert {
        table: table.clone(),
        primary_key: primary_key.clone(),
        columns: columns.to_vec(),
        rows,
    };
    session.execute(&statement).await?;
    Ok(n)
}

#[async_trait]
impl BulkTransfer for NdjsonBulkTransfer {
    async fn export(
        &self,
        session: &mut dyn Session,
        table: &TableName,
        max_rows: usize,
    ) -> SyncResult<BulkFile> {
        let rows = session.fetch_rows(table, max_rows).await?;
        let file = write_file(table, rows).await?;
        debug!(table = %table, rows = file.rows, path = %file.path().display(), "bulk export written");
        Ok(file)
    }

    async fn import(
        &self,
        session: &mut dyn Session,
        table: &TableName,
        file: &BulkFile,
        dry_run: bool,
    ) -> SyncResult<u64> {
        let mut lines = open_lines(file).await?;
        if dry_run {
            let mut rows = 0u64;
            while next_row(&mut lines).await?.is_some() {
                rows += 1;
            }
            debug!(table = %table, rows, "dry run: bulk import skipped");
            return Ok(rows);
        }

        let dest = session.table_structure(table).await?;
        let primary_key = session.primary_key(table).await?;
        let mut columns: Option<Vec<(ColumnName, String)>> = None;
        let mut chunk: Vec<Vec<SqlValue>> = Vec::with_capacity(self.chunk_size);
        let mut written = 0u64;

        while let Some(row) = next_row(&mut lines).await? {
            let cols = columns.get_or_insert_with(|| carried_columns(&dest, &row));
            chunk.push(to_tuple(table, &dest, cols, &row));
            if chunk.len() == self.chunk_size {
                let rows = std::mem::take(&mut chunk);
                written += send_chunk(session, table, &primary_key, cols, rows).await?;
            }
        }
        if let Some(cols) = &columns {
            if !chunk.is_empty() {
                written += send_chunk(session, table, &primary_key, cols, chunk).await?;
            }
        }

        debug!(table = %table, rows = written, "bulk import applied");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use crate::domain::ports::ConnectionProvider;
    use crate::infrastructure::config::EndpointConfig;
    use crate::infrastructure::memory::{MemoryProvider, MemoryTable};
    use serde_json::json;

    fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.into(),
            driver: "memory".into(),
            host: String::new(),
            port: None,
            user: String::new(),
            password: String::new(),
            database: name.into(),
        }
    }

    fn provider(rows: usize) -> MemoryProvider {
        let p = MemoryProvider::new();
        let rows = (1..=rows).map(|i| json!({"id": i, "v": format!("r{}", i)})).collect();
        p.create_table(
            "local",
            "t",
            MemoryTable::new(&[("id", "int"), ("v", "text")], "id").with_rows(rows),
        );
        p.create_table("remote", "t", MemoryTable::new(&[("id", "int"), ("v", "text")], "id"));
        p
    }

    #[tokio::test]
    async fn export_then_import_copies_rows_in_chunks() {
        let p = provider(7);
        let bulk = NdjsonBulkTransfer::new().with_chunk_size(3);
        let table = TableName::new("t");
        let mut src = p.open(&endpoint("local")).await.unwrap();
        let mut dst = p.open(&endpoint("remote")).await.unwrap();

        let file = bulk.export(src.as_mut(), &table, 100).await.unwrap();
        assert_eq!(file.rows, 7);

        assert_eq!(bulk.import(dst.as_mut(), &table, &file, true).await.unwrap(), 7);
        assert_eq!(p.write_attempts("remote", "t"), 0);

        assert_eq!(bulk.import(dst.as_mut(), &table, &file, false).await.unwrap(), 7);
        assert_eq!(p.write_attempts("remote", "t"), 3);
        dst.commit().await.unwrap();
        assert_eq!(p.rows("remote", "t").len(), 7);
    }

    #[tokio::test]
    async fn exact_multiple_of_the_chunk_size_sends_no_empty_chunk() {
        let p = provider(6);
        let bulk = NdjsonBulkTransfer::new().with_chunk_size(3);
        let table = TableName::new("t");
        let mut src = p.open(&endpoint("local")).await.unwrap();
        let mut dst = p.open(&endpoint("remote")).await.unwrap();

        let file = bulk.export(src.as_mut(), &table, 100).await.unwrap();
        assert_eq!(bulk.import(dst.as_mut(), &table, &file, false).await.unwrap(), 6);
        assert_eq!(p.write_attempts("remote", "t"), 2);
    }

    #[tokio::test]
    async fn empty_table_imports_nothing() {
        let p = provider(0);
        let bulk = NdjsonBulkTransfer::new();
        let table = TableName::new("t");
        let mut src = p.open(&endpoint("local")).await.unwrap();
        let mut dst = p.open(&endpoint("remote")).await.unwrap();

        let file = bulk.export(src.as_mut(), &table, 100).await.unwrap();
        assert_eq!(bulk.import(dst.as_mut(), &table, &file, false).await.unwrap(), 0);
        assert_eq!(p.write_attempts("remote", "t"), 0);
    }

    #[tokio::test]
    async fn failing_chunk_stops_the_import() {
        let p = provider(5);
        p.fail_write_after("remote", "t", ErrorKind::Query, 1);
        let bulk = NdjsonBulkTransfer::new().with_chunk_size(2);
        let table = TableName::new("t");
        let mut src = p.open(&endpoint("local")).await.unwrap();
        let mut dst = p.open(&endpoint("remote")).await.unwrap();

        let file = bulk.export(src.as_mut(), &table, 100).await.unwrap();
        let err = bulk.import(dst.as_mut(), &table, &file, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(p.write_attempts("remote", "t"), 2);
    }
}
