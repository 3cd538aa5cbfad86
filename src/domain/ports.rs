use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::domain::{
    changeset::{ChangeSet, RowMap},
    error::SyncResult,
    report::SyncReport,
    schema::TableStructure,
    snapshot::RowSnapshot,
    statement::Statement,
    value_objects::{ColumnName, Fingerprint, TableName},
};
use crate::infrastructure::config::EndpointConfig;

/// Port: opens sessions to an endpoint (implemented by `SqlxProvider`, `MemoryProvider`)
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn open(&self, endpoint: &EndpointConfig) -> SyncResult<Box<dyn Session>>;
}

/// Port: one open connection to one endpoint.
///
/// Writes happen inside a transaction made durable by [`Session::commit`];
/// DDL takes effect immediately. A session is owned by exactly one unit of
/// work and never shared.
#[async_trait]
pub trait Session: Send {
    /// Endpoint label ("local" / "remote").
    fn endpoint(&self) -> &str;

    /// Handle that can close this session from outside its owner.
    fn closer(&self) -> Arc<dyn SessionCloser>;

    async fn list_tables(&mut self) -> SyncResult<Vec<TableName>>;

    async fn row_count(&mut self, table: &TableName) -> SyncResult<u64>;

    /// Whole-table checksum; only comparable between sessions of the same driver.
    async fn checksum(&mut self, table: &TableName) -> SyncResult<Fingerprint>;

    async fn table_structure(&mut self, table: &TableName) -> SyncResult<TableStructure>;

    /// Table-level collation, `None` when the driver has no such notion.
    async fn table_collation(&mut self, table: &TableName) -> SyncResult<Option<String>>;

    /// The single primary-key column of `table`.
    async fn primary_key(&mut self, table: &TableName) -> SyncResult<ColumnName>;

    /// Read every row, failing with `SnapshotTooLarge` past `max_rows`.
    async fn fetch_rows(&mut self, table: &TableName, max_rows: usize) -> SyncResult<Vec<RowMap>>;

    /// Execute one statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &Statement) -> SyncResult<u64>;

    async fn commit(&mut self) -> SyncResult<()>;

    /// Discard every uncommitted write; the session stays open.
    async fn rollback(&mut self) -> SyncResult<()>;

    /// Roll back anything uncommitted and release the connection. Further
    /// calls on a closed session fail with a connection error.
    async fn close(&mut self);
}

/// Port: out-of-band close of a session (used on interrupt).
#[async_trait]
pub trait SessionCloser: Send + Sync {
    async fn close(&self);
}

/// Port: row-level diff algorithm (implemented by TableDiffer)
pub trait Differ: Send + Sync {
    fn diff_table(&self, source: &RowSnapshot, dest: &RowSnapshot) -> ChangeSet;
}

/// Port: bulk copy of a whole table through a local file.
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    /// Dump every row of `table` to a file.
    async fn export(&self, session: &mut dyn Session, table: &TableName, max_rows: usize)
        -> SyncResult<BulkFile>;

    /// Upsert every row of `file` into `table`; returns rows written.
    async fn import(
        &self,
        session: &mut dyn Session,
        table: &TableName,
        file: &BulkFile,
        dry_run: bool,
    ) -> SyncResult<u64>;
}

/// Temporary file produced by [`BulkTransfer::export`], removed on drop.
pub struct BulkFile {
    file: tempfile::NamedTempFile,
    pub rows: usize,
}

impl BulkFile {
    pub fn new(file: tempfile::NamedTempFile, rows: usize) -> Self {
        Self { file, rows }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

/// Port: run-report formatting (implemented by JsonWriter)
pub trait ReportWriter: Send + Sync {
    /// Serializes the report to a string.
    fn format(&self, report: &SyncReport) -> Result<String>;
    /// Extension of the produced file (e.g. "json")
    fn extension(&self) -> &'static str;
}
