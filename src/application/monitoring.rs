use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, instrument};

use crate::domain::changeset::{ChangeSet, RowMap};
use crate::domain::error::SyncResult;
use crate::domain::ports::{ConnectionProvider, Differ, Session, SessionCloser};
use crate::domain::schema::TableStructure;
use crate::domain::snapshot::RowSnapshot;
use crate::domain::statement::Statement;
use crate::domain::value_objects::{ColumnName, Fingerprint, TableName};
use crate::infrastructure::config::EndpointConfig;

// ─── PerfReport ──────────────────────────────────────────────────────────────

/// A single timed operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OpTiming {
    /// "fetch_rows", "diff_table" or "apply".
    pub operation: &'static str,
    pub table: String,
    /// Endpoint the operation ran against, empty for pure computations.
    pub endpoint: String,
    pub duration_ms: u128,
    /// Rows fetched, compared or written.
    pub rows: usize,
}

/// Accumulated timings for one sync run.
///
/// Shared across all decorator instances of a run via `Arc<Mutex<_>>`.
/// After the run, pass to `print_perf_summary` (cli feature) to render it.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct PerfReport {
    pub timings: Vec<OpTiming>,
    pub total_rows_fetched: usize,
    pub total_ms: u128,
}

impl PerfReport {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn record(report: &Arc<Mutex<Self>>, timing: OpTiming) {
        if let Ok(mut r) = report.lock() {
            r.total_ms += timing.duration_ms;
            if timing.operation == "fetch_rows" {
                r.total_rows_fetched += timing.rows;
            }
            r.timings.push(timing);
        }
    }

    /// Copy of the current state, for printing or serialising.
    pub fn snapshot(report: &Arc<Mutex<Self>>) -> Self {
        report.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

// ─── MonitoringProvider / MonitoringSession ──────────────────────────────────

/// Decorator: wraps any `ConnectionProvider` so that every session it opens
/// times its `fetch_rows` calls into the shared `PerfReport`.
pub struct MonitoringProvider {
    inner: Arc<dyn ConnectionProvider>,
    report: Arc<Mutex<PerfReport>>,
}

impl MonitoringProvider {
    pub fn new(inner: Arc<dyn ConnectionProvider>, report: Arc<Mutex<PerfReport>>) -> Self {
        Self { inner, report }
    }
}

#[async_trait]
impl ConnectionProvider for MonitoringProvider {
    async fn open(&self, endpoint: &EndpointConfig) -> SyncResult<Box<dyn Session>> {
        let inner = self.inner.open(endpoint).await?;
        Ok(Box::new(MonitoringSession {
            inner,
            report: Arc::clone(&self.report),
        }))
    }
}

pub struct MonitoringSession {
    inner: Box<dyn Session>,
    report: Arc<Mutex<PerfReport>>,
}

#[async_trait]
impl Session for MonitoringSession {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn closer(&self) -> Arc<dyn SessionCloser> {
        self.inner.closer()
    }

    async fn list_tables(&mut self) -> SyncResult<Vec<TableName>> {
        self.inner.list_tables().await
    }

    async fn row_count(&mut self, table: &TableName) -> SyncResult<u64> {
        self.inner.row_count(table).await
    }

    async fn checksum(&mut self, table: &TableName) -> SyncResult<Fingerprint> {
        self.inner.checksum(table).await
    }

    async fn table_structure(&mut self, table: &TableName) -> SyncResult<TableStructure> {
        self.inner.table_structure(table).await
    }

    async fn table_collation(&mut self, table: &TableName) -> SyncResult<Option<String>> {
        self.inner.table_collation(table).await
    }

    async fn primary_key(&mut self, table: &TableName) -> SyncResult<ColumnName> {
        self.inner.primary_key(table).await
    }

    #[instrument(
        name = "fetch_rows",
        skip(self, table),
        fields(db.endpoint = %self.inner.endpoint(), db.table = %table.0),
        level = "info"
    )]
    async fn fetch_rows(&mut self, table: &TableName, max_rows: usize) -> SyncResult<Vec<RowMap>> {
        let start = Instant::now();
        let rows = self.inner.fetch_rows(table, max_rows).await?;
        let duration_ms = start.elapsed().as_millis();

        info!(table = %table.0, rows = rows.len(), duration_ms, "fetch_rows completed");

        PerfReport::record(
            &self.report,
            OpTiming {
                operation: "fetch_rows",
                table: table.0.clone(),
                endpoint: self.inner.endpoint().to_string(),
                duration_ms,
                rows: rows.len(),
            },
        );

        Ok(rows)
    }

    async fn execute(&mut self, statement: &Statement) -> SyncResult<u64> {
        self.inner.execute(statement).await
    }

    async fn commit(&mut self) -> SyncResult<()> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> SyncResult<()> {
        self.inner.rollback().await
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

// ─── MonitoringDiffer ────────────────────────────────────────────────────────

/// Decorator: wraps any `Differ`, measures wall time per `diff_table` call,
/// and appends the result to the shared `PerfReport`.
pub struct MonitoringDiffer {
    inner: Arc<dyn Differ>,
    report: Arc<Mutex<PerfReport>>,
}

impl MonitoringDiffer {
    pub fn new(inner: Arc<dyn Differ>, report: Arc<Mutex<PerfReport>>) -> Self {
        Self { inner, report }
    }
}

impl Differ for MonitoringDiffer {
    #[instrument(
        name = "diff_table",
        skip(self, source, dest),
        fields(
            db.table = %source.table(),
            source.rows = source.len(),
            dest.rows = dest.len(),
        ),
        level = "info"
    )]
    fn diff_table(&self, source: &RowSnapshot, dest: &RowSnapshot) -> ChangeSet {
        let start = Instant::now();
        let result = self.inner.diff_table(source, dest);
        let duration_ms = start.elapsed().as_millis();

        info!(
            table = %source.table(),
            source_rows = source.len(),
            dest_rows = dest.len(),
            upserts = result.upserts.len(),
            deletes = result.deletes.len(),
            duration_ms,
            "diff_table completed"
        );

        PerfReport::record(
            &self.report,
            OpTiming {
                operation: "diff_table",
                table: source.table().0.clone(),
                endpoint: String::new(),
                duration_ms,
                rows: source.len() + dest.len(),
            },
        );

        result
    }
}
