//! Sync Orchestrator.
//!
//! A run enumerates the tables present on both endpoints and processes each
//! one independently, at most `pool_size` at a time when `parallel` is set.
//! Per table it opens one session per endpoint and runs the requested passes
//! in order (push, then pull for `both`), each pass being
//! DETECT → RECONCILE → DIFF → APPLY. Failures are contained: a table that
//! cannot be processed is reported and the run moves on.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::application::apply::{ApplyOptions, BatchApplier};
use crate::application::detect::has_changed;
use crate::application::diff::{diff, TableDiffer};
use crate::application::monitoring::{MonitoringDiffer, MonitoringProvider, OpTiming, PerfReport};
use crate::application::reconcile::reconcile_structure;
use crate::application::registry::ConnectionRegistry;
use crate::domain::error::{SyncError, SyncResult};
use crate::domain::ports::{BulkTransfer, ConnectionProvider, Differ, Session};
use crate::domain::report::{PassReport, StatementCounts, SyncReport, TableReport};
use crate::domain::value_objects::{Direction, Pass, TableName};
use crate::infrastructure::bulk::NdjsonBulkTransfer;
use crate::infrastructure::config::{AppConfig, EndpointConfig, SyncSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    /// Full pass: detect, reconcile, diff, apply.
    Sync,
    /// Reconcile structure only.
    Structure,
}

struct Run {
    config: AppConfig,
    direction: Direction,
    job: Job,
}

#[derive(Clone)]
pub struct SyncEngine {
    provider: Arc<dyn ConnectionProvider>,
    differ: Arc<dyn Differ>,
    bulk: Arc<dyn BulkTransfer>,
    registry: Arc<ConnectionRegistry>,
    perf: Option<Arc<Mutex<PerfReport>>>,
}

impl SyncEngine {
    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            provider,
            differ: Arc::new(TableDiffer::new()),
            bulk: Arc::new(NdjsonBulkTransfer::new()),
            registry: ConnectionRegistry::new(),
            perf: None,
        }
    }

    pub fn with_differ(mut self, differ: Arc<dyn Differ>) -> Self {
        self.differ = differ;
        self
    }

    pub fn with_bulk(mut self, bulk: Arc<dyn BulkTransfer>) -> Self {
        self.bulk = bulk;
        self
    }

    pub fn with_registry(mut self, registry: Arc<ConnectionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Time row fetches, diffs and applies into `report`.
    ///
    /// Wraps the provider and differ configured so far; call it last.
    pub fn with_perf(mut self, report: Arc<Mutex<PerfReport>>) -> Self {
        self.provider = Arc::new(MonitoringProvider::new(self.provider, Arc::clone(&report)));
        self.differ = Arc::new(MonitoringDiffer::new(self.differ, Arc::clone(&report)));
        self.perf = Some(report);
        self
    }

    /// Registry tracking every session this engine opens.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Synchronize every table common to both endpoints.
    ///
    /// Fails only when the endpoints cannot be enumerated; every per-table
    /// problem ends up in the returned report.
    pub async fn sync_tables(&self, config: &AppConfig, direction: Direction) -> SyncResult<SyncReport> {
        self.run(config, direction, Job::Sync).await
    }

    /// Reconcile the structure of every common table without touching rows.
    pub async fn reconcile_tables(&self, config: &AppConfig, direction: Direction) -> SyncResult<SyncReport> {
        self.run(config, direction, Job::Structure).await
    }

    async fn run(&self, config: &AppConfig, direction: Direction, job: Job) -> SyncResult<SyncReport> {
        let started_at = Utc::now();
        let settings = &config.settings;
        let tables = self.enumerate(&config.local, &config.remote).await?;
        info!(
            direction = %direction,
            tables = tables.len(),
            structure_only = job == Job::Structure,
            dry_run = settings.dry_run,
            parallel = settings.parallel,
            "sync started"
        );

        let run = Arc::new(Run {
            config: config.clone(),
            direction,
            job,
        });

        let reports: Vec<TableReport> = if settings.parallel && tables.len() > 1 {
            stream::iter(tables)
                .map(|table| {
                    let engine = self.clone();
                    let run = Arc::clone(&run);
                    let name = table.0.clone();
                    async move {
                        let handle =
                            tokio::spawn(async move { engine.process_table(&table, &run).await });
                        match handle.await {
                            Ok(report) => report,
                            Err(e) => {
                                error!(table = %name, error = %e, "table worker failed");
                                TableReport::failed(&name, format!("worker failed: {e}"))
                            }
                        }
                    }
                })
                .buffer_unordered(settings.pool_size.max(1))
                .collect()
                .await
        } else {
            let mut reports = Vec::with_capacity(tables.len());
            for table in &tables {
                reports.push(self.process_table(table, &run).await);
            }
            reports
        };

        let report = SyncReport::new(direction, settings.dry_run, started_at, reports);
        let s = &report.summary;
        info!(
            run_id = %report.run_id,
            tables = s.tables_total,
            changed = s.tables_changed,
            failed = s.tables_failed,
            schema_changes = s.schema_changes,
            upserts = s.upserts_applied,
            deletes = s.deletes_applied,
            "sync finished"
        );
        Ok(report)
    }

    /// Tables present on both endpoints, in local order.
    async fn enumerate(&self, local: &EndpointConfig, remote: &EndpointConfig) -> SyncResult<Vec<TableName>> {
        let mut local_session = self.registry.open(self.provider.as_ref(), local).await?;
        let mut remote_session = match self.registry.open(self.provider.as_ref(), remote).await {
            Ok(s) => s,
            Err(e) => {
                local_session.close().await;
                return Err(e);
            }
        };

        let listed = async {
            let local_tables = local_session.session.list_tables().await?;
            let remote_tables = remote_session.session.list_tables().await?;
            Ok::<_, SyncError>((local_tables, remote_tables))
        }
        .await;
        local_session.close().await;
        remote_session.close().await;

        let (local_tables, remote_tables) = listed?;
        for table in local_tables.iter().filter(|t| !remote_tables.contains(t)) {
            debug!(table = %table, "table only on local; skipped");
        }
        for table in remote_tables.iter().filter(|t| !local_tables.contains(t)) {
            debug!(table = %table, "table only on remote; skipped");
        }
        Ok(local_tables
            .into_iter()
            .filter(|t| remote_tables.contains(t))
            .collect())
    }

    #[instrument(name = "sync_table", skip(self, run), fields(table = %table))]
    async fn process_table(&self, table: &TableName, run: &Run) -> TableReport {
        let cfg = &run.config;
        let mut local = match self.registry.open(self.provider.as_ref(), &cfg.local).await {
            Ok(s) => s,
            Err(e) => {
                error!(endpoint = %cfg.local.name, error = %e, "cannot open session; table skipped");
                return TableReport::failed(&table.0, e);
            }
        };
        let mut remote = match self.registry.open(self.provider.as_ref(), &cfg.remote).await {
            Ok(s) => s,
            Err(e) => {
                error!(endpoint = %cfg.remote.name, error = %e, "cannot open session; table skipped");
                local.close().await;
                return TableReport::failed(&table.0, e);
            }
        };

        let mut report = TableReport::new(&table.0);
        for pass in run.direction.passes() {
            let pass_report = match pass {
                Pass::Push => {
                    self.run_pass(*pass, local.session.as_mut(), remote.session.as_mut(), &cfg.remote, table, run)
                        .await
                }
                Pass::Pull => {
                    self.run_pass(*pass, remote.session.as_mut(), local.session.as_mut(), &cfg.local, table, run)
                        .await
                }
            };
            report.passes.push(pass_report);
        }

        local.close().await;
        remote.close().await;
        report
    }

    #[instrument(
        name = "sync_pass",
        skip(self, source, dest, dest_endpoint, table, run),
        fields(table = %table, pass = %pass)
    )]
    async fn run_pass(
        &self,
        pass: Pass,
        source: &mut dyn Session,
        dest: &mut dyn Session,
        dest_endpoint: &EndpointConfig,
        table: &TableName,
        run: &Run,
    ) -> PassReport {
        let settings = &run.config.settings;
        let mut report = PassReport::new(pass, source.endpoint(), dest.endpoint());

        if run.job == Job::Sync {
            report.changed = has_changed(source, dest, table).await;
        }

        match reconcile_structure(source, dest, table, settings.dry_run).await {
            Ok(schema) => report.schema = schema,
            Err(e) => {
                error!(kind = ?e.kind(), error = %e, "cannot read table structure; pass aborted");
                report.error = Some(e.to_string());
                return report;
            }
        }

        if run.job == Job::Structure {
            return report;
        }
        if !report.changed {
            debug!("no change detected");
            return report;
        }

        let mut changes = match diff(source, dest, table, settings.max_snapshot_rows, self.differ.as_ref()).await {
            Ok(changes) => changes,
            Err(e) => {
                error!(kind = ?e.kind(), error = %e, "diff failed; table skipped");
                report.error = Some(e.to_string());
                return report;
            }
        };
        if changes.is_empty() {
            debug!("snapshots already equal");
            return report;
        }

        if settings.threshold > 0 && changes.upserts.len() > settings.threshold {
            info!(upserts = changes.upserts.len(), threshold = settings.threshold, "using bulk transfer");
            match self.bulk_copy(source, dest, table, settings).await {
                Ok(rows) => {
                    debug!(rows, "bulk transfer finished");
                    let n = changes.upserts.len();
                    report.bulk = true;
                    report.apply.upserts = StatementCounts {
                        planned: n,
                        applied: n,
                        abandoned: 0,
                    };
                    changes.upserts.clear();
                }
                Err(e) => {
                    warn!(error = %e, "bulk transfer failed; applying row by row");
                }
            }
        }

        let opts = ApplyOptions::from(settings);
        let applier = BatchApplier::new(Arc::clone(&self.provider), Arc::clone(&self.registry));
        let started = Instant::now();
        let applied = applier.apply(dest, dest_endpoint, &changes, &opts).await;
        if let Some(perf) = &self.perf {
            PerfReport::record(
                perf,
                OpTiming {
                    operation: "apply",
                    table: table.0.clone(),
                    endpoint: dest.endpoint().to_string(),
                    duration_ms: started.elapsed().as_millis(),
                    rows: changes.len(),
                },
            );
        }

        match applied {
            Ok(apply) => report.apply.merge(&apply),
            Err(e) => {
                error!(kind = ?e.kind(), error = %e, "apply failed");
                report.error = Some(e.to_string());
            }
        }
        report
    }

    /// Copy the whole source table into the destination through a file.
    /// A failed import is rolled back, leaving the destination transaction
    /// empty for the row-by-row fallback.
    async fn bulk_copy(
        &self,
        source: &mut dyn Session,
        dest: &mut dyn Session,
        table: &TableName,
        settings: &SyncSettings,
    ) -> SyncResult<u64> {
        let file = self.bulk.export(source, table, settings.max_snapshot_rows).await?;
        let written = match self.bulk.import(dest, table, &file, settings.dry_run).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(rollback) = dest.rollback().await {
                    warn!(error = %rollback, "cannot roll back partial bulk import");
                }
                return Err(e);
            }
        };
        if !settings.dry_run {
            dest.commit().await?;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::changeset::RowMap;
    use crate::domain::error::ErrorKind;
    use crate::domain::schema::SchemaChange;
    use crate::domain::value_objects::ColumnName;
    use crate::infrastructure::memory::{MemoryProvider, MemoryTable};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn config(settings: SyncSettings) -> AppConfig {
        AppConfig {
            local: endpoint("local"),
            remote: endpoint("remote"),
            settings,
        }
    }

    fn settings() -> SyncSettings {
        SyncSettings {
            retry_delay_ms: 0,
            ..SyncSettings::default()
        }
    }

    fn t(rows: Vec<Value>) -> MemoryTable {
        MemoryTable::new(&[("id", "int"), ("v", "varchar(10)")], "id").with_rows(rows)
    }

    /// Source {(1,"a"), (2,"b")}, destination {(1,"a"), (3,"c")}.
    fn t_scenario() -> MemoryProvider {
        let p = MemoryProvider::new();
        p.create_table("local", "t", t(vec![json!({"id": 1, "v": "a"}), json!({"id": 2, "v": "b"})]));
        p.create_table("remote", "t", t(vec![json!({"id": 1, "v": "a"}), json!({"id": 3, "v": "c"})]));
        p
    }

    fn pairs(rows: &[RowMap]) -> Vec<(Value, Value)> {
        rows.iter().map(|r| (r["id"].clone(), r["v"].clone())).collect()
    }

    async fn sync(p: &MemoryProvider, s: SyncSettings, direction: Direction) -> SyncReport {
        SyncEngine::new(Arc::new(p.clone()))
            .sync_tables(&config(s), direction)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn push_upserts_missing_rows_and_deletes_extra_ones() {
        let p = t_scenario();
        let report = sync(&p, settings(), Direction::Push).await;

        assert_eq!(
            pairs(&p.rows("remote", "t")),
            vec![(json!(1), json!("a")), (json!(2), json!("b"))]
        );
        assert_eq!(p.rows("local", "t").len(), 2);
        assert_eq!(report.summary.upserts_applied, 1);
        assert_eq!(report.summary.deletes_applied, 1);
        assert_eq!(report.summary.tables_changed, 1);
    }

    #[tokio::test]
    async fn push_without_delete_missing_keeps_destination_rows() {
        let p = t_scenario();
        let s = SyncSettings {
            delete_missing: false,
            ..settings()
        };
        let report = sync(&p, s, Direction::Push).await;

        assert_eq!(
            pairs(&p.rows("remote", "t")),
            vec![(json!(1), json!("a")), (json!(2), json!("b")), (json!(3), json!("c"))]
        );
        assert_eq!(report.summary.deletes_applied, 0);
    }

    #[tokio::test]
    async fn pull_writes_into_local() {
        let p = t_scenario();
        sync(&p, settings(), Direction::Pull).await;

        assert_eq!(
            pairs(&p.rows("local", "t")),
            vec![(json!(1), json!("a")), (json!(3), json!("c"))]
        );
    }

    #[tokio::test]
    async fn both_without_deletes_converges_to_the_union() {
        let p = t_scenario();
        let s = SyncSettings {
            delete_missing: false,
            ..settings()
        };
        let report = sync(&p, s, Direction::Both).await;

        let union = vec![(json!(1), json!("a")), (json!(2), json!("b")), (json!(3), json!("c"))];
        assert_eq!(pairs(&p.rows("remote", "t")), union);
        assert_eq!(pairs(&p.rows("local", "t")), union);
        assert_eq!(report.tables[0].passes.len(), 2);
    }

    #[tokio::test]
    async fn both_with_deletes_lets_the_push_win() {
        let p = t_scenario();
        let report = sync(&p, settings(), Direction::Both).await;

        assert_eq!(pairs(&p.rows("remote", "t")), pairs(&p.rows("local", "t")));
        let passes = &report.tables[0].passes;
        assert!(passes[0].changed);
        assert!(!passes[1].changed);
    }

    #[tokio::test]
    async fn second_run_finds_nothing_to_do() {
        let p = t_scenario();
        sync(&p, settings(), Direction::Push).await;
        let attempts = p.write_attempts("remote", "t");

        let report = sync(&p, settings(), Direction::Push).await;

        assert_eq!(report.summary.tables_changed, 0);
        assert_eq!(p.write_attempts("remote", "t"), attempts);
    }

    #[tokio::test]
    async fn missing_decimal_column_is_added_then_populated() {
        let p = MemoryProvider::new();
        p.create_table(
            "local",
            "t",
            MemoryTable::new(&[("id", "int"), ("amount", "decimal(10,2)")], "id")
                .with_rows(vec![json!({"id": 1, "amount": "10.50"}), json!({"id": 2, "amount": "3.25"})]),
        );
        p.create_table(
            "remote",
            "t",
            MemoryTable::new(&[("id", "int")], "id").with_rows(vec![json!({"id": 1}), json!({"id": 2})]),
        );

        let report = sync(&p, settings(), Direction::Push).await;

        let pass = &report.tables[0].passes[0];
        assert_eq!(
            pass.schema.applied,
            vec![SchemaChange::AddColumn {
                column: ColumnName::new("amount"),
                declared_type: "decimal(10,2)".into(),
            }]
        );
        let remote = p.rows("remote", "t");
        assert_eq!(remote[0]["amount"], json!(10.5));
        assert_eq!(remote[1]["amount"], json!(3.25));

        let again = sync(&p, settings(), Direction::Push).await;
        assert_eq!(again.summary.upserts_applied, 0);
        assert!(again.tables[0].passes[0].schema.applied.is_empty());
    }

    #[tokio::test]
    async fn dry_run_leaves_both_sides_untouched() {
        let p = t_scenario();
        p.create_table(
            "local",
            "u",
            MemoryTable::new(&[("id", "int"), ("extra", "text")], "id").with_rows(vec![json!({"id": 1, "extra": "x"})]),
        );
        p.create_table("remote", "u", MemoryTable::new(&[("id", "int")], "id"));
        let local_before = (p.rows("local", "t"), p.table("local", "u").map(|t| t.structure));
        let remote_before = (p.rows("remote", "t"), p.table("remote", "u").map(|t| t.structure));

        let s = SyncSettings {
            dry_run: true,
            ..settings()
        };
        let report = sync(&p, s, Direction::Both).await;

        assert!(report.dry_run);
        assert_eq!((p.rows("local", "t"), p.table("local", "u").map(|t| t.structure)), local_before);
        assert_eq!((p.rows("remote", "t"), p.table("remote", "u").map(|t| t.structure)), remote_before);
        assert_eq!(p.write_attempts("remote", "t"), 0);
        assert_eq!(report.summary.schema_changes, 1);
        assert!(report.summary.upserts_applied > 0);
    }

    #[tokio::test]
    async fn contention_exhausting_retries_is_reported() {
        let p = t_scenario();
        p.fail_writes("remote", "t", ErrorKind::Contention, usize::MAX);

        let report = sync(&p, settings(), Direction::Push).await;

        assert_eq!(report.summary.upserts_abandoned, 1);
        assert_eq!(report.summary.deletes_abandoned, 1);
        assert_eq!(p.write_attempts("remote", "t"), 6);
        assert_eq!(p.rows("remote", "t").len(), 2);
    }

    #[tokio::test]
    async fn composite_key_table_is_skipped_and_others_continue() {
        let p = t_scenario();
        let columns = [("a", "int"), ("b", "int")];
        p.create_table(
            "local",
            "pairs",
            MemoryTable::new(&columns, "a")
                .with_rows(vec![json!({"a": 1, "b": 1})])
                .with_primary_key(&["a", "b"]),
        );
        p.create_table(
            "remote",
            "pairs",
            MemoryTable::new(&columns, "a").with_primary_key(&["a", "b"]),
        );

        let report = sync(&p, settings(), Direction::Push).await;

        let pairs_report = report.tables.iter().find(|t| t.table == "pairs").unwrap();
        assert!(pairs_report.has_errors());
        assert_eq!(report.summary.tables_failed, 1);
        assert_eq!(p.rows("remote", "t").len(), 2);
        assert_eq!(report.summary.upserts_applied, 1);
    }

    #[tokio::test]
    async fn tables_only_on_one_side_are_ignored() {
        let p = t_scenario();
        p.create_table("local", "only_local", t(vec![json!({"id": 9, "v": "z"})]));

        let report = sync(&p, settings(), Direction::Push).await;

        assert_eq!(report.summary.tables_total, 1);
        assert!(p.table("remote", "only_local").is_none());
    }

    #[tokio::test]
    async fn parallel_tables_all_sync_and_release_sessions() {
        let p = MemoryProvider::new();
        for name in ["a", "b", "c", "d"] {
            p.create_table("local", name, t(vec![json!({"id": 1, "v": name}), json!({"id": 2, "v": "y"})]));
            p.create_table("remote", name, t(vec![]));
        }
        let engine = SyncEngine::new(Arc::new(p.clone()));
        let s = SyncSettings {
            parallel: true,
            pool_size: 2,
            batch_size: 1,
            ..settings()
        };

        let report = engine.sync_tables(&config(s), Direction::Push).await.unwrap();

        assert_eq!(report.summary.tables_changed, 4);
        assert_eq!(report.summary.upserts_applied, 8);
        for name in ["a", "b", "c", "d"] {
            assert_eq!(p.rows("remote", name).len(), 2);
        }
        assert_eq!(engine.registry().open_count(), 0);
    }

    #[tokio::test]
    async fn bulk_fallback_replaces_row_by_row_upserts() {
        let p = MemoryProvider::new();
        let rows = (1..=6).map(|i| json!({"id": i, "v": "x"})).collect();
        p.create_table("local", "t", t(rows));
        p.create_table("remote", "t", t(vec![json!({"id": 99, "v": "gone"})]));
        let s = SyncSettings {
            threshold: 3,
            ..settings()
        };

        let report = sync(&p, s, Direction::Push).await;

        let pass = &report.tables[0].passes[0];
        assert!(pass.bulk);
        assert_eq!(pass.apply.upserts.applied, 6);
        assert_eq!(pass.apply.deletes.applied, 1);
        let ids: Vec<Value> = p.rows("remote", "t").iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, (1..=6).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failed_bulk_import_is_rolled_back_before_row_by_row_apply() {
        let p = MemoryProvider::new();
        let rows = (1..=6).map(|i| json!({"id": i, "v": "x"})).collect();
        p.create_table("local", "t", t(rows));
        p.create_table("remote", "t", t(vec![json!({"id": 99, "v": "gone"})]));
        // Second bulk chunk fails, then the first row-by-row upsert (id 1).
        p.fail_write_after("remote", "t", ErrorKind::Query, 1);
        p.fail_write_after("remote", "t", ErrorKind::Query, 0);
        let s = SyncSettings {
            threshold: 3,
            ..settings()
        };

        let report = SyncEngine::new(Arc::new(p.clone()))
            .with_bulk(Arc::new(NdjsonBulkTransfer::new().with_chunk_size(2)))
            .sync_tables(&config(s), Direction::Push)
            .await
            .unwrap();

        let pass = &report.tables[0].passes[0];
        assert!(!pass.bulk);
        assert_eq!(pass.apply.upserts.applied, 5);
        assert_eq!(pass.apply.upserts.abandoned, 1);
        // Row 1 from the first bulk chunk did not survive the rollback.
        let ids: Vec<Value> = p.rows("remote", "t").iter().map(|r| r["id"].clone()).collect();
        assert_eq!(ids, (2..=6).map(|i| json!(i)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn structure_only_run_leaves_rows_alone() {
        let p = MemoryProvider::new();
        p.create_table(
            "local",
            "t",
            MemoryTable::new(&[("id", "int"), ("note", "text")], "id").with_rows(vec![json!({"id": 1, "note": "n"})]),
        );
        p.create_table("remote", "t", MemoryTable::new(&[("id", "int")], "id"));

        let report = SyncEngine::new(Arc::new(p.clone()))
            .reconcile_tables(&config(settings()), Direction::Push)
            .await
            .unwrap();

        assert_eq!(report.summary.schema_changes, 1);
        assert!(p.table("remote", "t").unwrap().structure.contains("note"));
        assert!(p.rows("remote", "t").is_empty());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails_the_run() {
        let p = t_scenario();
        p.set_unreachable("remote");

        let result = SyncEngine::new(Arc::new(p.clone()))
            .sync_tables(&config(settings()), Direction::Push)
            .await;

        assert!(matches!(result, Err(SyncError::Connection { .. })));
    }

    /// Lets the first `allowed` remote sessions open, refuses the rest.
    struct FlakyProvider {
        inner: MemoryProvider,
        allowed: usize,
        remote_opens: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionProvider for FlakyProvider {
        async fn open(&self, endpoint: &EndpointConfig) -> SyncResult<Box<dyn Session>> {
            if endpoint.name == "remote" && self.remote_opens.fetch_add(1, Ordering::SeqCst) >= self.allowed {
                return Err(SyncError::Connection {
                    endpoint: endpoint.name.clone(),
                    message: "too many connections".into(),
                });
            }
            self.inner.open(endpoint).await
        }
    }

    #[tokio::test]
    async fn table_whose_session_cannot_open_is_skipped() {
        let p = t_scenario();
        p.create_table("local", "u", t(vec![json!({"id": 5, "v": "e"})]));
        p.create_table("remote", "u", t(vec![]));
        // enumeration plus the first table
        let provider = FlakyProvider {
            inner: p.clone(),
            allowed: 2,
            remote_opens: AtomicUsize::new(0),
        };
        let engine = SyncEngine::new(Arc::new(provider));

        let report = engine.sync_tables(&config(settings()), Direction::Push).await.unwrap();

        assert_eq!(report.summary.tables_total, 2);
        assert_eq!(report.summary.tables_failed, 1);
        let failed = report.tables.iter().find(|t| t.error.is_some()).unwrap();
        assert_eq!(failed.table, "u");
        assert_eq!(p.rows("remote", "t").len(), 2);
        assert!(p.rows("remote", "u").is_empty());
        assert_eq!(engine.registry().open_count(), 0);
    }

    #[tokio::test]
    async fn perf_report_collects_fetch_diff_and_apply_timings() {
        let p = t_scenario();
        let perf = PerfReport::new();
        let engine = SyncEngine::new(Arc::new(p.clone())).with_perf(Arc::clone(&perf));

        engine.sync_tables(&config(settings()), Direction::Push).await.unwrap();

        let perf = PerfReport::snapshot(&perf);
        let ops: Vec<&str> = perf.timings.iter().map(|t| t.operation).collect();
        assert_eq!(ops.iter().filter(|o| **o == "fetch_rows").count(), 2);
        assert!(ops.contains(&"diff_table"));
        assert!(ops.contains(&"apply"));
        assert_eq!(perf.total_rows_fetched, 4);
    }
}
