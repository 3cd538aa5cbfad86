//! Batch Applier: turns a change set into upserts and deletes on the
//! destination, with bounded retry on lock contention.
//!
//! Sequential mode runs every batch on the table's destination session and
//! commits once at the end. Parallel mode gives each batch its own session
//! (opened through the provider, tracked by the run's registry) and commits
//! it when the batch ends. Either way a batch that fails partway keeps the
//! statements it already applied: apply is at-least-once, never atomic.
//! The one exception is a transaction the server rolled back and the session
//! could not rebuild: everything applied since the last commit is then
//! counted as abandoned.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::application::registry::ConnectionRegistry;
use crate::domain::changeset::ChangeSet;
use crate::domain::coercion::{prepare_predicate, prepare_row};
use crate::domain::error::{ErrorKind, SyncResult};
use crate::domain::ports::{ConnectionProvider, Session};
use crate::domain::report::{ApplyReport, StatementCounts};
use crate::domain::retry::{RetryPolicy, StatementState};
use crate::domain::schema::TableStructure;
use crate::domain::snapshot::pk_key;
use crate::domain::statement::Statement;
use crate::infrastructure::config::{EndpointConfig, SyncSettings};

#[derive(Debug, Clone, PartialEq)]
pub struct ApplyOptions {
    pub batch_size: usize,
    pub delete_missing: bool,
    pub dry_run: bool,
    pub parallel: bool,
    pub pool_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        ApplyOptions::from(&SyncSettings::default())
    }
}

impl From<&SyncSettings> for ApplyOptions {
    fn from(s: &SyncSettings) -> Self {
        Self {
            batch_size: s.batch_size.max(1),
            delete_missing: s.delete_missing,
            dry_run: s.dry_run,
            parallel: s.parallel,
            pool_size: s.pool_size.max(1),
            retry: s.retry_policy(),
        }
    }
}

/// Counters of one batch.
#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    upserts: StatementCounts,
    deletes: StatementCounts,
}

impl BatchOutcome {
    fn counts(&mut self, statement: &Statement) -> &mut StatementCounts {
        match statement {
            Statement::Delete { .. } => &mut self.deletes,
            _ => &mut self.upserts,
        }
    }

    fn record(&mut self, statement: &Statement, state: StatementState) {
        let counts = self.counts(statement);
        counts.planned += 1;
        match state {
            StatementState::Applied => counts.applied += 1,
            _ => counts.abandoned += 1,
        }
    }

    fn abandon_all(statements: &[Statement]) -> Self {
        let mut outcome = Self::default();
        for statement in statements {
            outcome.record(statement, StatementState::Abandoned);
        }
        outcome
    }

    /// A lost commit turns every applied statement into an abandoned one.
    fn forfeit(&mut self) {
        for counts in [&mut self.upserts, &mut self.deletes] {
            counts.abandoned += counts.applied;
            counts.applied = 0;
        }
    }

    fn merge_into(self, report: &mut ApplyReport) {
        report.upserts.merge(&self.upserts);
        report.deletes.merge(&self.deletes);
    }
}

pub struct BatchApplier {
    provider: Arc<dyn ConnectionProvider>,
    registry: Arc<ConnectionRegistry>,
}

impl BatchApplier {
    pub fn new(provider: Arc<dyn ConnectionProvider>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { provider, registry }
    }

    /// Apply `changes` to the destination behind `dest`.
    ///
    /// `endpoint` is the destination's configuration, used to open one
    /// session per batch in parallel mode. Returns an error only when the
    /// destination structure cannot be read or the final commit fails.
    #[instrument(
        name = "apply",
        skip(self, dest, endpoint, changes, opts),
        fields(
            table = %changes.table,
            dest = dest.endpoint(),
            upserts = changes.upserts.len(),
            deletes = changes.deletes.len(),
            dry_run = opts.dry_run,
            parallel = opts.parallel,
        )
    )]
    pub async fn apply(
        &self,
        dest: &mut dyn Session,
        endpoint: &EndpointConfig,
        changes: &ChangeSet,
        opts: &ApplyOptions,
    ) -> SyncResult<ApplyReport> {
        let mut report = ApplyReport::default();
        let structure = dest.table_structure(&changes.table).await?;

        let statements = self.plan(changes, &structure, opts, &mut report);
        let batches: Vec<Vec<Statement>> = statements
            .chunks(opts.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        debug!(statements = statements.len(), batches = batches.len(), "apply planned");

        if opts.parallel && !opts.dry_run && batches.len() > 1 {
            // Release the read snapshot so batch sessions are not blocked by it.
            dest.commit().await?;
            self.run_parallel(endpoint, batches, opts)
                .await
                .into_iter()
                .for_each(|outcome| outcome.merge_into(&mut report));
        } else {
            let mut outcome = BatchOutcome::default();
            for batch in &batches {
                run_batch(dest, batch, opts, &mut outcome).await;
            }
            if !opts.dry_run {
                dest.commit().await?;
            }
            outcome.merge_into(&mut report);
        }

        info!(
            upserts_applied = report.upserts.applied,
            upserts_abandoned = report.upserts.abandoned,
            deletes_applied = report.deletes.applied,
            deletes_abandoned = report.deletes.abandoned,
            coercion_failures = report.coercion_failures,
            "apply finished"
        );
        Ok(report)
    }

    /// Build the statements: upserts first, then deletes.
    fn plan(
        &self,
        changes: &ChangeSet,
        structure: &TableStructure,
        opts: &ApplyOptions,
        report: &mut ApplyReport,
    ) -> Vec<Statement> {
        let table = &changes.table;
        let pk = &changes.primary_key;
        let mut statements = Vec::with_capacity(changes.len());

        for row in &changes.upserts {
            let key = pk_key(row, pk).unwrap_or_default();
            let prepared = prepare_row(row, structure);
            for failure in &prepared.failures {
                warn!(table = %table, key = %key, error = %failure, "coercion failed; writing NULL");
            }
            report.coercion_failures += prepared.failures.len();

            let has_key = prepared
                .bindings
                .iter()
                .any(|b| &b.column == pk && !b.value.is_null());
            if !has_key {
                warn!(table = %table, key = %key, "row has no usable primary key; upsert abandoned");
                report.upserts.planned += 1;
                report.upserts.abandoned += 1;
                continue;
            }
            statements.push(Statement::Upsert {
                table: table.clone(),
                primary_key: pk.clone(),
                bindings: prepared.bindings,
            });
        }

        if !opts.delete_missing {
            if !changes.deletes.is_empty() {
                debug!(table = %table, rows = changes.deletes.len(), "delete_missing off; deletes skipped");
            }
            return statements;
        }

        for row in &changes.deletes {
            let key = pk_key(row, pk).unwrap_or_default();
            let prepared = prepare_predicate(row, structure);
            if !prepared.bindings.iter().any(|b| &b.column == pk) {
                warn!(table = %table, key = %key, "predicate lacks the primary key; delete abandoned");
                report.deletes.planned += 1;
                report.deletes.abandoned += 1;
                continue;
            }
            statements.push(Statement::Delete {
                table: table.clone(),
                predicate: prepared.bindings,
            });
        }

        statements
    }

    async fn run_parallel(
        &self,
        endpoint: &EndpointConfig,
        batches: Vec<Vec<Statement>>,
        opts: &ApplyOptions,
    ) -> Vec<BatchOutcome> {
        stream::iter(batches)
            .map(|batch| {
                let provider = Arc::clone(&self.provider);
                let registry = Arc::clone(&self.registry);
                let endpoint = endpoint.clone();
                let opts = opts.clone();
                let fallback = BatchOutcome::abandon_all(&batch);
                async move {
                    let handle = tokio::spawn(async move {
                        run_batch_in_own_session(provider, registry, endpoint, batch, opts).await
                    });
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(error = %e, "batch worker failed");
                            fallback
                        }
                    }
                }
            })
            .buffer_unordered(opts.pool_size.max(1))
            .collect()
            .await
    }
}

async fn run_batch_in_own_session(
    provider: Arc<dyn ConnectionProvider>,
    registry: Arc<ConnectionRegistry>,
    endpoint: EndpointConfig,
    batch: Vec<Statement>,
    opts: ApplyOptions,
) -> BatchOutcome {
    let mut tracked = match registry.open(provider.as_ref(), &endpoint).await {
        Ok(t) => t,
        Err(e) => {
            error!(endpoint = %endpoint.name, error = %e, statements = batch.len(), "cannot open batch session; batch abandoned");
            return BatchOutcome::abandon_all(&batch);
        }
    };

    let mut outcome = BatchOutcome::default();
    run_batch(tracked.session.as_mut(), &batch, &opts, &mut outcome).await;
    if let Err(e) = tracked.session.commit().await {
        error!(endpoint = %endpoint.name, error = %e, "batch commit failed");
        outcome.forfeit();
    }
    tracked.close().await;
    outcome
}

/// Apply the statements of one batch in order, counting into `outcome`,
/// which spans everything since the session's last commit.
async fn run_batch(
    session: &mut dyn Session,
    batch: &[Statement],
    opts: &ApplyOptions,
    outcome: &mut BatchOutcome,
) {
    for statement in batch {
        let result = apply_statement(session, statement, &opts.retry, opts.dry_run).await;
        if result.lost_transaction() {
            error!(
                endpoint = session.endpoint(),
                upserts = outcome.upserts.applied,
                deletes = outcome.deletes.applied,
                "transaction rolled back by the server; uncommitted statements abandoned"
            );
            outcome.forfeit();
        }
        outcome.record(statement, result.state);
    }
}

/// Terminal state of one statement and the kind of the error that ended it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatementOutcome {
    pub state: StatementState,
    pub error: Option<ErrorKind>,
}

impl StatementOutcome {
    /// The session dropped every write it had not committed yet.
    pub fn lost_transaction(&self) -> bool {
        self.error == Some(ErrorKind::TransactionLost)
    }
}

/// Execute one statement under the retry policy until it is applied or
/// abandoned. In dry-run mode nothing executes and the statement counts as
/// applied.
pub async fn apply_statement(
    session: &mut dyn Session,
    statement: &Statement,
    retry: &RetryPolicy,
    dry_run: bool,
) -> StatementOutcome {
    let description = statement.describe();
    if dry_run {
        info!(statement = %description, "dry run: statement not executed");
        return StatementOutcome {
            state: StatementState::Applied,
            error: None,
        };
    }

    let mut state = StatementState::Pending;
    loop {
        let result = session.execute(statement).await;
        let error = result.as_ref().err().map(|e| e.kind());
        state = state.advance(result.as_ref().map(|_| ()).map_err(|e| e.kind()), retry);
        match (state, &result) {
            (StatementState::Applied, _) => debug!(statement = %description, "applied"),
            (StatementState::Retrying(attempt), Err(e)) => {
                warn!(statement = %description, attempt, error = %e, "lock contention; retrying");
                tokio::time::sleep(retry.delay).await;
            }
            (StatementState::Abandoned, Err(e)) => {
                warn!(statement = %description, kind = ?e.kind(), error = %e, "statement abandoned");
            }
            _ => {}
        }
        if state.is_terminal() {
            return StatementOutcome { state, error };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::changeset::RowMap;
    use crate::domain::error::ErrorKind;
    use crate::domain::value_objects::{ColumnName, TableName};
    use crate::infrastructure::memory::{MemoryProvider, MemoryTable};
    use serde_json::{json, Value};
    use std::time::Duration;

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

    fn row(v: Value) -> RowMap {
        match v {
            Value::Object(map) => map.into_iter().collect(),
            _ => RowMap::new(),
        }
    }

    fn opts() -> ApplyOptions {
        ApplyOptions {
            batch_size: 2,
            delete_missing: true,
            dry_run: false,
            parallel: false,
            pool_size: 3,
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
        }
    }

    fn setup() -> (MemoryProvider, BatchApplier) {
        let p = MemoryProvider::new();
        p.create_table(
            "remote",
            "t",
            MemoryTable::new(&[("id", "int"), ("v", "varchar(10)")], "id")
                .with_rows(vec![json!({"id": 1, "v": "a"}), json!({"id": 3, "v": "c"})]),
        );
        let applier = BatchApplier::new(Arc::new(p.clone()), ConnectionRegistry::new());
        (p, applier)
    }

    fn changes() -> ChangeSet {
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        c.upserts.push(row(json!({"id": 2, "v": "b"})));
        c.deletes.push(row(json!({"id": 3, "v": "c"})));
        c
    }

    async fn apply(p: &MemoryProvider, applier: &BatchApplier, c: &ChangeSet, o: &ApplyOptions) -> ApplyReport {
        let mut dest = p.open(&endpoint("remote")).await.unwrap();
        applier.apply(dest.as_mut(), &endpoint("remote"), c, o).await.unwrap()
    }

    fn ids(p: &MemoryProvider) -> Vec<Value> {
        p.rows("remote", "t").iter().map(|r| r["id"].clone()).collect()
    }

    #[tokio::test]
    async fn upserts_and_deletes_are_committed() {
        let (p, applier) = setup();
        let report = apply(&p, &applier, &changes(), &opts()).await;

        assert_eq!(report.upserts.applied, 1);
        assert_eq!(report.deletes.applied, 1);
        assert_eq!(ids(&p), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn delete_missing_off_keeps_destination_rows() {
        let (p, applier) = setup();
        let o = ApplyOptions {
            delete_missing: false,
            ..opts()
        };
        let report = apply(&p, &applier, &changes(), &o).await;

        assert_eq!(report.deletes.planned, 0);
        assert_eq!(ids(&p), vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn applying_twice_is_idempotent() {
        let (p, applier) = setup();
        apply(&p, &applier, &changes(), &opts()).await;
        let once = p.rows("remote", "t");
        apply(&p, &applier, &changes(), &opts()).await;
        assert_eq!(p.rows("remote", "t"), once);
    }

    #[tokio::test]
    async fn contention_is_retried_then_applied() {
        let (p, applier) = setup();
        p.fail_writes("remote", "t", ErrorKind::Contention, 2);
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        c.upserts.push(row(json!({"id": 2, "v": "b"})));

        let report = apply(&p, &applier, &c, &opts()).await;

        assert_eq!(report.upserts.applied, 1);
        assert_eq!(p.write_attempts("remote", "t"), 3);
    }

    #[tokio::test]
    async fn contention_gives_up_after_three_attempts() {
        let (p, applier) = setup();
        p.fail_writes("remote", "t", ErrorKind::Contention, 10);
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        c.upserts.push(row(json!({"id": 2, "v": "b"})));

        let report = apply(&p, &applier, &c, &opts()).await;

        assert_eq!(report.upserts.abandoned, 1);
        assert_eq!(p.write_attempts("remote", "t"), 3);
        assert_eq!(ids(&p), vec![json!(1), json!(3)]);
    }

    #[tokio::test]
    async fn other_errors_abandon_the_row_and_continue() {
        let (p, applier) = setup();
        p.fail_writes("remote", "t", ErrorKind::Query, 1);
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        c.upserts.push(row(json!({"id": 2, "v": "b"})));
        c.upserts.push(row(json!({"id": 4, "v": "d"})));

        let report = apply(&p, &applier, &c, &opts()).await;

        assert_eq!(report.upserts.abandoned, 1);
        assert_eq!(report.upserts.applied, 1);
        assert_eq!(p.write_attempts("remote", "t"), 2);
        assert_eq!(ids(&p), vec![json!(1), json!(3), json!(4)]);
    }

    #[tokio::test]
    async fn lost_transaction_abandons_everything_uncommitted() {
        let (p, applier) = setup();
        p.fail_write_after("remote", "t", ErrorKind::TransactionLost, 2);
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        for id in [2, 4, 5, 6] {
            c.upserts.push(row(json!({"id": id, "v": "x"})));
        }

        let report = apply(&p, &applier, &c, &opts()).await;

        // 2 and 4 went down with the transaction, 5 failed, 6 ran in the next one.
        assert_eq!(report.upserts.applied, 1);
        assert_eq!(report.upserts.abandoned, 3);
        assert_eq!(ids(&p), vec![json!(1), json!(3), json!(6)]);
    }

    #[tokio::test]
    async fn coercion_failure_writes_null_and_keeps_the_row() {
        let p = MemoryProvider::new();
        p.create_table(
            "remote",
            "t",
            MemoryTable::new(&[("id", "int"), ("at", "datetime")], "id"),
        );
        let applier = BatchApplier::new(Arc::new(p.clone()), ConnectionRegistry::new());
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        c.upserts.push(row(json!({"id": 1, "at": "2024-13-01"})));

        let report = apply(&p, &applier, &c, &opts()).await;

        assert_eq!(report.coercion_failures, 1);
        assert_eq!(report.upserts.applied, 1);
        assert_eq!(p.rows("remote", "t")[0]["at"], Value::Null);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let (p, applier) = setup();
        let before = p.rows("remote", "t");
        let o = ApplyOptions {
            dry_run: true,
            ..opts()
        };
        let report = apply(&p, &applier, &changes(), &o).await;

        assert_eq!(report.upserts.applied, 1);
        assert_eq!(p.write_attempts("remote", "t"), 0);
        assert_eq!(p.rows("remote", "t"), before);
    }

    #[tokio::test]
    async fn parallel_batches_use_their_own_sessions() {
        let (p, applier) = setup();
        let mut c = ChangeSet::new(TableName::new("t"), ColumnName::new("id"));
        for id in 10..17 {
            c.upserts.push(row(json!({"id": id, "v": "x"})));
        }
        let o = ApplyOptions {
            parallel: true,
            ..opts()
        };

        let report = apply(&p, &applier, &c, &o).await;

        assert_eq!(report.upserts.applied, 7);
        assert_eq!(p.rows("remote", "t").len(), 9);
        // one table session plus four batch sessions
        assert_eq!(p.sessions_opened(), 5);
    }
}
