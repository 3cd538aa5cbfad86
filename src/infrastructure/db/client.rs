use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::any::{AnyArguments, AnyPoolOptions};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, AnyPool, Row, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::domain::changeset::RowMap;
use crate::domain::error::{ErrorKind, SyncError, SyncResult};
use crate::domain::fingerprint::RowHasher;
use crate::domain::ports::{ConnectionProvider, Session, SessionCloser};
use crate::domain::schema::{ColumnDefinition, TableStructure};
use crate::domain::statement::{SqlValue, Statement};
use crate::domain::value_objects::{ColumnName, Fingerprint, TableName};
use crate::infrastructure::config::EndpointConfig;
use crate::infrastructure::db::dialect::{from_driver, Dialect};
use crate::infrastructure::db::row_mapper::{opt_text_column, row_to_map, scalar_text, text_column};
use crate::infrastructure::db::sql_utils::{
    build_select_query, build_typed_select_query, render_statement, validate_ident,
    RenderedStatement,
};

/// How long an out-of-band close waits for checked-out connections.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

const SAVEPOINT: &str = "SAVEPOINT dbmirror_stmt";
const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT dbmirror_stmt";
const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT dbmirror_stmt";

/// Opens one single-connection sqlx pool per session.
pub struct SqlxProvider {
    acquire_timeout: Duration,
}

impl SqlxProvider {
    pub fn new() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl Default for SqlxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConnectionProvider for SqlxProvider {
    async fn open(&self, endpoint: &EndpointConfig) -> SyncResult<Box<dyn Session>> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(self.acquire_timeout)
            .connect(&endpoint.url())
            .await
            .map_err(|e| connection_error(&endpoint.name, e))?;
        let tx = pool
            .begin()
            .await
            .map_err(|e| connection_error(&endpoint.name, e))?;

        debug!(
            endpoint = %endpoint.name,
            "Connected to {}/{} via {} driver",
            endpoint.host, endpoint.database, endpoint.driver
        );

        Ok(Box::new(SqlxSession {
            endpoint: endpoint.name.clone(),
            pool,
            tx: Some(tx),
            dialect: Arc::from(from_driver(&endpoint.driver)),
            structures: HashMap::new(),
            journal: Vec::new(),
        }))
    }
}

/// A session over one pooled connection, always inside an open transaction.
///
/// Every data statement runs under a savepoint, so a failing row is undone
/// alone and the transaction stays usable on every driver. `commit` commits
/// and immediately begins the next transaction. DDL runs in a transaction of
/// its own and is committed as soon as it succeeds.
pub struct SqlxSession {
    endpoint: String,
    pool: AnyPool,
    tx: Option<Transaction<'static, Any>>,
    dialect: Arc<dyn Dialect>,
    /// Structures read through this session, the allow-list for statements.
    structures: HashMap<String, TableStructure>,
    /// Data statements executed since the last commit, replayed when the
    /// server rolls the transaction back on its own.
    journal: Vec<Statement>,
}

fn connection_error(endpoint: &str, e: sqlx::Error) -> SyncError {
    SyncError::Connection {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    }
}

fn closed_error(endpoint: &str) -> SyncError {
    SyncError::Connection {
        endpoint: endpoint.to_string(),
        message: "session is closed".to_string(),
    }
}

fn decode_error(table: &str, e: anyhow::Error) -> SyncError {
    SyncError::Query {
        table: table.to_string(),
        message: format!("cannot decode row: {}", e),
    }
}

/// Map a driver error to `Contention` or `Query`.
fn classify(dialect: &dyn Dialect, table: &str, err: sqlx::Error) -> SyncError {
    let contention = match &err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => dialect.is_contention(db.code().as_deref(), db.message()),
        _ => false,
    };
    if contention {
        SyncError::Contention {
            table: table.to_string(),
            message: err.to_string(),
        }
    } else {
        SyncError::Query {
            table: table.to_string(),
            message: err.to_string(),
        }
    }
}

/// Whether the server discarded the whole transaction along with `err`.
fn lost_transaction(dialect: &dyn Dialect, err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            dialect.rolled_back_transaction(db.code().as_deref(), db.message())
        }
        _ => false,
    }
}

fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Any, AnyArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::DateTime(s) | SqlValue::Text(s) => query.bind(s.clone()),
    }
}

fn bound(rendered: &RenderedStatement) -> Query<'_, Any, AnyArguments<'_>> {
    rendered
        .params
        .iter()
        .fold(sqlx::query(&rendered.sql), bind_value)
}

/// Unprepared statement, for transaction control.
async fn control(conn: &mut AnyConnection, sql: &str) -> Result<(), sqlx::Error> {
    sqlx::Executor::execute(conn, sql).await.map(|_| ())
}

impl SqlxSession {
    fn conn(&mut self) -> SyncResult<&mut AnyConnection> {
        match self.tx.as_mut() {
            Some(tx) => Ok(&mut **tx),
            None => Err(closed_error(&self.endpoint)),
        }
    }

    fn quoted(&self, table: &TableName) -> SyncResult<String> {
        Ok(self.dialect.quote_ident(validate_ident(table.as_str())?))
    }

    /// Structure from the cache, read on first use.
    async fn structure(&mut self, table: &TableName) -> SyncResult<TableStructure> {
        match self.structures.get(table.as_str()) {
            Some(s) => Ok(s.clone()),
            None => self.read_structure(table).await,
        }
    }

    async fn render(&mut self, statement: &Statement) -> SyncResult<RenderedStatement> {
        let dest = self.structure(statement.table()).await?;
        render_statement(statement, &dest, self.dialect.as_ref())
    }

    /// Roll back whatever is left of the transaction and begin a new one.
    async fn restart(&mut self) -> SyncResult<()> {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                debug!(endpoint = %self.endpoint, error = %e, "rollback before restart failed");
            }
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| connection_error(&self.endpoint, e))?;
        self.tx = Some(tx);
        Ok(())
    }

    /// Begin a new transaction and replay the journal into it. When a
    /// replayed statement fails the session is left with an empty
    /// transaction and `TransactionLost` is returned.
    async fn rebuild(&mut self, table: &str) -> SyncResult<()> {
        self.restart().await?;
        let journal = std::mem::take(&mut self.journal);
        for statement in &journal {
            let replayed = match self.render(statement).await {
                Ok(rendered) => bound(&rendered)
                    .execute(self.conn()?)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            if let Err(message) = replayed {
                self.restart().await?;
                return Err(SyncError::TransactionLost {
                    table: table.to_string(),
                    message: format!("replaying {} failed: {}", statement.describe(), message),
                });
            }
        }
        warn!(
            endpoint = %self.endpoint,
            statements = journal.len(),
            "transaction rolled back by the server; uncommitted statements replayed"
        );
        self.journal = journal;
        Ok(())
    }

    /// Run a rendered data statement under a savepoint.
    async fn run_guarded(&mut self, rendered: &RenderedStatement) -> SyncResult<Result<u64, sqlx::Error>> {
        let conn = self.conn()?;
        let result = async {
            control(&mut *conn, SAVEPOINT).await?;
            let done = bound(rendered).execute(&mut *conn).await?;
            control(&mut *conn, RELEASE_SAVEPOINT).await?;
            Ok::<u64, sqlx::Error>(done.rows_affected())
        }
        .await;
        Ok(result)
    }

    /// Undo a failed data statement and leave the transaction usable.
    async fn undo_failed(&mut self, table: &TableName, err: sqlx::Error) -> SyncError {
        let server_rollback = lost_transaction(self.dialect.as_ref(), &err);
        let failure = classify(self.dialect.as_ref(), &table.0, err);

        let undone = !server_rollback
            && match self.conn() {
                Ok(conn) => {
                    control(&mut *conn, ROLLBACK_TO_SAVEPOINT).await.is_ok()
                        && control(&mut *conn, RELEASE_SAVEPOINT).await.is_ok()
                }
                Err(closed) => return closed,
            };
        if !undone {
            if let Err(e) = self.rebuild(&table.0).await {
                return e;
            }
        }
        failure
    }

    /// A failed read leaves a PostgreSQL transaction unusable; rebuild it so
    /// later statements of this session still run.
    async fn settle<T: Send>(&mut self, table: &str, result: SyncResult<T>) -> SyncResult<T> {
        if let Err(e) = &result {
            let from_driver = matches!(e.kind(), ErrorKind::Query | ErrorKind::Contention);
            if from_driver && self.dialect.error_aborts_transaction() {
                if let Err(lost) = self.rebuild(table).await {
                    error!(endpoint = %self.endpoint, error = %lost, "cannot recover transaction after failed read");
                }
            }
        }
        result
    }

    async fn execute_ddl(&mut self, statement: &Statement) -> SyncResult<u64> {
        let table = statement.table().clone();
        let schema_error = |message: String| SyncError::Schema {
            table: table.0.clone(),
            message,
        };
        let rendered = self.render(statement).await?;
        debug!(endpoint = %self.endpoint, "Executing: {}", rendered.sql);

        // MySQL commits implicitly around DDL; make that explicit everywhere.
        self.commit().await.map_err(|e| schema_error(e.to_string()))?;
        self.structures.remove(table.as_str());

        let result = bound(&rendered).execute(self.conn()?).await;
        match result {
            Ok(done) => {
                self.commit().await.map_err(|e| schema_error(e.to_string()))?;
                Ok(done.rows_affected())
            }
            Err(e) => {
                self.restart().await?;
                Err(schema_error(e.to_string()))
            }
        }
    }

    /// Stream every row of `table` in key order into `sink`, failing once
    /// more than `max_rows` arrive.
    async fn scan<F>(&mut self, table: &TableName, max_rows: usize, mut sink: F) -> SyncResult<()>
    where
        F: FnMut(RowMap) + Send,
    {
        let pk = self.read_primary_key(table).await?;
        let dialect = Arc::clone(&self.dialect);

        let (sql, col_types) = if dialect.needs_introspection() {
            let structure = self.structure(table).await?;
            let sql = build_typed_select_query(table, &pk, &structure, dialect.as_ref())?;
            let types: BTreeMap<String, String> = structure
                .columns()
                .iter()
                .map(|c| (c.name.clone(), c.base_type()))
                .collect();
            (sql, types)
        } else {
            (build_select_query(table, &pk, dialect.as_ref())?, BTreeMap::new())
        };
        debug!(endpoint = %self.endpoint, "Executing: {}", sql);

        let mut stream = sqlx::query(&sql).fetch(self.conn()?);
        let mut seen = 0usize;
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(|e| classify(dialect.as_ref(), &table.0, e))?
        {
            if seen == max_rows {
                return Err(SyncError::SnapshotTooLarge {
                    table: table.0.clone(),
                    limit: max_rows,
                });
            }
            seen += 1;
            let map = row_to_map(&row, &col_types, dialect.as_ref())
                .map_err(|e| decode_error(&table.0, e))?;
            sink(map);
        }
        Ok(())
    }

    async fn read_tables(&mut self) -> SyncResult<Vec<TableName>> {
        let dialect = Arc::clone(&self.dialect);
        let rows = sqlx::query(dialect.list_tables_sql())
            .fetch_all(self.conn()?)
            .await
            .map_err(|e| classify(dialect.as_ref(), "<catalog>", e))?;
        rows.iter()
            .map(|row| {
                text_column(row, 0)
                    .map(TableName)
                    .map_err(|e| decode_error("<catalog>", e))
            })
            .collect()
    }

    async fn read_count(&mut self, table: &TableName) -> SyncResult<u64> {
        let dialect = Arc::clone(&self.dialect);
        let sql = dialect.count_sql(&self.quoted(table)?);
        let row = sqlx::query(&sql)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| classify(dialect.as_ref(), &table.0, e))?;
        let count: i64 = row
            .try_get(0)
            .map_err(|e| classify(dialect.as_ref(), &table.0, e))?;
        Ok(count.max(0) as u64)
    }

    async fn read_checksum(&mut self, table: &TableName) -> SyncResult<Fingerprint> {
        let dialect = Arc::clone(&self.dialect);
        if let Some(sql) = dialect.checksum_sql(&self.quoted(table)?) {
            let row = sqlx::query(&sql)
                .fetch_one(self.conn()?)
                .await
                .map_err(|e| classify(dialect.as_ref(), &table.0, e))?;
            // CHECKSUM TABLE returns (Table, Checksum); md5 queries one column.
            let last = row.len().saturating_sub(1);
            let sum = scalar_text(&row, last).map_err(|e| decode_error(&table.0, e))?;
            return Ok(Fingerprint(sum));
        }

        let mut hasher = RowHasher::new();
        self.scan(table, usize::MAX, |row| hasher.update(&row)).await?;
        Ok(hasher.finish())
    }

    async fn read_structure(&mut self, table: &TableName) -> SyncResult<TableStructure> {
        let dialect = Arc::clone(&self.dialect);
        let rows = sqlx::query(dialect.columns_sql())
            .bind(table.0.clone())
            .fetch_all(self.conn()?)
            .await
            .map_err(|e| classify(dialect.as_ref(), &table.0, e))?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let read = || -> anyhow::Result<ColumnDefinition> {
                Ok(ColumnDefinition {
                    name: text_column(row, 0)?,
                    declared_type: text_column(row, 1)?,
                    collation: opt_text_column(row, 2)?,
                })
            };
            columns.push(read().map_err(|e| decode_error(&table.0, e))?);
        }
        if columns.is_empty() {
            return Err(SyncError::Query {
                table: table.0.clone(),
                message: "table not found".to_string(),
            });
        }

        let structure = TableStructure::new(columns);
        self.structures.insert(table.0.clone(), structure.clone());
        Ok(structure)
    }

    async fn read_collation(&mut self, table: &TableName) -> SyncResult<Option<String>> {
        let dialect = Arc::clone(&self.dialect);
        let Some(sql) = dialect.table_collation_sql() else {
            return Ok(None);
        };
        let row = sqlx::query(sql)
            .bind(table.0.clone())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| classify(dialect.as_ref(), &table.0, e))?;
        match row {
            Some(row) => opt_text_column(&row, 0).map_err(|e| decode_error(&table.0, e)),
            None => Ok(None),
        }
    }

    async fn read_primary_key(&mut self, table: &TableName) -> SyncResult<ColumnName> {
        let dialect = Arc::clone(&self.dialect);
        let rows = sqlx::query(dialect.primary_key_sql())
            .bind(table.0.clone())
            .fetch_all(self.conn()?)
            .await
            .map_err(|e| classify(dialect.as_ref(), &table.0, e))?;
        let mut names = Vec::with_capacity(rows.len());
        for row in &rows {
            names.push(text_column(row, 0).map_err(|e| decode_error(&table.0, e))?);
        }
        match names.len() {
            0 => Err(SyncError::MissingPrimaryKey(table.0.clone())),
            1 => Ok(ColumnName(names.remove(0))),
            _ => Err(SyncError::CompositePrimaryKey {
                table: table.0.clone(),
                columns: names.join(", "),
            }),
        }
    }
}

#[async_trait]
impl Session for SqlxSession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn closer(&self) -> Arc<dyn SessionCloser> {
        Arc::new(SqlxCloser {
            endpoint: self.endpoint.clone(),
            pool: self.pool.clone(),
        })
    }

    async fn list_tables(&mut self) -> SyncResult<Vec<TableName>> {
        let result = self.read_tables().await;
        self.settle("<catalog>", result).await
    }

    async fn row_count(&mut self, table: &TableName) -> SyncResult<u64> {
        let result = self.read_count(table).await;
        self.settle(&table.0, result).await
    }

    async fn checksum(&mut self, table: &TableName) -> SyncResult<Fingerprint> {
        let result = self.read_checksum(table).await;
        self.settle(&table.0, result).await
    }

    async fn table_structure(&mut self, table: &TableName) -> SyncResult<TableStructure> {
        let result = self.read_structure(table).await;
        self.settle(&table.0, result).await
    }

    async fn table_collation(&mut self, table: &TableName) -> SyncResult<Option<String>> {
        let result = self.read_collation(table).await;
        self.settle(&table.0, result).await
    }

    async fn primary_key(&mut self, table: &TableName) -> SyncResult<ColumnName> {
        let result = self.read_primary_key(table).await;
        self.settle(&table.0, result).await
    }

    async fn fetch_rows(&mut self, table: &TableName, max_rows: usize) -> SyncResult<Vec<RowMap>> {
        let mut rows = Vec::new();
        let result = self.scan(table, max_rows, |row| rows.push(row)).await;
        self.settle(&table.0, result).await?;
        Ok(rows)
    }

    async fn execute(&mut self, statement: &Statement) -> SyncResult<u64> {
        if let Statement::Schema { .. } = statement {
            return self.execute_ddl(statement).await;
        }

        let table = statement.table().clone();
        let rendered = self.render(statement).await?;
        debug!(
            endpoint = %self.endpoint,
            params = rendered.params.len(),
            "Executing: {}",
            rendered.sql
        );

        match self.run_guarded(&rendered).await? {
            Ok(affected) => {
                self.journal.push(statement.clone());
                Ok(affected)
            }
            Err(e) => Err(self.undo_failed(&table, e).await),
        }
    }

    async fn commit(&mut self) -> SyncResult<()> {
        let tx = self.tx.take().ok_or_else(|| closed_error(&self.endpoint))?;
        self.journal.clear();
        tx.commit()
            .await
            .map_err(|e| classify(self.dialect.as_ref(), "<commit>", e))?;
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| connection_error(&self.endpoint, e))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn rollback(&mut self) -> SyncResult<()> {
        if self.tx.is_none() {
            return Err(closed_error(&self.endpoint));
        }
        self.journal.clear();
        self.restart().await
    }

    async fn close(&mut self) {
        self.journal.clear();
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                debug!(endpoint = %self.endpoint, error = %e, "rollback on close failed");
            }
        }
        self.pool.close().await;
    }
}

/// Closes the pool behind a session from outside its owner.
pub struct SqlxCloser {
    endpoint: String,
    pool: AnyPool,
}

#[async_trait]
impl SessionCloser for SqlxCloser {
    async fn close(&self) {
        if tokio::time::timeout(CLOSE_GRACE, self.pool.close())
            .await
            .is_err()
        {
            warn!(endpoint = %self.endpoint, "connection still busy after close; abandoning it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::apply::{ApplyOptions, BatchApplier};
    use crate::application::registry::ConnectionRegistry;
    use crate::domain::changeset::ChangeSet;
    use crate::domain::retry::RetryPolicy;
    use crate::domain::schema::SchemaChange;
    use crate::domain::statement::Binding;
    use serde_json::json;

    fn upsert(table: &TableName, id: i64, v: &str) -> Statement {
        Statement::Upsert {
            table: table.clone(),
            primary_key: ColumnName::new("id"),
            bindings: vec![
                Binding::new("id", "INTEGER", SqlValue::Int(id)),
                Binding::new("v", "TEXT", SqlValue::Text(v.into())),
            ],
        }
    }

    fn add_column(table: &TableName, column: &str) -> Statement {
        Statement::Schema {
            table: table.clone(),
            change: SchemaChange::AddColumn {
                column: ColumnName::new(column),
                declared_type: "TEXT".into(),
            },
        }
    }

    /// `CREATE TABLE name (id, v)` where `v` may never be 'bad'.
    async fn create_table(pool: &AnyPool, name: &str, values: &str) {
        sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(&format!(
            "CREATE TABLE {name} (id INTEGER PRIMARY KEY, v TEXT CHECK (v <> 'bad'))"
        ))
        .execute(pool)
        .await
        .unwrap();
        if !values.is_empty() {
            sqlx::query(&format!("INSERT INTO {name} (id, v) VALUES {values}"))
                .execute(pool)
                .await
                .unwrap();
        }
    }

    /// Committed `v` values in key order, read over another connection.
    async fn committed(pool: &AnyPool, name: &str) -> Vec<String> {
        sqlx::query(&format!("SELECT v FROM {name} ORDER BY id"))
            .fetch_all(pool)
            .await
            .unwrap()
            .iter()
            .map(|row| row.try_get::<String, _>(0).unwrap())
            .collect()
    }

    async fn rejected_row_keeps_its_neighbours(cfg: &EndpointConfig, pool: &AnyPool, name: &str) {
        create_table(pool, name, "").await;
        let table = TableName::new(name);
        let provider: Arc<dyn ConnectionProvider> = Arc::new(SqlxProvider::new());
        let applier = BatchApplier::new(Arc::clone(&provider), ConnectionRegistry::new());

        let mut changes = ChangeSet::new(table.clone(), ColumnName::new("id"));
        for (id, v) in [(1, "a"), (2, "bad"), (3, "c")] {
            let row = json!({"id": id, "v": v});
            changes
                .upserts
                .push(row.as_object().unwrap().clone().into_iter().collect());
        }
        let opts = ApplyOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                delay: Duration::ZERO,
            },
            ..ApplyOptions::default()
        };

        let mut dest = provider.open(cfg).await.unwrap();
        let report = applier.apply(dest.as_mut(), cfg, &changes, &opts).await.unwrap();
        dest.close().await;

        assert_eq!(report.upserts.applied, 2);
        assert_eq!(report.upserts.abandoned, 1);
        assert_eq!(committed(pool, name).await, vec!["a", "c"]);
    }

    async fn failed_ddl_leaves_the_session_usable(cfg: &EndpointConfig, pool: &AnyPool, name: &str) {
        create_table(pool, name, "(1, 'a')").await;
        let table = TableName::new(name);
        let mut session = SqlxProvider::new().open(cfg).await.unwrap();

        session.execute(&upsert(&table, 2, "b")).await.unwrap();
        let err = session.execute(&add_column(&table, "v")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Schema);
        session.execute(&add_column(&table, "w")).await.unwrap();

        assert_eq!(session.table_structure(&table).await.unwrap().columns().len(), 3);
        session.execute(&upsert(&table, 3, "c")).await.unwrap();
        session.commit().await.unwrap();
        session.close().await;

        assert_eq!(committed(pool, name).await, vec!["a", "b", "c"]);
    }

    async fn failed_row_is_undone_alone(cfg: &EndpointConfig, pool: &AnyPool, name: &str) {
        create_table(pool, name, "").await;
        let table = TableName::new(name);
        let mut session = SqlxProvider::new().open(cfg).await.unwrap();

        session.execute(&upsert(&table, 1, "a")).await.unwrap();
        let err = session.execute(&upsert(&table, 2, "bad")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Query);
        session.execute(&upsert(&table, 3, "c")).await.unwrap();
        assert_eq!(session.row_count(&table).await.unwrap(), 2);
        session.commit().await.unwrap();
        session.close().await;

        assert_eq!(committed(pool, name).await, vec!["a", "c"]);
    }

    #[cfg(feature = "sqlite")]
    mod sqlite {
        use super::*;

        struct Db {
            _dir: tempfile::TempDir,
            cfg: EndpointConfig,
            pool: AnyPool,
        }

        async fn db() -> Db {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("remote.db");
            std::fs::File::create(&path).unwrap();
            let cfg = EndpointConfig {
                name: "remote".into(),
                driver: "sqlite".into(),
                host: String::new(),
                port: None,
                user: String::new(),
                password: String::new(),
                database: path.to_string_lossy().into_owned(),
            };
            sqlx::any::install_default_drivers();
            let pool = AnyPool::connect(&cfg.url()).await.unwrap();
            Db { _dir: dir, cfg, pool }
        }

        #[tokio::test]
        async fn session_reads_and_upserts() {
            let db = db().await;
            create_table(&db.pool, "t", "(1, 'a'), (3, 'c')").await;

            let mut session = SqlxProvider::new().open(&db.cfg).await.unwrap();
            let table = TableName::new("t");
            assert_eq!(session.list_tables().await.unwrap(), vec![table.clone()]);
            assert_eq!(session.primary_key(&table).await.unwrap(), ColumnName::new("id"));
            assert_eq!(session.table_structure(&table).await.unwrap().columns().len(), 2);

            let before = session.checksum(&table).await.unwrap();
            session.execute(&upsert(&table, 2, "b")).await.unwrap();
            session.commit().await.unwrap();

            assert_eq!(session.row_count(&table).await.unwrap(), 3);
            assert_ne!(session.checksum(&table).await.unwrap(), before);
            let rows = session.fetch_rows(&table, 10).await.unwrap();
            assert_eq!(rows[1]["v"], json!("b"));

            let err = session.fetch_rows(&table, 2).await.unwrap_err();
            assert!(matches!(err, SyncError::SnapshotTooLarge { limit: 2, .. }));
            session.close().await;
        }

        #[tokio::test]
        async fn failed_row() {
            let db = db().await;
            failed_row_is_undone_alone(&db.cfg, &db.pool, "t").await;
        }

        #[tokio::test]
        async fn rejected_row_in_a_batch() {
            let db = db().await;
            rejected_row_keeps_its_neighbours(&db.cfg, &db.pool, "t").await;
        }

        #[tokio::test]
        async fn failed_ddl() {
            let db = db().await;
            failed_ddl_leaves_the_session_usable(&db.cfg, &db.pool, "t").await;
        }
    }

    /// Needs a disposable server: `TEST_PG_HOST`, `TEST_PG_USER`,
    /// `TEST_PG_DATABASE` (and optionally `TEST_PG_PORT`, `TEST_PG_PASSWORD`).
    /// Skipped when they are not set.
    #[cfg(feature = "postgres")]
    mod postgres {
        use super::*;

        async fn server() -> Option<(EndpointConfig, AnyPool)> {
            let var = |key: &str| std::env::var(key).ok();
            let cfg = EndpointConfig {
                name: "remote".into(),
                driver: "postgres".into(),
                host: var("TEST_PG_HOST")?,
                port: var("TEST_PG_PORT").and_then(|p| p.parse().ok()),
                user: var("TEST_PG_USER")?,
                password: var("TEST_PG_PASSWORD").unwrap_or_default(),
                database: var("TEST_PG_DATABASE")?,
            };
            sqlx::any::install_default_drivers();
            let pool = AnyPool::connect(&cfg.url()).await.unwrap();
            Some((cfg, pool))
        }

        #[tokio::test]
        async fn failed_row() {
            let Some((cfg, pool)) = server().await else {
                return;
            };
            failed_row_is_undone_alone(&cfg, &pool, "dbmirror_failed_row").await;
        }

        #[tokio::test]
        async fn rejected_row_in_a_batch() {
            let Some((cfg, pool)) = server().await else {
                return;
            };
            rejected_row_keeps_its_neighbours(&cfg, &pool, "dbmirror_rejected_row").await;
        }

        #[tokio::test]
        async fn failed_ddl() {
            let Some((cfg, pool)) = server().await else {
                return;
            };
            failed_ddl_leaves_the_session_usable(&cfg, &pool, "dbmirror_failed_ddl").await;
        }

        #[tokio::test]
        async fn lock_timeout_is_retried_in_the_same_transaction() {
            let Some((cfg, pool)) = server().await else {
                return;
            };
            let name = "dbmirror_lock_wait";
            create_table(&pool, name, "(1, 'a')").await;
            let table = TableName::new(name);

            sqlx::query("ALTER ROLE CURRENT_USER SET lock_timeout = '200ms'")
                .execute(&pool)
                .await
                .unwrap();
            let opened = SqlxProvider::new().open(&cfg).await;
            sqlx::query("ALTER ROLE CURRENT_USER RESET lock_timeout")
                .execute(&pool)
                .await
                .unwrap();
            let mut session = opened.unwrap();

            session.execute(&upsert(&table, 2, "b")).await.unwrap();

            let mut holder = pool.begin().await.unwrap();
            sqlx::query(&format!("UPDATE {name} SET v = 'held' WHERE id = 1"))
                .execute(&mut *holder)
                .await
                .unwrap();
            let err = session.execute(&upsert(&table, 1, "x")).await.unwrap_err();
            assert!(err.is_contention(), "{err}");
            holder.rollback().await.unwrap();

            session.execute(&upsert(&table, 1, "x")).await.unwrap();
            session.commit().await.unwrap();
            session.close().await;

            assert_eq!(committed(&pool, name).await, vec!["x", "b"]);
        }
    }
}
