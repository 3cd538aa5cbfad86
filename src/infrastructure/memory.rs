//! In-memory Connection Provider.
//!
//! Every endpoint name maps to a small database of tables held in process.
//! Sessions buffer writes until `commit` (DDL applies at once), so the
//! engine's transactional behaviour can be exercised without a server.
//! Faults can be injected per endpoint/table to simulate lock contention,
//! a server-side rollback of the open transaction, or failing DDL.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::changeset::RowMap;
use crate::domain::error::{ErrorKind, SyncError, SyncResult};
use crate::domain::fingerprint::fingerprint;
use crate::domain::ports::{ConnectionProvider, Session, SessionCloser};
use crate::domain::schema::{ColumnDefinition, SchemaChange, TableStructure};
use crate::domain::snapshot::pk_key;
use crate::domain::statement::{Binding, Statement};
use crate::domain::value_objects::{ColumnName, Fingerprint, TableName};
use crate::infrastructure::config::EndpointConfig;

/// One table of an in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    pub structure: TableStructure,
    pub collation: Option<String>,
    pub primary_key: Vec<String>,
    rows: BTreeMap<String, RowMap>,
}

impl MemoryTable {
    /// Table keyed by `primary_key`, columns given as `(name, declared type)`.
    pub fn new(columns: &[(&str, &str)], primary_key: &str) -> Self {
        Self {
            structure: TableStructure::new(
                columns
                    .iter()
                    .map(|(n, t)| ColumnDefinition::new(n, t, None))
                    .collect(),
            ),
            collation: None,
            primary_key: vec![primary_key.to_string()],
            rows: BTreeMap::new(),
        }
    }

    pub fn with_structure(mut self, structure: TableStructure) -> Self {
        self.structure = structure;
        self
    }

    pub fn with_collation(mut self, collation: &str) -> Self {
        self.collation = Some(collation.to_string());
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Insert rows given as JSON objects.
    pub fn with_rows(mut self, rows: Vec<Value>) -> Self {
        for row in rows {
            if let Value::Object(map) = row {
                let row: RowMap = map.into_iter().collect();
                self.put(row);
            }
        }
        self
    }

    fn key_column(&self) -> Option<ColumnName> {
        match self.primary_key.as_slice() {
            [single] => Some(ColumnName(single.clone())),
            _ => None,
        }
    }

    fn put(&mut self, row: RowMap) {
        if let Some(key) = self.key_column().and_then(|pk| pk_key(&row, &pk)) {
            self.rows.insert(key, row);
        }
    }

    fn upsert(&mut self, bindings: &[(String, Value)]) {
        let Some(pk) = self.key_column() else {
            return;
        };
        let incoming: RowMap = bindings.iter().cloned().collect();
        let Some(key) = pk_key(&incoming, &pk) else {
            return;
        };
        let row = self.rows.entry(key).or_insert_with(|| {
            self.structure
                .columns()
                .iter()
                .map(|c| (c.name.clone(), Value::Null))
                .collect()
        });
        row.extend(incoming);
    }

    fn delete(&mut self, predicate: &[(String, Value)]) -> u64 {
        let before = self.rows.len();
        self.rows.retain(|_, row| {
            !predicate
                .iter()
                .all(|(col, v)| row.get(col).is_some_and(|have| same_value(have, v)))
        });
        (before - self.rows.len()) as u64
    }

    fn apply_schema(&mut self, change: &SchemaChange) {
        match change {
            SchemaChange::ConvertTableCollation { collation } => {
                self.collation = Some(collation.clone());
                for column in self.structure.columns_mut() {
                    if column.collation.is_some() {
                        column.collation = Some(collation.clone());
                    }
                }
            }
            SchemaChange::AddColumn {
                column,
                declared_type,
            } => {
                self.structure
                    .columns_mut()
                    .push(ColumnDefinition::new(column.as_str(), declared_type, None));
                for row in self.rows.values_mut() {
                    row.insert(column.0.clone(), Value::Null);
                }
            }
            SchemaChange::ModifyColumnType {
                column,
                declared_type,
            } => {
                for c in self.structure.columns_mut() {
                    if c.name == column.0 {
                        c.declared_type = declared_type.clone();
                    }
                }
            }
            SchemaChange::ModifyColumnCollation {
                column, collation, ..
            } => {
                for c in self.structure.columns_mut() {
                    if c.name == column.0 {
                        c.collation = Some(collation.clone());
                    }
                }
            }
        }
    }

    fn rows(&self) -> Vec<RowMap> {
        self.rows.values().cloned().collect()
    }
}

/// Numbers compare numerically, everything else structurally.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

type Databases = HashMap<String, BTreeMap<String, MemoryTable>>;

#[derive(Debug, Clone)]
enum FaultTarget {
    Writes,
    Schema(String),
}

#[derive(Debug, Clone)]
struct Fault {
    endpoint: String,
    table: String,
    target: FaultTarget,
    kind: ErrorKind,
    remaining: usize,
    /// Matching calls to let through before the fault fires.
    skip: usize,
}

#[derive(Default)]
struct Shared {
    databases: Mutex<Databases>,
    faults: Mutex<Vec<Fault>>,
    /// Write statements attempted, per `(endpoint, table)`.
    attempts: Mutex<HashMap<(String, String), usize>>,
    unreachable: Mutex<HashSet<String>>,
    opened: Mutex<usize>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Connection Provider backed by process memory. Cloning shares the data.
#[derive(Clone, Default)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, endpoint: &str, name: &str, table: MemoryTable) {
        lock(&self.shared.databases)
            .entry(endpoint.to_string())
            .or_default()
            .insert(name.to_string(), table);
    }

    /// Committed rows of a table, in key order.
    pub fn rows(&self, endpoint: &str, table: &str) -> Vec<RowMap> {
        lock(&self.shared.databases)
            .get(endpoint)
            .and_then(|db| db.get(table))
            .map(MemoryTable::rows)
            .unwrap_or_default()
    }

    pub fn table(&self, endpoint: &str, table: &str) -> Option<MemoryTable> {
        lock(&self.shared.databases)
            .get(endpoint)
            .and_then(|db| db.get(table))
            .cloned()
    }

    /// Fail the next `times` writes to `table` at `endpoint` with `kind`.
    pub fn fail_writes(&self, endpoint: &str, table: &str, kind: ErrorKind, times: usize) {
        self.push_fault(endpoint, table, FaultTarget::Writes, kind, times, 0);
    }

    /// Let `skip` writes through, then fail the next one with `kind`.
    pub fn fail_write_after(&self, endpoint: &str, table: &str, kind: ErrorKind, skip: usize) {
        self.push_fault(endpoint, table, FaultTarget::Writes, kind, 1, skip);
    }

    /// Fail every DDL statement touching `column`.
    pub fn fail_schema(&self, endpoint: &str, table: &str, column: &str) {
        self.push_fault(
            endpoint,
            table,
            FaultTarget::Schema(column.to_string()),
            ErrorKind::Schema,
            usize::MAX,
            0,
        );
    }

    fn push_fault(
        &self,
        endpoint: &str,
        table: &str,
        target: FaultTarget,
        kind: ErrorKind,
        remaining: usize,
        skip: usize,
    ) {
        lock(&self.shared.faults).push(Fault {
            endpoint: endpoint.to_string(),
            table: table.to_string(),
            target,
            kind,
            remaining,
            skip,
        });
    }

    /// Refuse every `open` for `endpoint`.
    pub fn set_unreachable(&self, endpoint: &str) {
        lock(&self.shared.unreachable).insert(endpoint.to_string());
    }

    pub fn write_attempts(&self, endpoint: &str, table: &str) -> usize {
        lock(&self.shared.attempts)
            .get(&(endpoint.to_string(), table.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Sessions opened so far.
    pub fn sessions_opened(&self) -> usize {
        *lock(&self.shared.opened)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryProvider {
    async fn open(&self, endpoint: &EndpointConfig) -> SyncResult<Box<dyn Session>> {
        if lock(&self.shared.unreachable).contains(&endpoint.name) {
            return Err(SyncError::Connection {
                endpoint: endpoint.name.clone(),
                message: "connection refused".to_string(),
            });
        }
        *lock(&self.shared.opened) += 1;
        Ok(Box::new(MemorySession {
            endpoint: endpoint.name.clone(),
            shared: Arc::clone(&self.shared),
            pending: Vec::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct MemorySession {
    endpoint: String,
    shared: Arc<Shared>,
    /// Uncommitted data statements, applied in order on commit.
    pending: Vec<Statement>,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    fn check_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Connection {
                endpoint: self.endpoint.clone(),
                message: "session is closed".to_string(),
            });
        }
        Ok(())
    }

    fn with_table<T>(
        &self,
        table: &TableName,
        f: impl FnOnce(&MemoryTable) -> SyncResult<T>,
    ) -> SyncResult<T> {
        self.check_open()?;
        let dbs = lock(&self.shared.databases);
        let t = dbs
            .get(&self.endpoint)
            .and_then(|db| db.get(table.as_str()))
            .ok_or_else(|| SyncError::Query {
                table: table.0.clone(),
                message: "table not found".to_string(),
            })?;
        f(t)
    }

    /// Consume one matching fault, if any.
    fn injected(&self, table: &TableName, column: Option<&ColumnName>) -> Option<SyncError> {
        let mut faults = lock(&self.shared.faults);
        let fault = faults.iter_mut().find(|f| {
            f.endpoint == self.endpoint
                && f.table == table.0
                && f.remaining > 0
                && match (&f.target, column) {
                    (FaultTarget::Writes, None) => true,
                    (FaultTarget::Schema(c), Some(col)) => c == &col.0,
                    _ => false,
                }
        })?;
        if fault.skip > 0 {
            fault.skip -= 1;
            return None;
        }
        fault.remaining -= 1;
        let message = "injected fault".to_string();
        Some(match fault.kind {
            ErrorKind::Contention => SyncError::Contention {
                table: table.0.clone(),
                message: "Lock wait timeout exceeded".to_string(),
            },
            ErrorKind::Schema => SyncError::Schema {
                table: table.0.clone(),
                message,
            },
            ErrorKind::TransactionLost => SyncError::TransactionLost {
                table: table.0.clone(),
                message: "Deadlock found when trying to get lock".to_string(),
            },
            _ => SyncError::Query {
                table: table.0.clone(),
                message,
            },
        })
    }

    fn apply(dbs: &mut Databases, endpoint: &str, statement: &Statement) -> u64 {
        let Some(t) = dbs
            .get_mut(endpoint)
            .and_then(|db| db.get_mut(statement.table().as_str()))
        else {
            return 0;
        };
        let pairs = |bindings: &[Binding]| -> Vec<(String, Value)> {
            bindings
                .iter()
                .map(|b| (b.column.0.clone(), b.value.to_json()))
                .collect()
        };
        match statement {
            Statement::Upsert { bindings, .. } => {
                t.upsert(&pairs(bindings));
                1
            }
            Statement::Delete { predicate, .. } => t.delete(&pairs(predicate)),
            Statement::BulkUpsert { columns, rows, .. } => {
                for row in rows {
                    let values: Vec<(String, Value)> = columns
                        .iter()
                        .zip(row)
                        .map(|((c, _), v)| (c.0.clone(), v.to_json()))
                        .collect();
                    t.upsert(&values);
                }
                rows.len() as u64
            }
            Statement::Schema { change, .. } => {
                t.apply_schema(change);
                0
            }
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn closer(&self) -> Arc<dyn SessionCloser> {
        Arc::new(MemoryCloser {
            closed: Arc::clone(&self.closed),
        })
    }

    async fn list_tables(&mut self) -> SyncResult<Vec<TableName>> {
        self.check_open()?;
        Ok(lock(&self.shared.databases)
            .get(&self.endpoint)
            .map(|db| db.keys().map(|k| TableName(k.clone())).collect())
            .unwrap_or_default())
    }

    async fn row_count(&mut self, table: &TableName) -> SyncResult<u64> {
        self.with_table(table, |t| Ok(t.rows.len() as u64))
    }

    async fn checksum(&mut self, table: &TableName) -> SyncResult<Fingerprint> {
        self.with_table(table, |t| Ok(fingerprint(t.rows.values())))
    }

    async fn table_structure(&mut self, table: &TableName) -> SyncResult<TableStructure> {
        self.with_table(table, |t| Ok(t.structure.clone()))
    }

    async fn table_collation(&mut self, table: &TableName) -> SyncResult<Option<String>> {
        self.with_table(table, |t| Ok(t.collation.clone()))
    }

    async fn primary_key(&mut self, table: &TableName) -> SyncResult<ColumnName> {
        self.with_table(table, |t| match t.primary_key.as_slice() {
            [] => Err(SyncError::MissingPrimaryKey(table.0.clone())),
            [single] => Ok(ColumnName(single.clone())),
            many => Err(SyncError::CompositePrimaryKey {
                table: table.0.clone(),
                columns: many.join(", "),
            }),
        })
    }

    async fn fetch_rows(&mut self, table: &TableName, max_rows: usize) -> SyncResult<Vec<RowMap>> {
        self.with_table(table, |t| {
            if t.rows.len() > max_rows {
                return Err(SyncError::SnapshotTooLarge {
                    table: table.0.clone(),
                    limit: max_rows,
                });
            }
            Ok(t.rows())
        })
    }

    async fn execute(&mut self, statement: &Statement) -> SyncResult<u64> {
        self.check_open()?;
        let table = statement.table();
        self.with_table(table, |_| Ok(()))?;

        if let Statement::Schema { change, .. } = statement {
            let column = match change {
                SchemaChange::ConvertTableCollation { .. } => None,
                other => other.column(),
            };
            if let Some(err) = column.and_then(|c| self.injected(table, Some(c))) {
                return Err(err);
            }
            let mut dbs = lock(&self.shared.databases);
            return Ok(Self::apply(&mut dbs, &self.endpoint, statement));
        }

        *lock(&self.shared.attempts)
            .entry((self.endpoint.clone(), table.0.clone()))
            .or_default() += 1;
        if let Some(err) = self.injected(table, None) {
            if err.kind() == ErrorKind::TransactionLost {
                self.pending.clear();
            }
            return Err(err);
        }
        if let Statement::Delete { predicate, .. } = statement {
            if predicate.is_empty() {
                return Err(SyncError::Query {
                    table: table.0.clone(),
                    message: "refusing to delete without a predicate".to_string(),
                });
            }
        }
        self.pending.push(statement.clone());
        Ok(1)
    }

    async fn commit(&mut self) -> SyncResult<()> {
        self.check_open()?;
        let mut dbs = lock(&self.shared.databases);
        for statement in self.pending.drain(..) {
            Self::apply(&mut dbs, &self.endpoint, &statement);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> SyncResult<()> {
        self.check_open()?;
        self.pending.clear();
        Ok(())
    }

    async fn close(&mut self) {
        self.pending.clear();
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryCloser {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl SessionCloser for MemoryCloser {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
