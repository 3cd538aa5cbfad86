use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::schema::SchemaChange;
use crate::domain::value_objects::{Direction, Pass};

/// Outcome of one sync run.
#[derive(Debug, Serialize, Clone)]
pub struct SyncReport {
    pub run_id: String,
    pub direction: Direction,
    pub dry_run: bool,
    pub started_at: String,
    pub finished_at: String,
    pub tables: Vec<TableReport>,
    pub summary: Summary,
}

#[derive(Debug, Serialize, Clone, Default, PartialEq, Eq)]
pub struct Summary {
    pub tables_total: usize,
    pub tables_changed: usize,
    pub tables_failed: usize,
    pub schema_changes: usize,
    pub upserts_applied: usize,
    pub upserts_abandoned: usize,
    pub deletes_applied: usize,
    pub deletes_abandoned: usize,
    pub coercion_failures: usize,
}

impl SyncReport {
    pub fn new(
        direction: Direction,
        dry_run: bool,
        started_at: DateTime<Utc>,
        mut tables: Vec<TableReport>,
    ) -> Self {
        tables.sort_by(|a, b| a.table.cmp(&b.table));

        let passes = || tables.iter().flat_map(|t| t.passes.iter());
        let summary = Summary {
            tables_total: tables.len(),
            tables_changed: tables
                .iter()
                .filter(|t| t.passes.iter().any(|p| p.changed))
                .count(),
            tables_failed: tables.iter().filter(|t| t.has_errors()).count(),
            schema_changes: passes().map(|p| p.schema.applied.len()).sum(),
            upserts_applied: passes().map(|p| p.apply.upserts.applied).sum(),
            upserts_abandoned: passes().map(|p| p.apply.upserts.abandoned).sum(),
            deletes_applied: passes().map(|p| p.apply.deletes.applied).sum(),
            deletes_abandoned: passes().map(|p| p.apply.deletes.abandoned).sum(),
            coercion_failures: passes().map(|p| p.apply.coercion_failures).sum(),
        };

        SyncReport {
            run_id: format!(
                "sync_{}_{}",
                started_at.format("%Y%m%d_%H%M%S"),
                Uuid::new_v4().simple()
            ),
            direction,
            dry_run,
            started_at: started_at.to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            tables,
            summary,
        }
    }
}

/// Everything that happened to one table during a run.
#[derive(Debug, Serialize, Clone)]
pub struct TableReport {
    pub table: String,
    pub passes: Vec<PassReport>,
    /// Table-level failure (e.g. a session could not be opened).
    pub error: Option<String>,
}

impl TableReport {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            passes: Vec::new(),
            error: None,
        }
    }

    pub fn failed(table: &str, error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(table)
        }
    }

    pub fn has_errors(&self) -> bool {
        self.error.is_some() || self.passes.iter().any(|p| p.error.is_some())
    }
}

/// One directed pass (DETECT → RECONCILE → DIFF → APPLY) over a table.
#[derive(Debug, Serialize, Clone)]
pub struct PassReport {
    pub pass: Pass,
    pub source: String,
    pub destination: String,
    /// Result of the change detector.
    pub changed: bool,
    pub schema: SchemaReport,
    pub apply: ApplyReport,
    /// The bulk-transfer fallback replaced row-by-row upserts.
    pub bulk: bool,
    pub error: Option<String>,
}

impl PassReport {
    pub fn new(pass: Pass, source: &str, destination: &str) -> Self {
        Self {
            pass,
            source: source.to_string(),
            destination: destination.to_string(),
            changed: false,
            schema: SchemaReport::default(),
            apply: ApplyReport::default(),
            bulk: false,
            error: None,
        }
    }
}

/// DDL applied (or planned, in dry-run) and DDL that failed.
#[derive(Debug, Serialize, Clone, Default)]
pub struct SchemaReport {
    pub applied: Vec<SchemaChange>,
    pub failed: Vec<FailedChange>,
}

#[derive(Debug, Serialize, Clone)]
pub struct FailedChange {
    pub change: SchemaChange,
    pub error: String,
}

/// Counters of the batch applier.
#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub upserts: StatementCounts,
    pub deletes: StatementCounts,
    /// Fields written as NULL because they failed coercion.
    pub coercion_failures: usize,
}

impl ApplyReport {
    pub fn merge(&mut self, other: &ApplyReport) {
        self.upserts.merge(&other.upserts);
        self.deletes.merge(&other.deletes);
        self.coercion_failures += other.coercion_failures;
    }
}

#[derive(Debug, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementCounts {
    pub planned: usize,
    pub applied: usize,
    pub abandoned: usize,
}

impl StatementCounts {
    pub fn merge(&mut self, other: &StatementCounts) {
        self.planned += other.planned;
        self.applied += other.applied;
        self.abandoned += other.abandoned;
    }
}
