use tracing::{debug, info, instrument, warn};

use crate::domain::error::SyncResult;
use crate::domain::ports::Session;
use crate::domain::report::{FailedChange, SchemaReport};
use crate::domain::schema::{plan_columns, plan_table_collation, SchemaChange, SchemaDiff};
use crate::domain::statement::Statement;
use crate::domain::value_objects::TableName;

/// Bring the destination structure of `table` in line with the source.
///
/// Only additive and corrective DDL is issued: missing columns are added,
/// differing types and collations are modified, destination-only columns are
/// left alone. The table collation is converted first and the destination
/// structure re-read before columns are planned. A failing change is
/// recorded and the remaining ones still run.
///
/// Errors reading either structure are returned; DDL failures are not.
#[instrument(
    name = "reconcile",
    skip(source, dest),
    fields(table = %table, source = source.endpoint(), dest = dest.endpoint())
)]
pub async fn reconcile_structure(
    source: &mut dyn Session,
    dest: &mut dyn Session,
    table: &TableName,
    dry_run: bool,
) -> SyncResult<SchemaReport> {
    let mut report = SchemaReport::default();

    let source_structure = source.table_structure(table).await?;
    let source_collation = source.table_collation(table).await?;
    let dest_structure = dest.table_structure(table).await?;
    let dest_collation = dest.table_collation(table).await?;

    let plan = SchemaDiff::between(
        &source_structure,
        &dest_structure,
        source_collation.as_deref(),
        dest_collation.as_deref(),
    );
    if plan.is_empty() {
        debug!("structure in sync");
        return Ok(report);
    }
    info!(
        additions = plan.additions().count(),
        modifications = plan.modifications().count(),
        collation_changes = plan.collation_changes().count(),
        dry_run,
        "structure differs"
    );

    let mut dest_structure = dest_structure;
    if let Some(change) = plan_table_collation(source_collation.as_deref(), dest_collation.as_deref()) {
        apply_change(dest, table, change, dry_run, &mut report).await;
        if !dry_run {
            dest_structure = dest.table_structure(table).await?;
        }
    }

    for change in plan_columns(&source_structure, &dest_structure) {
        apply_change(dest, table, change, dry_run, &mut report).await;
    }

    Ok(report)
}

async fn apply_change(
    dest: &mut dyn Session,
    table: &TableName,
    change: SchemaChange,
    dry_run: bool,
    report: &mut SchemaReport,
) {
    if dry_run {
        info!(change = %change, "dry run: schema change not applied");
        report.applied.push(change);
        return;
    }

    let statement = Statement::Schema {
        table: table.clone(),
        change,
    };
    let result = dest.execute(&statement).await;
    let Statement::Schema { change, .. } = statement else {
        return;
    };
    match result {
        Ok(_) => {
            info!(change = %change, "schema change applied");
            report.applied.push(change);
        }
        Err(e) => {
            warn!(change = %change, kind = ?e.kind(), error = %e, "schema change failed");
            report.failed.push(FailedChange {
                change,
                error: e.to_string(),
            });
        }
    }
}
