use tracing::{debug, warn};

use crate::domain::error::SyncResult;
use crate::domain::ports::Session;
use crate::domain::value_objects::TableName;

/// Cheap pre-filter: does `table` differ between the two sessions?
///
/// Row counts are compared first; only equal counts fall through to the
/// whole-table checksums. Any error is logged and reported as "unchanged".
pub async fn has_changed(source: &mut dyn Session, dest: &mut dyn Session, table: &TableName) -> bool {
    match compare(source, dest, table).await {
        Ok(changed) => changed,
        Err(e) => {
            warn!(
                table = %table,
                source = source.endpoint(),
                dest = dest.endpoint(),
                kind = ?e.kind(),
                error = %e,
                "change detection failed; treating table as unchanged"
            );
            false
        }
    }
}

async fn compare(source: &mut dyn Session, dest: &mut dyn Session, table: &TableName) -> SyncResult<bool> {
    let source_count = source.row_count(table).await?;
    let dest_count = dest.row_count(table).await?;
    if source_count != dest_count {
        debug!(table = %table, source_count, dest_count, "row counts differ");
        return Ok(true);
    }

    let source_sum = source.checksum(table).await?;
    let dest_sum = dest.checksum(table).await?;
    let changed = source_sum != dest_sum;
    debug!(
        table = %table,
        rows = source_count,
        source_checksum = %source_sum,
        dest_checksum = %dest_sum,
        changed,
        "checksums compared"
    );
    Ok(changed)
}
