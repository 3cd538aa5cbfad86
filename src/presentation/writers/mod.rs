use crate::domain::{ports::ReportWriter, report::SyncReport};
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

pub mod json;

pub use self::json::JsonWriter;

/// Writes the report to `<dir>/<run_id>.<ext>` via the chosen writer
pub fn write_to_file(writer: &dyn ReportWriter, report: &SyncReport, dir: &Path) -> Result<PathBuf> {
    // Ensure the output directory exists
    fs::create_dir_all(dir)?;

    let content = writer.format(report)?;
    let path = dir.join(format!("{}.{}", report.run_id, writer.extension()));
    fs::write(&path, &content)?;
    Ok(path)
}
