use anyhow::Result;
use serde::Serialize;

use crate::application::monitoring::PerfReport;
use crate::domain::{ports::ReportWriter, report::SyncReport};

// ─── Serialisation view ───────────────────────────────────────────────────────
//
// The report plus optional timings. Presentation-only: the domain report is
// never modified.

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    report: &'a SyncReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    perf: Option<&'a PerfReport>,
}

// ─── Writer ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct JsonWriter {
    perf: Option<PerfReport>,
}

impl JsonWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embed the run's timings under `perf`.
    pub fn with_perf(mut self, perf: PerfReport) -> Self {
        self.perf = Some(perf);
        self
    }
}

impl ReportWriter for JsonWriter {
    fn format(&self, report: &SyncReport) -> Result<String> {
        let view = JsonReport {
            report,
            perf: self.perf.as_ref(),
        };
        Ok(serde_json::to_string_pretty(&view)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}
