use crate::application::monitoring::PerfReport;
use crate::domain::report::{PassReport, StatementCounts, SyncReport};
use colored::*;
use tabled::settings::{object::Columns, Alignment, Modify, Style};
use tabled::{Table, Tabled};

#[derive(Tabled)]
struct PassRow {
    table: String,
    pass: String,
    schema: String,
    upserts: String,
    deletes: String,
    status: String,
}

#[derive(Tabled)]
struct SummaryRow {
    metric: String,
    value: String,
}

pub fn print_summary(report: &SyncReport) {
    println!();

    let title = if report.dry_run {
        "DBMIRROR SYNC SUMMARY (dry run)"
    } else {
        "DBMIRROR SYNC SUMMARY"
    };
    println!("{}", title.bold().cyan());
    println!("Direction: {}", report.direction.to_string().blue());
    println!("Run: {}", report.run_id.bright_yellow());
    println!();

    if report.tables.is_empty() {
        println!("{}", "No common tables found.".italic());
        return;
    }

    let mut rows = Vec::new();
    for t in &report.tables {
        if let Some(error) = &t.error {
            rows.push(PassRow {
                table: t.table.bold().to_string(),
                pass: "-".into(),
                schema: "-".into(),
                upserts: "-".into(),
                deletes: "-".into(),
                status: error.red().to_string(),
            });
        }
        for p in &t.passes {
            rows.push(PassRow {
                table: t.table.bold().to_string(),
                pass: p.pass.to_string(),
                schema: schema_cell(p),
                upserts: counts_cell(&p.apply.upserts, p.bulk),
                deletes: counts_cell(&p.apply.deletes, false),
                status: status_cell(p),
            });
        }
    }

    let table = Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(2..=4)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    let s = &report.summary;
    let summary_rows = vec![
        SummaryRow {
            metric: "Tables".into(),
            value: s.tables_total.to_string().bold().to_string(),
        },
        SummaryRow {
            metric: "Tables changed".into(),
            value: s.tables_changed.to_string().yellow().to_string(),
        },
        SummaryRow {
            metric: "Tables failed".into(),
            value: paint_failures(s.tables_failed),
        },
        SummaryRow {
            metric: "Schema changes".into(),
            value: s.schema_changes.to_string().cyan().to_string(),
        },
        SummaryRow {
            metric: "Upserts applied".into(),
            value: s.upserts_applied.to_string().green().to_string(),
        },
        SummaryRow {
            metric: "Deletes applied".into(),
            value: s.deletes_applied.to_string().red().to_string(),
        },
        SummaryRow {
            metric: "Abandoned".into(),
            value: paint_failures(s.upserts_abandoned + s.deletes_abandoned),
        },
        SummaryRow {
            metric: "Coercion failures".into(),
            value: paint_failures(s.coercion_failures),
        },
    ];

    let summary_table = Table::new(summary_rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..=1)).with(Alignment::right()))
        .to_string();

    println!();
    println!("{summary_table}");
    println!();
}

fn schema_cell(p: &PassReport) -> String {
    let applied = p.schema.applied.len();
    let failed = p.schema.failed.len();
    match (applied, failed) {
        (0, 0) => "-".dimmed().to_string(),
        (a, 0) => a.to_string().cyan().to_string(),
        (a, f) => format!("{} / {}", a.to_string().cyan(), format!("{f} failed").red()),
    }
}

fn counts_cell(c: &StatementCounts, bulk: bool) -> String {
    if c.planned == 0 {
        return "-".dimmed().to_string();
    }
    let mut cell = c.applied.to_string().green().to_string();
    if c.abandoned > 0 {
        cell = format!("{} / {}", cell, format!("{} abandoned", c.abandoned).red());
    }
    if bulk {
        cell = format!("{} {}", cell, "(bulk)".dimmed());
    }
    cell
}

fn status_cell(p: &PassReport) -> String {
    match &p.error {
        Some(e) => e.red().to_string(),
        None if !p.schema.failed.is_empty() => "schema errors".yellow().to_string(),
        None if p.changed => "synced".green().to_string(),
        None => "unchanged".dimmed().to_string(),
    }
}

fn paint_failures(n: usize) -> String {
    if n == 0 {
        n.to_string().green().to_string()
    } else {
        n.to_string().red().bold().to_string()
    }
}

// ─── Performance summary ──────────────────────────────────────────────────────

#[derive(Tabled)]
struct PerfRow {
    operation: String,
    table: String,
    endpoint: String,
    #[tabled(rename = "rows")]
    rows: String,
    #[tabled(rename = "time (ms)")]
    duration_ms: String,
}

/// Print a performance timing table to stdout.
pub fn print_perf_summary(report: &PerfReport) {
    if report.timings.is_empty() {
        return;
    }

    println!("{}", "PERFORMANCE".bold().cyan());

    let rows: Vec<PerfRow> = report
        .timings
        .iter()
        .map(|t| PerfRow {
            operation: t.operation.dimmed().to_string(),
            table: t.table.bold().to_string(),
            endpoint: t.endpoint.clone(),
            rows: t.rows.to_string(),
            duration_ms: format_duration(t.duration_ms),
        })
        .collect();

    let table = Table::new(rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..=4)).with(Alignment::right()))
        .to_string();

    println!("{table}");

    println!(
        "  Total: {} row(s) fetched  ·  {} ms elapsed",
        report.total_rows_fetched.to_string().bold(),
        format_duration(report.total_ms),
    );
    println!();
}

fn format_duration(ms: u128) -> String {
    if ms >= 1_000 {
        format!("{:.1}s", ms as f64 / 1_000.0).yellow().to_string()
    } else if ms >= 100 {
        ms.to_string().yellow().to_string()
    } else {
        ms.to_string().green().to_string()
    }
}
