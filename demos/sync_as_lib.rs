//! # dbmirror — library usage example
//!
//! Shows two common patterns for consuming dbmirror as a Rust library:
//!
//! 1. **From a config file** — simplest, mirrors the CLI
//! 2. **In-memory endpoints** — drive the engine without any database server
//!
//! Run with a config file:
//!   cargo run --example sync_as_lib -- dbmirror.toml
//!
//! Run against the built-in in-memory endpoints:
//!   cargo run --example sync_as_lib

use std::sync::Arc;

use anyhow::Result;
use dbmirror::{
    presentation::writers::{write_to_file, JsonWriter},
    AppConfig, Direction, EndpointConfig, MemoryProvider, MemoryTable, SyncEngine, SyncReport,
    SyncSettings,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some(path) => from_config_file(path).await,
        None => in_memory().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern 1 — load config from a TOML file (same as the CLI does internally)
// ─────────────────────────────────────────────────────────────────────────────
async fn from_config_file(path: &str) -> Result<()> {
    println!("=== Pattern 1: from config file ({path}) ===\n");

    let cfg = AppConfig::load(path)?;
    let report = dbmirror::sync(&cfg, Direction::Push).await?;

    let dir = std::env::temp_dir().join("dbmirror-reports");
    let written = write_to_file(&JsonWriter::new(), &report, &dir)?;
    println!("Written: {}", written.display());

    print_report(&report);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pattern 2 — in-memory endpoints.
// Useful for trying settings (dry run, delete_missing) before touching data.
// ─────────────────────────────────────────────────────────────────────────────
async fn in_memory() -> Result<()> {
    println!("=== Pattern 2: in-memory endpoints ===\n");

    let provider = MemoryProvider::new();
    provider.create_table(
        "local",
        "orders",
        MemoryTable::new(&[("id", "int"), ("item", "varchar(40)"), ("amount", "decimal(10,2)")], "id")
            .with_rows(vec![
                json!({"id": 1, "item": "book", "amount": "12.50"}),
                json!({"id": 2, "item": "pen", "amount": "1.20"}),
            ]),
    );
    provider.create_table(
        "remote",
        "orders",
        MemoryTable::new(&[("id", "int"), ("item", "varchar(40)")], "id")
            .with_rows(vec![
                json!({"id": 1, "item": "book"}),
                json!({"id": 3, "item": "stale"}),
            ]),
    );

    let endpoint = |name: &str| EndpointConfig {
        name: name.to_string(),
        driver: "memory".to_string(),
        host: String::new(),
        port: None,
        user: String::new(),
        password: String::new(),
        database: name.to_string(),
    };
    let cfg = AppConfig {
        local: endpoint("local"),
        remote: endpoint("remote"),
        settings: SyncSettings::default(),
    };

    let engine = SyncEngine::new(Arc::new(provider.clone()));
    let report = engine.sync_tables(&cfg, Direction::Push).await?;
    print_report(&report);

    println!("\nremote rows after push:");
    for row in provider.rows("remote", "orders") {
        println!("  {}", serde_json::to_string(&row)?);
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspect the report for custom logic
// ─────────────────────────────────────────────────────────────────────────────
fn print_report(report: &SyncReport) {
    println!("Run {} ({})", report.run_id, report.direction);
    for table in &report.tables {
        for pass in &table.passes {
            println!(
                "  {:<20} {:<5} schema={} upserts={} deletes={}{}",
                table.table,
                pass.pass.to_string(),
                pass.schema.applied.len(),
                pass.apply.upserts.applied,
                pass.apply.deletes.applied,
                pass.error
                    .as_deref()
                    .map(|e| format!("  error: {e}"))
                    .unwrap_or_default(),
            );
        }
        if let Some(error) = &table.error {
            println!("  {:<20} skipped: {}", table.table, error);
        }
    }
    let s = &report.summary;
    println!(
        "Summary: {} table(s), {} changed, {} failed",
        s.tables_total, s.tables_changed, s.tables_failed
    );
}
