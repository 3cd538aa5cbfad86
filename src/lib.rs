use anyhow::Result;
use std::sync::Arc;

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

// ─── Log level ────────────────────────────────────────────────────────────────

/// Controls the verbosity of dbmirror's internal tracing output.
///
/// Pass to [`init_tracing`] before calling any async entry point.
///
/// | Variant | `tracing` level | When to use                              |
/// |---------|-----------------|------------------------------------------|
/// | `Error` | `error`         | `--quiet` / CI scripting                 |
/// | `Info`  | `info`          | Default: per-table milestones and DDL    |
/// | `Debug` | `debug`         | `--verbose`: SQL text and per-row writes |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Info,
    Debug,
}

/// Initialise the global `tracing` subscriber for dbmirror.
///
/// This is a convenience wrapper around `tracing_subscriber`. It respects
/// `RUST_LOG` when set, falling back to `level` otherwise.
///
/// Call this **once** at application startup. Library consumers who manage
/// their own subscriber should skip this and configure tracing themselves.
///
/// Only available when the `cli` feature is enabled (pulls in
/// `tracing-subscriber`).
#[cfg(feature = "cli")]
pub fn init_tracing(level: LogLevel) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let default_filter = match level {
        LogLevel::Error => "dbmirror=error",
        LogLevel::Info => "dbmirror=info",
        LogLevel::Debug => "dbmirror=debug",
    };

    tracing_subscriber::fmt()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

// ─── Public API Facade ───

pub use application::monitoring::PerfReport;
pub use application::registry::ConnectionRegistry;
pub use application::sync::SyncEngine;
pub use domain::changeset::{ChangeSet, RowMap};
pub use domain::error::{ErrorKind, SyncError, SyncResult};
pub use domain::report::{Summary, SyncReport, TableReport};
pub use domain::value_objects::{ColumnName, Direction, Fingerprint, Pass, TableName};
pub use infrastructure::config::{AppConfig, EndpointConfig, SyncSettings};
pub use infrastructure::db::client::SqlxProvider;
pub use infrastructure::memory::{MemoryProvider, MemoryTable};

// ─── Public entry points ───

/// Engine over real databases, one sqlx connection per session.
///
/// Build your own [`SyncEngine`] when you need the registry (interrupt
/// handling) or a different provider.
pub fn engine() -> SyncEngine {
    SyncEngine::new(Arc::new(SqlxProvider::new()))
}

/// Synchronize every common table in `direction`.
///
/// Use [`sync_with_timing`] if you also want a performance report.
pub async fn sync(cfg: &AppConfig, direction: Direction) -> Result<SyncReport> {
    Ok(engine().sync_tables(cfg, direction).await?)
}

/// Synchronize with performance timing.
///
/// Returns the [`SyncReport`] and a [`PerfReport`] containing per-table
/// fetch, diff and apply timings.
pub async fn sync_with_timing(cfg: &AppConfig, direction: Direction) -> Result<(SyncReport, PerfReport)> {
    let perf = PerfReport::new();
    let report = engine()
        .with_perf(Arc::clone(&perf))
        .sync_tables(cfg, direction)
        .await?;
    Ok((report, PerfReport::snapshot(&perf)))
}

/// Reconcile table structures only; no row is read or written.
pub async fn reconcile(cfg: &AppConfig, direction: Direction) -> Result<SyncReport> {
    Ok(engine().reconcile_tables(cfg, direction).await?)
}
