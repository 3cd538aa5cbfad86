use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dbmirror::presentation::cli_summary::{print_perf_summary, print_summary};
use dbmirror::presentation::writers::{write_to_file, JsonWriter};
use dbmirror::{init_tracing, AppConfig, Direction, LogLevel, PerfReport, SyncReport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Exit status after Ctrl-C (128 + SIGINT).
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(
    name = "dbmirror",
    version,
    about = "dbmirror — keep a local and a remote SQL database in step."
)]
struct Cli {
    /// Config file (default: ./dbmirror.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Only errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// SQL text and per-row writes
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synchronize rows (and structure) of every common table
    Sync {
        /// push (local → remote), pull (remote → local) or both
        direction: Direction,
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Reconcile table structures only
    Structure {
        direction: Direction,
        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Args, Debug, Default)]
struct RunOpts {
    /// Log what would change without writing
    #[arg(long)]
    dry_run: bool,

    /// Process tables (and batches) concurrently
    #[arg(long)]
    parallel: bool,

    /// Keep destination rows that are missing at the source
    #[arg(long)]
    keep_missing: bool,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    pool_size: Option<usize>,

    /// Upsert count above which tables are bulk-copied (0 disables)
    #[arg(long)]
    threshold: Option<usize>,

    /// Write the JSON run report into this directory
    #[arg(long)]
    report_dir: Option<PathBuf>,

    /// Print per-operation timings
    #[arg(long)]
    timings: bool,
}

impl RunOpts {
    fn apply_to(&self, cfg: &mut AppConfig) {
        let s = &mut cfg.settings;
        s.dry_run |= self.dry_run;
        s.parallel |= self.parallel;
        if self.keep_missing {
            s.delete_missing = false;
        }
        if let Some(n) = self.batch_size {
            s.batch_size = n;
        }
        if let Some(n) = self.pool_size {
            s.pool_size = n;
        }
        if let Some(n) = self.threshold {
            s.threshold = n;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(if cli.quiet {
        LogLevel::Error
    } else if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    });

    let path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut cfg = AppConfig::load(&path.to_string_lossy())?;

    let (direction, opts, structure_only) = match &cli.command {
        Command::Sync { direction, opts } => (*direction, opts, false),
        Command::Structure { direction, opts } => (*direction, opts, true),
    };
    opts.apply_to(&mut cfg);

    let perf = PerfReport::new();
    let engine = dbmirror::engine().with_perf(Arc::clone(&perf));
    let registry = engine.registry();

    let run = async {
        if structure_only {
            engine.reconcile_tables(&cfg, direction).await
        } else {
            engine.sync_tables(&cfg, direction).await
        }
    };

    let report: SyncReport = tokio::select! {
        result = run => result.context("sync failed")?,
        _ = tokio::signal::ctrl_c() => {
            let closed = registry.close_all().await;
            eprintln!("Interrupted; closed {closed} open connection(s).");
            return Ok(ExitCode::from(INTERRUPTED));
        }
    };

    print_summary(&report);
    let perf = PerfReport::snapshot(&perf);
    if opts.timings {
        print_perf_summary(&perf);
    }

    if let Some(dir) = &opts.report_dir {
        let dir = dir.join(direction.to_string());
        let written = write_to_file(&JsonWriter::new().with_perf(perf), &report, &dir)?;
        println!("Report written to {}", written.display());
    }

    Ok(if report.summary.tables_failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
