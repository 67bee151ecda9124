//! CandleVault CLI: ingest, status, and config commands.
//!
//! Commands:
//! - `ingest`: backfill candles from the upstream klines API into the CSV
//!   archive and the SQLite store
//! - `status`: report per-year row counts and datetime ranges of both sinks
//! - `config`: print the default configuration as TOML

use anyhow::{bail, Context, Result};
use candlevault_core::{BinanceSource, CircuitBreaker, CsvArchive, SqliteStore};
use candlevault_runner::{
    Cursor, FailurePolicy, FailurePolicyKind, IngestConfig, IngestLoop, IngestReport,
    RateLimiter, StopReason,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "candlevault",
    about = "CandleVault CLI: year-partitioned candle archive and store"
)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch candles from now minus the lookback window and store them.
    Ingest {
        #[command(flatten)]
        overrides: Overrides,

        /// Retry transient upstream failures instead of stopping.
        #[arg(long, default_value_t = false)]
        retry: bool,
    },
    /// Report what both sinks hold.
    Status {
        #[command(flatten)]
        overrides: Overrides,
    },
    /// Print the default configuration as TOML.
    Config,
}

/// Config file plus per-field overrides.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Trading pair, e.g. BTCUSDT.
    #[arg(long)]
    symbol: Option<String>,

    /// Kline interval, e.g. 1h.
    #[arg(long)]
    interval: Option<String>,

    /// Candles per page (1-1000).
    #[arg(long)]
    limit: Option<u32>,

    /// Days before now to start from.
    #[arg(long)]
    lookback_days: Option<u32>,

    /// Root of the CSV archive.
    #[arg(long)]
    archive_dir: Option<PathBuf>,

    /// SQLite database file.
    #[arg(long)]
    database: Option<PathBuf>,
}

impl Overrides {
    fn load(&self) -> Result<IngestConfig> {
        let mut cfg = match &self.config {
            Some(path) => IngestConfig::from_file(path)?,
            None => IngestConfig::default(),
        };
        self.apply(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&self, cfg: &mut IngestConfig) {
        if let Some(symbol) = &self.symbol {
            cfg.symbol = symbol.to_ascii_uppercase();
        }
        if let Some(interval) = &self.interval {
            cfg.interval = interval.clone();
        }
        if let Some(limit) = self.limit {
            cfg.page_limit = limit;
        }
        if let Some(days) = self.lookback_days {
            cfg.lookback_days = days;
        }
        if let Some(dir) = &self.archive_dir {
            cfg.archive_dir = dir.clone();
        }
        if let Some(db) = &self.database {
            cfg.database_path = db.clone();
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Ingest { overrides, retry } => {
            let mut cfg = overrides.load()?;
            if retry {
                cfg.failure.policy = FailurePolicyKind::Retry;
            }
            run_ingest(&cfg)
        }
        Commands::Status { overrides } => run_status(&overrides.load()?),
        Commands::Config => {
            print!("{}", IngestConfig::default().to_toml()?);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Create the archive root and the database's parent directory.
fn bootstrap_dirs(cfg: &IngestConfig) -> Result<()> {
    std::fs::create_dir_all(&cfg.archive_dir)
        .with_context(|| format!("create archive directory {}", cfg.archive_dir.display()))?;
    if let Some(parent) = cfg.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn run_ingest(cfg: &IngestConfig) -> Result<()> {
    bootstrap_dirs(cfg)?;

    // Let the retry budget run out before repeated failures trip the breaker.
    let circuit_breaker = Arc::new(
        CircuitBreaker::default_upstream()
            .with_failure_threshold(cfg.failure.max_retries.saturating_add(1)),
    );
    let source = BinanceSource::new(
        cfg.base_url.as_str(),
        Duration::from_secs(cfg.request_timeout_secs),
        circuit_breaker,
    )
    .context("build upstream client")?;

    let mut archive = CsvArchive::new(
        &cfg.archive_dir,
        cfg.symbol.as_str(),
        cfg.interval.as_str(),
    )
    .with_dedup(cfg.archive_dedup);
    let mut store = SqliteStore::open(&cfg.database_path, &cfg.symbol, &cfg.interval)
        .with_context(|| format!("open database {}", cfg.database_path.display()))?;

    let start = Cursor::from_lookback(Utc::now(), cfg.lookback_days);
    info!(
        symbol = %cfg.symbol,
        interval = %cfg.interval,
        lookback_days = cfg.lookback_days,
        start = %start,
        "starting ingestion"
    );

    let report = {
        let mut ingest = IngestLoop::new(
            &source,
            cfg.symbol.as_str(),
            cfg.interval.as_str(),
            cfg.page_limit,
        )
        .with_sink(&mut archive)
        .with_sink(&mut store)
        .with_rate_limiter(RateLimiter::from_config(&cfg.rate_limit))
        .with_policy(FailurePolicy::from_config(&cfg.failure));
        ingest.run(start).context("ingestion aborted")?
    };

    store.close().context("close database")?;
    print_report(cfg, &report);

    if let StopReason::SourceFailed {
        error,
        transient: false,
    } = &report.stop
    {
        bail!("upstream refused the run: {error}");
    }
    Ok(())
}

fn print_report(cfg: &IngestConfig, report: &IngestReport) {
    println!();
    println!("=== Ingestion Result ===");
    println!("Symbol:       {} ({})", cfg.symbol, cfg.interval);
    println!("{report}");
    println!("Archive:      {}", cfg.archive_dir.display());
    println!("Database:     {}", cfg.database_path.display());
    println!();
}

fn run_status(cfg: &IngestConfig) -> Result<()> {
    println!("Symbol: {} ({})", cfg.symbol, cfg.interval);
    println!();

    let archive = CsvArchive::new(&cfg.archive_dir, cfg.symbol.as_str(), cfg.interval.as_str());
    print_archive_status(&archive)?;
    println!();
    print_store_status(cfg)?;
    Ok(())
}

fn print_archive_status(archive: &CsvArchive) -> Result<()> {
    let dir = archive.partition_dir();
    let years = archive
        .partition_years()
        .with_context(|| format!("scan archive {}", dir.display()))?;
    println!("CSV archive: {}", dir.display());
    if years.is_empty() {
        println!("  (empty)");
        return Ok(());
    }

    print_header();
    for year in years {
        let rows = archive
            .read_rows(year)
            .with_context(|| format!("read {}", archive.year_path(year).display()))?;
        let first = rows.first().map(|r| r.datetime.as_str()).unwrap_or("-");
        let last = rows.last().map(|r| r.datetime.as_str()).unwrap_or("-");
        print_row(year, rows.len(), first, last);
    }
    Ok(())
}

fn print_store_status(cfg: &IngestConfig) -> Result<()> {
    let path: &Path = &cfg.database_path;
    println!("SQLite store: {}", path.display());
    if !path.exists() {
        println!("  (database does not exist)");
        return Ok(());
    }

    let store = SqliteStore::open(path, &cfg.symbol, &cfg.interval)
        .with_context(|| format!("open database {}", path.display()))?;
    let years = store.partition_years()?;
    if years.is_empty() {
        println!(
            "  (no tables for {})",
            SqliteStore::table_stem(&cfg.symbol, &cfg.interval)
        );
        return Ok(());
    }

    print_header();
    for year in years {
        let rows = store.row_count(year)?;
        let (first, last) = store
            .datetime_range(year)?
            .unwrap_or_else(|| ("-".into(), "-".into()));
        print_row(year, rows, &first, &last);
    }
    Ok(())
}

fn print_header() {
    println!("  {:<6} {:>8}  {:<19}  {:<19}", "Year", "Rows", "First", "Last");
    println!("  {}", "-".repeat(58));
}

fn print_row(year: i32, rows: usize, first: &str, last: &str) {
    println!("  {year:<6} {rows:>8}  {first:<19}  {last:<19}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config_fields() {
        let cli = Cli::parse_from([
            "candlevault",
            "ingest",
            "--symbol",
            "ethusdt",
            "--interval",
            "4h",
            "--limit",
            "500",
            "--database",
            "/tmp/x.db",
            "--retry",
        ]);
        let Commands::Ingest { overrides, retry } = cli.command else {
            panic!("expected ingest");
        };
        assert!(retry);

        let cfg = overrides.load().unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.interval, "4h");
        assert_eq!(cfg.page_limit, 500);
        assert_eq!(cfg.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.lookback_days, 1825);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let overrides = Overrides {
            limit: Some(5000),
            ..Overrides::default()
        };
        assert!(overrides.load().is_err());
    }

    #[test]
    fn verbose_is_global() {
        let cli = Cli::parse_from(["candlevault", "status", "-v"]);
        assert!(cli.verbose);
    }
}
