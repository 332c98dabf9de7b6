//! xq-harvest main entry point
//!
//! This is the command-line interface for the resumable market-data harvester.

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use xq_harvest::checkpoint::CheckpointLedger;
use xq_harvest::config::{load_config_with_hash, validate, Config, MAX_CONCURRENCY};
use xq_harvest::crawler::{
    build_fetcher, endpoint_for, AdjustType, Endpoint, EndpointKind, Fetcher, KlinePeriod,
    Orchestrator, QuoteListEndpoint, QuotePageUniverse, RunMode, StaticUniverse,
    StoredUniverse, UniverseSource,
};
use xq_harvest::output::{print_ledger_summary, print_statistics, print_table_info};
use xq_harvest::storage::{open_storage, RecordStore};

/// xq-harvest: a resumable market-data harvester
///
/// Walks a universe of instruments against the quote API, pacing and retrying
/// every request, and stores the results in CSV files or SQLite without
/// duplicating rows across interrupted runs.
#[derive(Parser, Debug)]
#[command(name = "xq-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A resumable market-data harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Endpoint to harvest: quote-list, company, finance, kline or
    /// statement:income, statement:balance, statement:cash
    #[arg(long, default_value = "kline")]
    job: EndpointKind,

    /// Kline bar period (day, week, month, quarter, year, 1m ... 120m)
    #[arg(long, default_value = "day")]
    period: KlinePeriod,

    /// Kline price adjustment (before, after, normal)
    #[arg(long, default_value = "after")]
    adjust: AdjustType,

    /// Comma-separated symbols instead of the stored universe
    #[arg(long, value_name = "S1,S2")]
    symbols: Option<String>,

    /// Table holding the symbol universe
    #[arg(long, default_value = "stock_list")]
    universe_table: String,

    /// Column of --universe-table holding the symbols
    #[arg(long, default_value = "symbol")]
    universe_column: String,

    /// Reset this job's progress for the universe and fetch everything again
    #[arg(long)]
    force: bool,

    /// Override crawler.concurrency
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Increase logging verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Show the checkpoint ledger for the job and exit
    #[arg(long, conflicts_with_all = ["dry_run", "backup"])]
    stats: bool,

    /// Validate config and show what would be harvested without fetching
    #[arg(long, conflicts_with_all = ["stats", "backup"])]
    dry_run: bool,

    /// Copy a CSV table to the backup directory and exit
    #[arg(long, value_name = "TABLE", conflicts_with_all = ["stats", "dry_run"])]
    backup: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if let Some(concurrency) = cli.concurrency {
        config.crawler.concurrency = concurrency;
        validate(&config).with_context(|| {
            format!("--concurrency must be between 1 and {}", MAX_CONCURRENCY)
        })?;
    }

    let endpoint: Arc<dyn Endpoint> = Arc::from(endpoint_for(
        cli.job,
        cli.period,
        cli.adjust,
        config.crawler.page_size,
    ));

    if let Some(table) = &cli.backup {
        handle_backup(&config, table)
    } else if cli.stats {
        handle_stats(&config, endpoint.as_ref())
    } else if cli.dry_run {
        handle_dry_run(&config, &cli, endpoint.as_ref()).await
    } else {
        handle_run(config, &cli, endpoint).await
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// `RUST_LOG`, when set, takes precedence over the flags.
fn setup_logging(verbose: u8, quiet: bool) {
    let default_filter = if quiet {
        "error"
    } else {
        match verbose {
            0 => "xq_harvest=info,warn",
            1 => "xq_harvest=debug,info",
            _ => "xq_harvest=trace,debug",
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn universe_source(
    cli: &Cli,
    config: &Config,
    store: Arc<dyn RecordStore>,
    fetcher: Option<Arc<Fetcher>>,
) -> anyhow::Result<Box<dyn UniverseSource>> {
    if cli.job == EndpointKind::QuoteList {
        let fetcher = fetcher.context("quote-list universe needs network access")?;
        return Ok(Box::new(QuotePageUniverse::new(
            fetcher,
            QuoteListEndpoint::new(config.crawler.page_size),
        )));
    }

    Ok(match &cli.symbols {
        Some(list) => Box::new(StaticUniverse::parse(list)),
        None => Box::new(StoredUniverse::new(
            store,
            cli.universe_table.clone(),
            cli.universe_column.clone(),
        )),
    })
}

/// Handles --backup: copies one CSV table aside
fn handle_backup(config: &Config, table: &str) -> anyhow::Result<()> {
    let store = open_storage(&config.storage).context("Failed to open storage")?;
    let path = store
        .backup(table)
        .with_context(|| format!("Failed to back up table {}", table))?;

    println!("✓ Backed up {} to {}", table, path.display());
    Ok(())
}

/// Handles --stats: shows the ledger and table info for the job
fn handle_stats(config: &Config, endpoint: &dyn Endpoint) -> anyhow::Result<()> {
    let job = endpoint.job_name();
    println!("Ledger: {}\n", config.checkpoint.path);

    let ledger = CheckpointLedger::open(Path::new(&config.checkpoint.path), &job)
        .context("Failed to open checkpoint ledger")?;
    let summary = ledger.summary()?;
    let failures = ledger.failures()?;
    print_ledger_summary(&job, &summary, &failures);

    println!();
    let store = open_storage(&config.storage).context("Failed to open storage")?;
    print_table_info(&store.describe(endpoint.table())?);

    Ok(())
}

/// Handles --dry-run: validates config and resolves the universe without fetching
async fn handle_dry_run(config: &Config, cli: &Cli, endpoint: &dyn Endpoint) -> anyhow::Result<()> {
    println!("=== xq-harvest Dry Run ===\n");

    println!("API:");
    println!("  Base URL: {}", config.api.base_url);
    println!("  Stock URL: {}", config.api.stock_base_url);
    println!("  Credential TTL: {}s", config.auth.credential_ttl_seconds);

    println!("\nCrawler:");
    println!("  Request delay: {}s", config.crawler.request_delay_seconds);
    println!("  Max retries: {}", config.crawler.max_retries);
    println!("  Timeout: {}s", config.crawler.timeout_seconds);
    println!("  Concurrency: {}", config.crawler.concurrency);

    println!("\nStorage:");
    println!("  Type: {}", config.storage.storage_type.as_str());
    println!("  CSV path: {}", config.storage.csv_path);
    println!("  Database: {}", config.storage.database_path);
    println!("  Duplicate policy: {:?}", config.storage.duplicate_policy);
    println!("  Checkpoints: {}", config.checkpoint.path);

    println!("\nJob:");
    println!("  Name: {}", endpoint.job_name());
    println!("  Table: {}", endpoint.table());
    println!("  Unique key: {}", endpoint.unique_key().columns().join(", "));

    let store = open_storage(&config.storage).context("Failed to open storage")?;
    if cli.job == EndpointKind::QuoteList {
        println!("\n✓ Configuration is valid");
        println!("✓ Universe: quote-list pages, resolved at run time from the first page of each stock type");
        return Ok(());
    }

    let source = universe_source(cli, config, store, None)?;
    let universe = source.load().await?;

    println!("\n✓ Configuration is valid");
    println!("✓ Would harvest {} items ({})", universe.len(), source.describe());

    Ok(())
}

/// Handles the main harvest run
async fn handle_run(config: Config, cli: &Cli, endpoint: Arc<dyn Endpoint>) -> anyhow::Result<()> {
    let job = endpoint.job_name();
    let mode = if cli.force {
        tracing::info!(job = %job, "Starting forced refresh (ignoring previous progress)");
        RunMode::ForceRefresh
    } else {
        tracing::info!(job = %job, "Starting run (resuming previous progress)");
        RunMode::Resume
    };

    let store = open_storage(&config.storage).context("Failed to open storage")?;
    let fetcher = build_fetcher(&config).context("Failed to build HTTP client")?;
    let ledger = Arc::new(
        CheckpointLedger::open(Path::new(&config.checkpoint.path), &job)
            .context("Failed to open checkpoint ledger")?,
    );

    let source = universe_source(cli, &config, store.clone(), Some(fetcher.clone()))?;
    tracing::info!("Resolving universe: {}", source.describe());
    let universe = source.load().await.context("Failed to resolve universe")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, finishing in-flight items");
                cancel.cancel();
            }
        });
    }

    let orchestrator = Orchestrator::new(
        fetcher,
        store,
        ledger,
        endpoint,
        config.crawler.concurrency,
    )
    .with_cancellation(cancel);

    let report = orchestrator.run(&universe, mode).await?;
    print_statistics(&report.job, &report.stats);

    report.into_result().context("Harvest run aborted")?;
    Ok(())
}
