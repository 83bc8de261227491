#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the encounter sync tool.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use encounter_sync::SyncError;
use encounter_sync::config::load_config;
use encounter_sync::orchestrator::Orchestrator;
use encounter_sync_cli_utils::{IndicatifProgress, init_logger};
use encounter_sync_models::{FetchRequest, SyncConfig};
use encounter_sync_source::SourceConnector;
use encounter_sync_source::memory::MemoryConnector;
use encounter_sync_store::csv_table::read_table;

#[derive(Parser)]
#[command(
    name = "encounter_sync",
    about = "Incremental day-by-day fetch of clinical encounter records"
)]
struct Cli {
    /// TOML config file (defaults to `encounter_sync.toml` if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every day since the last run and merge it into the main store
    Fetch {
        /// Upstream query, optionally with a `{predicate}` slot
        #[arg(long)]
        query: Option<String>,
        /// Main store file name under `data/`
        #[arg(long)]
        destination: Option<String>,
        /// Column holding the encounter date
        #[arg(long)]
        date_column: Option<String>,
        /// Monotonic id column used for paging
        #[arg(long)]
        id_column: Option<String>,
        /// Rows per page
        #[arg(long)]
        batch_size: Option<u64>,
        /// Discard the main store and recovery cursor and start from the epoch
        #[arg(long)]
        force: bool,
        /// Treat this day as "today" (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,
        /// Serve rows from a local CSV file instead of the upstream database
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the main store from the surviving batch files
    Rebuild {
        /// Main store file name under `data/`
        #[arg(long)]
        destination: Option<String>,
    },
    /// Show the main store, pending batches, quarantined files and cursor
    Status {
        /// Main store file name under `data/`
        #[arg(long)]
        destination: Option<String>,
    },
    /// Delete the recovery cursor
    ClearRecovery,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let multi = init_logger();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Fetch {
            query,
            destination,
            date_column,
            id_column,
            batch_size,
            force,
            today,
            fixture,
            json,
        } => {
            let mut request = base_request(&config, query, destination, date_column)?
                .with_batch_size(batch_size.unwrap_or(config.batch_size))
                .with_force_rebuild(force);
            if let Some(id_column) = id_column {
                request = request.with_id_column(id_column);
            }

            let mut connector: Box<dyn SourceConnector> = match fixture {
                Some(path) => fixture_connector(&path, &request)?,
                None => upstream_connector(&config)?,
            };

            let progress = IndicatifProgress::days_bar(&multi, &request.destination);
            let mut orchestrator = Orchestrator::new(config).with_progress(progress);
            if let Some(today) = today {
                orchestrator = orchestrator.with_today(today);
            }

            let outcome = orchestrator.fetch(connector.as_mut(), &request).await?;
            let summary = outcome.summary;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "{}: {} -> {} ({}), {} day(s), {} row(s) fetched, {} total",
                    request.destination,
                    summary.start_date,
                    summary.end_date,
                    summary.start_point,
                    summary.days_processed,
                    summary.rows_fetched,
                    summary.rows_total
                );
                if !summary.skipped_days.is_empty() {
                    println!("  skipped: {}", join_days(&summary.skipped_days));
                }
                if !summary.incomplete_days.is_empty() {
                    println!("  incomplete: {}", join_days(&summary.incomplete_days));
                }
            }
        }
        Commands::Rebuild { destination } => {
            let destination = resolve_destination(&config, destination)?;
            let table = Orchestrator::new(config).rebuild(&destination).await?;
            println!("{destination}: rebuilt with {} row(s)", table.len());
        }
        Commands::Status { destination } => {
            let destination = resolve_destination(&config, destination)?;
            let orchestrator = Orchestrator::new(config);
            let status = orchestrator.status(&destination)?;

            println!("Main store:   {}", status.main_path.display());
            match status.main_rows {
                Some(rows) => println!("  rows:       {rows}"),
                None => println!("  rows:       (missing or unreadable)"),
            }
            println!(
                "Last updated: {}",
                status.last_updated.as_deref().unwrap_or("never")
            );
            println!(
                "Pending:      {}",
                if status.pending_batches.is_empty() {
                    "none".to_string()
                } else {
                    join_days(&status.pending_batches)
                }
            );
            match &status.recovery {
                Some(state) => println!(
                    "Recovery:     {} {} after id {} ({} pending row(s))",
                    state.destination,
                    state.current_date,
                    state.last_id,
                    state.pending.len()
                ),
                None => println!("Recovery:     none"),
            }
            println!("Quarantined:  {}", status.quarantined.len());
            for path in &status.quarantined {
                println!("  {}", path.display());
            }
        }
        Commands::ClearRecovery => {
            let ledger = Orchestrator::new(config).ledger();
            ledger.clear();
            println!("Cleared {}", ledger.path().display());
        }
    }

    Ok(())
}

fn base_request(
    config: &SyncConfig,
    query: Option<String>,
    destination: Option<String>,
    date_column: Option<String>,
) -> Result<FetchRequest, SyncError> {
    let dataset = config.dataset.as_ref();
    let pick = |flag: Option<String>, fallback: Option<&String>, name: &str| {
        flag.or_else(|| fallback.cloned())
            .ok_or_else(|| SyncError::Config {
                message: format!("--{name} is required when the config has no [dataset]"),
            })
    };

    let mut request = FetchRequest::new(
        pick(query, dataset.map(|d| &d.query_template), "query")?,
        pick(destination, dataset.map(|d| &d.destination), "destination")?,
        pick(date_column, dataset.map(|d| &d.date_column), "date-column")?,
    );
    if let Some(dataset) = dataset {
        request = request.with_id_column(dataset.id_column.clone());
    }
    Ok(request)
}

fn resolve_destination(
    config: &SyncConfig,
    destination: Option<String>,
) -> Result<String, SyncError> {
    destination
        .or_else(|| config.dataset.as_ref().map(|d| d.destination.clone()))
        .ok_or_else(|| SyncError::Config {
            message: "--destination is required when the config has no [dataset]".to_string(),
        })
}

fn fixture_connector(
    path: &Path,
    request: &FetchRequest,
) -> Result<Box<dyn SourceConnector>, SyncError> {
    let table = read_table(path)?;
    log::info!("Serving {} fixture row(s) from {}", table.len(), path.display());
    Ok(Box::new(MemoryConnector::new(
        table,
        &request.date_column,
        &request.id_column,
    )))
}

#[cfg(feature = "duckdb")]
fn upstream_connector(config: &SyncConfig) -> Result<Box<dyn SourceConnector>, SyncError> {
    let connection = config.connection().ok_or_else(|| SyncError::Config {
        message: "[db_route] is required to fetch from the upstream database".to_string(),
    })?;
    Ok(Box::new(
        encounter_sync_source::duckdb_connector::DuckDbConnector::new(connection),
    ))
}

#[cfg(not(feature = "duckdb"))]
fn upstream_connector(_config: &SyncConfig) -> Result<Box<dyn SourceConnector>, SyncError> {
    Err(SyncError::Config {
        message: "built without the `duckdb` feature; use --fixture or rebuild with \
                  --features duckdb"
            .to_string(),
    })
}

fn join_days(days: &[NaiveDate]) -> String {
    days.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
