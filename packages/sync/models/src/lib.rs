#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Configuration, request, and result types for the encounter sync run.

use std::path::PathBuf;

use chrono::NaiveDate;
use encounter_sync_source_models::{ConnectionConfig, DbRoute, SshRoute, Table};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// Rows per page when neither the request nor the config says otherwise.
pub const DEFAULT_BATCH_SIZE: u64 = 5000;

/// Id column used for pagination unless overridden.
pub const DEFAULT_ID_COLUMN: &str = "id";

/// Run-wide settings, usually read from a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Connect to the database directly instead of through `ssh_route`.
    #[serde(default)]
    pub use_localhost: bool,
    /// SSH jump host.
    #[serde(default)]
    pub ssh_route: Option<SshRoute>,
    /// Upstream database. Only needed by real connectors.
    #[serde(default)]
    pub db_route: Option<DbRoute>,
    /// Local tunnel port, `0` for any free port.
    #[serde(default)]
    pub local_port: u16,
    /// Total write attempts per artifact.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds to wait between write attempts.
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Rows per page.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// First day fetched when there is nothing to resume from.
    #[serde(default = "default_start_date")]
    pub start_date: NaiveDate,
    /// Days before the latest stored day to fetch again on incremental
    /// runs.
    #[serde(default)]
    pub overlap_days: u32,
    /// Directory holding `data/`.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Recovery cursor location. Defaults to the system temp directory.
    #[serde(default)]
    pub recovery_file: Option<PathBuf>,
    /// Default dataset to fetch.
    #[serde(default)]
    pub dataset: Option<DatasetConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            use_localhost: false,
            ssh_route: None,
            db_route: None,
            local_port: 0,
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            batch_size: default_batch_size(),
            start_date: default_start_date(),
            overlap_days: 0,
            root_dir: default_root_dir(),
            recovery_file: None,
            dataset: None,
        }
    }
}

impl SyncConfig {
    /// Connection settings for a real connector, if a database is
    /// configured.
    #[must_use]
    pub fn connection(&self) -> Option<ConnectionConfig> {
        Some(ConnectionConfig {
            use_localhost: self.use_localhost,
            ssh_route: self.ssh_route.clone(),
            db_route: self.db_route.clone()?,
            local_port: self.local_port,
        })
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_secs() -> u64 {
    2
}

const fn default_batch_size() -> u64 {
    DEFAULT_BATCH_SIZE
}

fn default_start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default()
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

/// `[dataset]` table: what to fetch when the CLI does not say.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Upstream query, optionally containing a `{predicate}` slot.
    pub query_template: String,
    /// Main store file name under `data/`.
    pub destination: String,
    /// Column holding the encounter date.
    pub date_column: String,
    /// Monotonic id column used for paging.
    #[serde(default = "default_id_column")]
    pub id_column: String,
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

/// One fetch invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Upstream query, optionally containing a `{predicate}` slot.
    pub query_template: String,
    /// Main store file name under `data/`.
    pub destination: String,
    /// Column holding the encounter date.
    pub date_column: String,
    /// Monotonic id column used for paging.
    pub id_column: String,
    /// Rows per page.
    pub batch_size: u64,
    /// Discard the main store and recovery state and start from the epoch.
    pub force_rebuild: bool,
}

impl FetchRequest {
    /// Request with the default id column and page size.
    #[must_use]
    pub fn new(
        query_template: impl Into<String>,
        destination: impl Into<String>,
        date_column: impl Into<String>,
    ) -> Self {
        Self {
            query_template: query_template.into(),
            destination: destination.into(),
            date_column: date_column.into(),
            id_column: DEFAULT_ID_COLUMN.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            force_rebuild: false,
        }
    }

    /// Sets the id column.
    #[must_use]
    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }

    /// Sets the page size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets whether to rebuild from scratch.
    #[must_use]
    pub const fn with_force_rebuild(mut self, force_rebuild: bool) -> Self {
        self.force_rebuild = force_rebuild;
        self
    }
}

impl From<&DatasetConfig> for FetchRequest {
    fn from(dataset: &DatasetConfig) -> Self {
        Self::new(
            dataset.query_template.clone(),
            dataset.destination.clone(),
            dataset.date_column.clone(),
        )
        .with_id_column(dataset.id_column.clone())
    }
}

/// Where a run's first day came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum StartPoint {
    /// A recovery cursor from an interrupted run.
    Recovered,
    /// The day after the latest day in a valid main store.
    Incremental,
    /// The configured epoch, after the main store was missing or invalid.
    Epoch,
    /// The configured epoch, because a rebuild was requested.
    Forced,
}

/// What happened to one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DayOutcome {
    /// Every page was fetched and merged.
    Merged,
    /// Some pages failed; the rows that did arrive were merged.
    Incomplete,
    /// No rows upstream for this day.
    Empty,
    /// The batch could not be persisted; the day is left for a later run.
    Skipped,
}

/// Per-day line of a [`SyncSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayReport {
    /// The day.
    pub day: NaiveDate,
    /// What happened.
    pub outcome: DayOutcome,
    /// Rows fetched for the day, including resumed pending rows.
    pub rows: usize,
}

/// Counters and notable days from one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// First day processed.
    pub start_date: NaiveDate,
    /// Last day processed ("today").
    pub end_date: NaiveDate,
    /// How the start day was chosen.
    pub start_point: StartPoint,
    /// Number of days iterated.
    pub days_processed: usize,
    /// Days whose batch could not be persisted.
    pub skipped_days: Vec<NaiveDate>,
    /// Days merged with only part of their pages.
    pub incomplete_days: Vec<NaiveDate>,
    /// Rows returned by upstream in this run, not counting recovered rows.
    pub rows_fetched: usize,
    /// Rows in the main store after the run.
    pub rows_total: usize,
    /// Whether a recovered cursor or pending rows were applied to a day.
    pub resumed: bool,
    /// Per-day outcomes in processing order.
    pub days: Vec<DayReport>,
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The main store contents after the run.
    pub table: Table,
    /// What the run did.
    pub summary: SyncSummary,
}
