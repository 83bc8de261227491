//! The day-by-day fetch loop.
//!
//! A run resolves its first day, then for every day through today:
//! fetch, save the recovery cursor, persist the batch, merge it, and
//! advance the cursor. A run that reaches the end writes the timestamp.
//! It deletes the consumed batches and clears the cursor only if every day
//! finished; otherwise the cursor stays on the first unfinished day. A run
//! that errors leaves all of them in place for the next run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, Local, NaiveDate};
use encounter_sync_models::{
    DayOutcome, DayReport, FetchRequest, StartPoint, SyncConfig, SyncOutcome, SyncSummary,
};
use encounter_sync_source::SourceConnector;
use encounter_sync_source::day_batch::DayBatchProcessor;
use encounter_sync_source::progress::{ProgressCallback, null_progress};
use encounter_sync_source::query::QueryTemplate;
use encounter_sync_source_models::Table;
use encounter_sync_store::atomic::{is_quarantined, remove_if_exists, write_validated};
use encounter_sync_store::batch::BatchPersister;
use encounter_sync_store::csv_table::read_table;
use encounter_sync_store::ledger::{RecoveryLedger, RecoveryState};
use encounter_sync_store::merge::{MainRead, MainStoreMerger, read_main_safely};
use encounter_sync_store::paths::{DataLayout, batch_files, default_recovery_path};
use encounter_sync_store::retry::retry;
use encounter_sync_store::validate::{MainStatus, validate_main_store};
use encounter_sync_store::{RetryPolicy, StoreError};

use crate::SyncError;

/// Header of the `TimeStamp.csv` marker.
pub const TIMESTAMP_COLUMN: &str = "last_updated";

/// Drives fetch runs for one dataset directory.
pub struct Orchestrator {
    config: SyncConfig,
    today: Option<NaiveDate>,
    progress: Arc<dyn ProgressCallback>,
}

/// Where a run starts and what it starts with.
struct StartPlan {
    day: NaiveDate,
    point: StartPoint,
    main: Table,
    recovered: Option<RecoveryState>,
}

/// Snapshot of the on-disk state, for `status`.
#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Main store path.
    pub main_path: PathBuf,
    /// Rows in the main store, or `None` if it is missing or unreadable.
    pub main_rows: Option<usize>,
    /// Days with a batch file still waiting to be cleaned up.
    pub pending_batches: Vec<NaiveDate>,
    /// Quarantined files under `data/`.
    pub quarantined: Vec<PathBuf>,
    /// Recovery cursor, if one is stored.
    pub recovery: Option<RecoveryState>,
    /// Contents of the last-success marker.
    pub last_updated: Option<String>,
}

impl Orchestrator {
    /// Creates an orchestrator using the local calendar date as "today".
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            today: None,
            progress: null_progress(),
        }
    }

    /// Pins "today", e.g. for backfills up to a fixed day.
    #[must_use]
    pub const fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Reports per-day progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// The configuration this orchestrator runs with.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Directory layout under the configured root.
    #[must_use]
    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.config.root_dir)
    }

    /// The recovery cursor file.
    #[must_use]
    pub fn ledger(&self) -> RecoveryLedger {
        RecoveryLedger::new(
            self.config
                .recovery_file
                .clone()
                .unwrap_or_else(default_recovery_path),
        )
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.config.max_retries,
            Duration::from_secs(self.config.retry_delay_secs),
        )
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    fn merger(&self, destination: &str) -> MainStoreMerger {
        let layout = self.layout();
        MainStoreMerger::new(
            layout.main_path(destination),
            layout.batches_dir(),
            self.policy(),
        )
    }

    /// Fetches everything new for `request` and merges it into the main
    /// store.
    ///
    /// `connector` is opened once and closed on every exit path. Close
    /// errors are logged and never replace the run's own result.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if the query template is invalid, the
    /// connection cannot be opened, or a local write fails with no fallback
    /// left. The recovery cursor and batch files are then kept so the next
    /// run resumes.
    pub async fn fetch(
        &self,
        connector: &mut dyn SourceConnector,
        request: &FetchRequest,
    ) -> Result<SyncOutcome, SyncError> {
        let template = QueryTemplate::new(
            &request.query_template,
            &request.date_column,
            &request.id_column,
        )?;

        let result = match connector.open().await {
            Ok(()) => self.run(connector, request, &template).await,
            Err(e) => Err(e.into()),
        };

        if let Err(e) = connector.close().await {
            log::warn!("Failed to close {}: {e}", connector.name());
        }

        if let Err(e) = &result {
            log::error!(
                "Fetch of {} failed, recovery state kept for the next run: {e}",
                request.destination
            );
        }

        result
    }

    async fn run(
        &self,
        connector: &mut dyn SourceConnector,
        request: &FetchRequest,
        template: &QueryTemplate,
    ) -> Result<SyncOutcome, SyncError> {
        let layout = self.layout();
        layout.ensure_dirs()?;

        let ledger = self.ledger();
        let merger = self.merger(&request.destination);
        let persister = BatchPersister::new(layout.clone(), self.policy());
        let processor = DayBatchProcessor::new(template, request.batch_size);
        let today = self.today();

        let plan = self.plan_start(request, &merger, &ledger).await?;
        let start = plan.day.min(today);
        let mut main = plan.main;
        let mut recovered = plan.recovered;
        let mut resumed = false;
        // Earliest day this run could not finish. The cursor never moves
        // past it, so the next run starts there.
        let mut deferred: Option<RecoveryState> = None;

        log::info!(
            "Fetching {} from {start} through {today} ({})",
            request.destination,
            plan.point
        );

        let days: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= today).collect();
        self.progress.set_total(days.len() as u64);

        let mut reports = Vec::with_capacity(days.len());
        let mut rows_fetched = 0;

        for &day in &days {
            self.progress.set_message(day.to_string());

            let (resume_id, mut rows) = match recovered.take() {
                Some(state) if state.current_date == day => (state.last_id, state.pending),
                _ => (0, Table::default()),
            };
            if resume_id > 0 || !rows.is_empty() {
                resumed = true;
                log::info!(
                    "Resuming {day} after id {resume_id} with {} pending row(s)",
                    rows.len()
                );
            }

            let fetch = processor.fetch_day(connector, day, resume_id).await;
            let complete = fetch.is_complete();
            let last_id = fetch.last_id;
            rows_fetched += fetch.rows.len();
            rows.append(fetch.rows);

            if deferred.is_none() {
                ledger.save(&RecoveryState::new(
                    &request.destination,
                    day,
                    last_id,
                    rows.clone(),
                ))?;
            }

            let outcome = if rows.is_empty() {
                if complete {
                    DayOutcome::Empty
                } else {
                    DayOutcome::Incomplete
                }
            } else if let Some(batch) = persister.persist(&rows, day).await {
                main = merger.merge_incremental(&main, batch).await?;
                if complete {
                    DayOutcome::Merged
                } else {
                    DayOutcome::Incomplete
                }
            } else {
                log::warn!("Skipping {day}: batch could not be persisted");
                DayOutcome::Skipped
            };

            match outcome {
                DayOutcome::Incomplete | DayOutcome::Skipped => {
                    log::warn!(
                        "{day} is {outcome}, {} row(s) kept after id {last_id}",
                        rows.len()
                    );
                    if deferred.is_none() {
                        let state =
                            RecoveryState::new(&request.destination, day, last_id, rows.clone());
                        ledger.save(&state)?;
                        deferred = Some(state);
                    }
                }
                DayOutcome::Merged | DayOutcome::Empty => {
                    if deferred.is_none()
                        && let Some(next) = day.checked_add_days(Days::new(1))
                    {
                        ledger.save(&RecoveryState::start_of(&request.destination, next))?;
                    }
                }
            }

            reports.push(DayReport {
                day,
                outcome,
                rows: rows.len(),
            });
            self.progress.inc(1);
        }

        self.write_timestamp(&layout).await?;
        match &deferred {
            Some(state) => log::warn!(
                "Keeping batches and the recovery cursor at {} after id {}: the next run \
                 retries from there",
                state.current_date,
                state.last_id
            ),
            None => {
                persister.remove_consumed()?;
                ledger.clear();
            }
        }

        let summary = SyncSummary {
            start_date: start,
            end_date: today,
            start_point: plan.point,
            days_processed: days.len(),
            skipped_days: days_with(&reports, DayOutcome::Skipped),
            incomplete_days: days_with(&reports, DayOutcome::Incomplete),
            rows_fetched,
            rows_total: main.len(),
            resumed,
            days: reports,
        };

        self.progress.finish(format!(
            "{}: {} rows ({} fetched)",
            request.destination, summary.rows_total, summary.rows_fetched
        ));
        log::info!(
            "Fetch of {} complete: {} day(s), {} fetched, {} total, {} skipped, {} incomplete",
            request.destination,
            summary.days_processed,
            summary.rows_fetched,
            summary.rows_total,
            summary.skipped_days.len(),
            summary.incomplete_days.len()
        );

        Ok(SyncOutcome {
            table: main,
            summary,
        })
    }

    async fn plan_start(
        &self,
        request: &FetchRequest,
        merger: &MainStoreMerger,
        ledger: &RecoveryLedger,
    ) -> Result<StartPlan, SyncError> {
        let epoch = self.config.start_date;

        if request.force_rebuild {
            log::info!("Forced rebuild of {}", merger.main_path().display());
            remove_if_exists(merger.main_path());
            ledger.clear();
            return Ok(StartPlan {
                day: epoch,
                point: StartPoint::Forced,
                main: Table::default(),
                recovered: None,
            });
        }

        let (latest, missing) = match validate_main_store(merger.main_path(), &request.date_column)
        {
            MainStatus::Valid { latest, rows } => {
                log::debug!(
                    "Main store {} is valid: {rows} rows through {latest}",
                    merger.main_path().display()
                );
                (Some(latest), false)
            }
            MainStatus::Missing => (None, true),
            MainStatus::Invalid { .. } => (None, false),
        };

        let main = latest.and_then(|_| match read_main_safely(merger.main_path()) {
            MainRead::Loaded(table) => Some(table),
            MainRead::Empty | MainRead::Corrupt(_) => None,
        });

        let (Some(latest), Some(main)) = (latest, main) else {
            log::info!(
                "No usable main store at {}, rebuilding from batches",
                merger.main_path().display()
            );
            // A store that never got its first merge can still resume. A
            // damaged one restarts from the epoch.
            let recovered = if missing {
                recovered_state(ledger, &request.destination)
            } else {
                ledger.clear();
                None
            };
            let main = merger.rebuild(&Table::default()).await?;
            return Ok(match recovered {
                Some(state) => StartPlan {
                    day: state.current_date,
                    point: StartPoint::Recovered,
                    main,
                    recovered: Some(state),
                },
                None => StartPlan {
                    day: epoch,
                    point: StartPoint::Epoch,
                    main,
                    recovered: None,
                },
            });
        };

        if let Some(state) = recovered_state(ledger, &request.destination) {
            return Ok(StartPlan {
                day: state.current_date,
                point: StartPoint::Recovered,
                main,
                recovered: Some(state),
            });
        }

        let day = latest
            .checked_add_days(Days::new(1))
            .and_then(|d| d.checked_sub_days(Days::new(u64::from(self.config.overlap_days))))
            .unwrap_or(latest);

        Ok(StartPlan {
            day,
            point: StartPoint::Incremental,
            main,
            recovered: None,
        })
    }

    async fn write_timestamp(&self, layout: &DataLayout) -> Result<(), StoreError> {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let marker = Table::with_rows(vec![TIMESTAMP_COLUMN.to_string()], vec![vec![stamp]]);
        let path = layout.timestamp_path();

        retry(&self.policy(), "write timestamp", |_| {
            write_validated(&path, &marker)
        })
        .await?;
        Ok(())
    }

    /// Rebuilds the main store for `destination` from the current main
    /// store (if readable) plus every surviving batch file.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if the rebuilt store cannot be written.
    pub async fn rebuild(&self, destination: &str) -> Result<Table, SyncError> {
        let merger = self.merger(destination);
        let seed = read_main_safely(merger.main_path()).into_table();
        Ok(merger.rebuild(&seed).await?)
    }

    /// Describes the on-disk state without changing it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] if the data directories cannot be listed.
    pub fn status(&self, destination: &str) -> Result<StatusReport, SyncError> {
        let layout = self.layout();
        let main_path = layout.main_path(destination);

        let main_rows = read_table(&main_path).ok().map(|t| t.len());
        let pending_batches = batch_files(&layout.batches_dir())?
            .into_iter()
            .map(|(day, _)| day)
            .collect();

        let mut quarantined = list_quarantined(&layout.data_dir())?;
        quarantined.extend(list_quarantined(&layout.batches_dir())?);

        let last_updated = read_table(&layout.timestamp_path())
            .ok()
            .and_then(|t| t.rows.into_iter().next())
            .and_then(|row| row.into_iter().next());

        Ok(StatusReport {
            main_path,
            main_rows,
            pending_batches,
            quarantined,
            recovery: self.ledger().load(),
            last_updated,
        })
    }
}

/// The stored cursor, if it belongs to `destination`.
fn recovered_state(ledger: &RecoveryLedger, destination: &str) -> Option<RecoveryState> {
    let state = ledger.load()?;
    if state.destination != destination {
        log::warn!(
            "Ignoring recovery cursor for {} while fetching {destination}",
            state.destination
        );
        return None;
    }
    log::info!(
        "Recovered cursor: {} after id {} ({} pending row(s))",
        state.current_date,
        state.last_id,
        state.pending.len()
    );
    Some(state)
}

fn days_with(reports: &[DayReport], outcome: DayOutcome) -> Vec<NaiveDate> {
    reports
        .iter()
        .filter(|r| r.outcome == outcome)
        .map(|r| r.day)
        .collect()
}

fn list_quarantined(dir: &Path) -> Result<Vec<PathBuf>, SyncError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| StoreError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;

    let mut found: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| is_quarantined(p))
        .collect();
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use encounter_sync_source::memory::MemoryConnector;

    use super::*;

    const QUERY: &str = "SELECT * FROM encounters WHERE {predicate}";
    const DEST: &str = "encounters.csv";

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    struct Fixture {
        root: PathBuf,
        config: SyncConfig,
    }

    impl Fixture {
        fn new(label: &str) -> Self {
            let root = std::env::temp_dir().join(format!(
                "encounter_sync_{label}_{}",
                uuid::Uuid::new_v4()
            ));
            std::fs::create_dir_all(&root).unwrap();
            let config = SyncConfig {
                max_retries: 2,
                retry_delay_secs: 0,
                start_date: day(1),
                root_dir: root.clone(),
                recovery_file: Some(root.join("recovery.json")),
                ..SyncConfig::default()
            };
            Self { root, config }
        }

        fn orchestrator(&self, today: NaiveDate) -> Orchestrator {
            Orchestrator::new(self.config.clone()).with_today(today)
        }

        fn main_path(&self) -> PathBuf {
            self.root.join("data").join(DEST)
        }

        fn batches(&self) -> Vec<NaiveDate> {
            batch_files(&self.root.join("data/batches"))
                .unwrap()
                .into_iter()
                .map(|(d, _)| d)
                .collect()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn request() -> FetchRequest {
        FetchRequest::new(QUERY, DEST, "visit_date").with_batch_size(5)
    }

    fn ids(table: &Table) -> Vec<i64> {
        let mut ids: Vec<i64> = table
            .column_values("id")
            .unwrap()
            .into_iter()
            .map(|v| v.parse().unwrap())
            .collect();
        ids.sort_unstable();
        ids
    }

    #[tokio::test]
    async fn three_days_end_to_end() {
        let fx = Fixture::new("scenario_a");
        let mut upstream = MemoryConnector::synthetic(day(1), 3, 10);

        let outcome = fx
            .orchestrator(day(3))
            .fetch(&mut upstream, &request())
            .await
            .unwrap();

        assert_eq!(ids(&outcome.table), (1..=30).collect::<Vec<_>>());
        assert!(outcome.table.is_unique());
        assert_eq!(read_table(&fx.main_path()).unwrap(), outcome.table);
        assert!(fx.batches().is_empty());
        assert!(!fx.root.join("recovery.json").exists());

        let stamp = read_table(&fx.root.join("data/TimeStamp.csv")).unwrap();
        assert_eq!(stamp.columns, vec![TIMESTAMP_COLUMN.to_string()]);
        assert_eq!(stamp.len(), 1);

        let summary = outcome.summary;
        assert_eq!(summary.start_point, StartPoint::Epoch);
        assert_eq!(summary.days_processed, 3);
        assert_eq!(summary.rows_fetched, 30);
        assert_eq!(summary.rows_total, 30);
        assert!(summary.skipped_days.is_empty());
        assert!(summary.incomplete_days.is_empty());
        assert!(!summary.resumed);

        // 10 rows in pages of 5: two full pages plus the empty terminator.
        assert_eq!(upstream.queries().len(), 9);
        assert_eq!((upstream.open_count(), upstream.close_count()), (1, 1));
        assert!(!upstream.is_open());
    }

    #[tokio::test]
    async fn resumes_after_crash_between_persist_and_merge() {
        let fx = Fixture::new("scenario_b");
        let mut upstream = MemoryConnector::synthetic(day(1), 3, 10);

        // First run completes day 1 only.
        fx.orchestrator(day(1))
            .fetch(&mut upstream, &request())
            .await
            .unwrap();

        // A second run fetched and persisted day 2, then died before the
        // merge: the batch file and the cursor are on disk, the main store
        // does not have day 2 yet.
        let orch = fx.orchestrator(day(3));
        let day2 = {
            let mut all = MemoryConnector::synthetic(day(1), 3, 10);
            all.open().await.unwrap();
            let template = QueryTemplate::new(QUERY, "visit_date", "id").unwrap();
            DayBatchProcessor::new(&template, 100)
                .fetch_day(&mut all, day(2), 0)
                .await
        };
        assert_eq!(day2.last_id, 20);
        let persister = BatchPersister::new(orch.layout(), RetryPolicy::new(1, Duration::ZERO));
        persister.persist(&day2.rows, day(2)).await.unwrap();
        orch.ledger()
            .save(&RecoveryState::new(DEST, day(2), day2.last_id, day2.rows))
            .unwrap();

        upstream.clear_queries();
        let outcome = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(ids(&outcome.table), (1..=30).collect::<Vec<_>>());
        assert!(outcome.table.is_unique());
        assert!(outcome.summary.resumed);
        assert_eq!(outcome.summary.start_point, StartPoint::Recovered);
        assert_eq!(outcome.summary.start_date, day(2));
        // Only day 3 is new; the pending day 2 rows came from the cursor.
        assert_eq!(outcome.summary.rows_fetched, 10);

        // Day 2 was not re-queried from the start of its id range.
        let day2_queries: Vec<i64> = upstream
            .queries()
            .iter()
            .filter(|q| q.day == day(2))
            .map(|q| q.after_id)
            .collect();
        assert_eq!(day2_queries, vec![20]);

        assert!(fx.batches().is_empty());
        assert!(orch.ledger().load().is_none());
    }

    #[tokio::test]
    async fn rerun_without_new_data_leaves_main_byte_identical() {
        let fx = Fixture::new("idempotent");
        let mut upstream = MemoryConnector::synthetic(day(1), 3, 10);
        let orch = fx.orchestrator(day(3));

        orch.fetch(&mut upstream, &request()).await.unwrap();
        let first = std::fs::read(fx.main_path()).unwrap();

        let outcome = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(std::fs::read(fx.main_path()).unwrap(), first);
        assert_eq!(outcome.summary.start_point, StartPoint::Incremental);
        // The latest day is today, so only today is refreshed.
        assert_eq!(outcome.summary.start_date, day(3));
        assert_eq!(outcome.summary.rows_total, 30);
    }

    #[tokio::test]
    async fn overlapping_runs_never_duplicate_rows() {
        let mut fx = Fixture::new("dedup");
        fx.config.overlap_days = 2;
        let mut upstream = MemoryConnector::synthetic(day(1), 3, 10);

        fx.orchestrator(day(3))
            .fetch(&mut upstream, &request())
            .await
            .unwrap();

        upstream.push_rows(vec![vec![
            "31".to_string(),
            "2024-01-04 10:00:00".to_string(),
            "patient-31".to_string(),
            "ward-0".to_string(),
        ]]);
        for today in [day(4), day(4), day(5)] {
            let outcome = fx
                .orchestrator(today)
                .fetch(&mut upstream, &request())
                .await
                .unwrap();
            assert!(outcome.table.is_unique());
            assert_eq!(ids(&outcome.table), (1..=31).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn corrupt_main_is_quarantined_and_rebuilt_from_batches() {
        let fx = Fixture::new("quarantine");
        let mut upstream = MemoryConnector::synthetic(day(1), 2, 10);
        let orch = fx.orchestrator(day(2));

        let full = orch.fetch(&mut upstream, &request()).await.unwrap().table;

        // Batches left over from an interrupted run.
        let persister = BatchPersister::new(orch.layout(), RetryPolicy::new(1, Duration::ZERO));
        for d in [day(1), day(2)] {
            let mut rows = Table::new(full.columns.clone());
            for row in &full.rows {
                if row[1].starts_with(&d.format("%Y-%m-%d").to_string()) {
                    rows.push_row(row.clone());
                }
            }
            persister.persist(&rows, d).await.unwrap();
        }
        std::fs::write(fx.main_path(), b"\x00\x01garbage\xff").unwrap();
        orch.ledger()
            .save(&RecoveryState::new(DEST, day(2), 15, Table::default()))
            .unwrap();

        // Upstream has lost everything, so only the batches can restore it.
        let columns = full.columns.clone();
        let mut empty = MemoryConnector::new(Table::new(columns), "visit_date", "id");
        let outcome = orch.fetch(&mut empty, &request()).await.unwrap();

        // A damaged store discards the cursor along with it.
        assert_eq!(outcome.summary.start_point, StartPoint::Epoch);
        assert!(!outcome.summary.resumed);
        assert_eq!(ids(&outcome.table), (1..=20).collect::<Vec<_>>());
        assert_eq!(read_table(&fx.main_path()).unwrap(), outcome.table);

        let status = orch.status(DEST).unwrap();
        assert_eq!(status.quarantined.len(), 1);
        assert_eq!(status.main_rows, Some(20));
        assert!(status.pending_batches.is_empty());
    }

    #[tokio::test]
    async fn force_rebuild_starts_over() {
        let fx = Fixture::new("force");
        let mut upstream = MemoryConnector::synthetic(day(1), 2, 10);
        let orch = fx.orchestrator(day(2));

        orch.fetch(&mut upstream, &request()).await.unwrap();
        upstream.clear_queries();

        let outcome = orch
            .fetch(&mut upstream, &request().with_force_rebuild(true))
            .await
            .unwrap();

        assert_eq!(outcome.summary.start_point, StartPoint::Forced);
        assert_eq!(outcome.summary.start_date, day(1));
        assert_eq!(ids(&outcome.table), (1..=20).collect::<Vec<_>>());
        assert_eq!(upstream.queries()[0].day, day(1));
        assert_eq!(upstream.queries()[0].after_id, 0);
    }

    #[tokio::test]
    async fn incomplete_day_is_retried_on_the_next_run() {
        let fx = Fixture::new("partial");
        // Second page of day 1 fails: ids 1-5 arrive, 6-10 do not.
        let mut upstream = MemoryConnector::synthetic(day(1), 2, 10).fail_on_query(2);
        let orch = fx.orchestrator(day(2));

        let first = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(first.summary.incomplete_days, vec![day(1)]);
        assert_eq!(
            ids(&first.table),
            (1..=5).chain(11..=20).collect::<Vec<_>>()
        );
        assert_eq!(first.summary.days[0].outcome, DayOutcome::Incomplete);
        assert_eq!(first.summary.days[1].outcome, DayOutcome::Merged);

        // The cursor stays on day 1 even though day 2 merged.
        let state = orch.ledger().load().unwrap();
        assert_eq!((state.current_date, state.last_id), (day(1), 5));
        assert_eq!(state.pending.len(), 5);
        assert_eq!(fx.batches(), vec![day(1), day(2)]);

        let seen = upstream.queries().len();
        let second = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(ids(&second.table), (1..=20).collect::<Vec<_>>());
        assert!(second.table.is_unique());
        assert_eq!(second.summary.start_point, StartPoint::Recovered);
        assert_eq!(second.summary.start_date, day(1));
        assert!(second.summary.resumed);
        assert!(second.summary.incomplete_days.is_empty());
        assert_eq!(second.summary.rows_fetched, 15);

        let day1_queries: Vec<i64> = upstream.queries()[seen..]
            .iter()
            .filter(|q| q.day == day(1))
            .map(|q| q.after_id)
            .collect();
        assert_eq!(day1_queries, vec![5, 10]);

        assert!(orch.ledger().load().is_none());
        assert!(fx.batches().is_empty());
    }

    #[tokio::test]
    async fn unpersistable_day_is_skipped_then_recovered() {
        let fx = Fixture::new("skip");
        let orch = fx.orchestrator(day(3));
        std::fs::create_dir_all(orch.layout().batch_path(day(2)).join("blocker")).unwrap();
        let mut upstream = MemoryConnector::synthetic(day(1), 3, 10);

        let first = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(first.summary.skipped_days, vec![day(2)]);
        assert_eq!(
            ids(&first.table),
            (1..=10).chain(21..=30).collect::<Vec<_>>()
        );
        assert_eq!(orch.status(DEST).unwrap().quarantined.len(), 1);

        let state = orch.ledger().load().unwrap();
        assert_eq!((state.current_date, state.last_id), (day(2), 20));
        assert_eq!(state.pending.len(), 10);

        // The blocker was quarantined, so the kept rows persist this time
        // without asking upstream for day 2 again.
        upstream.clear_queries();
        let second = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(ids(&second.table), (1..=30).collect::<Vec<_>>());
        assert!(second.summary.skipped_days.is_empty());
        let day2_queries: Vec<i64> = upstream
            .queries()
            .iter()
            .filter(|q| q.day == day(2))
            .map(|q| q.after_id)
            .collect();
        assert_eq!(day2_queries, vec![20]);
        assert!(orch.ledger().load().is_none());
    }

    #[tokio::test]
    async fn missing_main_store_still_honors_the_cursor() {
        let fx = Fixture::new("first_run_crash");
        let orch = fx.orchestrator(day(2));

        // A first run persisted day 1 and saved its cursor, then died
        // before the first merge created the main store.
        let day1 = {
            let mut all = MemoryConnector::synthetic(day(1), 2, 10);
            all.open().await.unwrap();
            let template = QueryTemplate::new(QUERY, "visit_date", "id").unwrap();
            DayBatchProcessor::new(&template, 100)
                .fetch_day(&mut all, day(1), 0)
                .await
        };
        let persister = BatchPersister::new(orch.layout(), RetryPolicy::new(1, Duration::ZERO));
        persister.persist(&day1.rows, day(1)).await.unwrap();
        orch.ledger()
            .save(&RecoveryState::new(DEST, day(1), day1.last_id, day1.rows))
            .unwrap();
        assert!(!fx.main_path().exists());

        let mut upstream = MemoryConnector::synthetic(day(1), 2, 10);
        let outcome = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(outcome.summary.start_point, StartPoint::Recovered);
        assert!(outcome.summary.resumed);
        assert_eq!(outcome.summary.rows_fetched, 10);
        assert_eq!(ids(&outcome.table), (1..=20).collect::<Vec<_>>());

        let day1_queries: Vec<i64> = upstream
            .queries()
            .iter()
            .filter(|q| q.day == day(1))
            .map(|q| q.after_id)
            .collect();
        assert_eq!(day1_queries, vec![10]);
    }

    #[tokio::test]
    async fn cursor_past_the_last_day_is_not_a_resume() {
        let fx = Fixture::new("cleanup_crash");
        let orch = fx.orchestrator(day(3));
        let mut upstream = MemoryConnector::synthetic(day(1), 3, 10);
        orch.fetch(&mut upstream, &request()).await.unwrap();

        // Left behind by a run that died while cleaning up.
        orch.ledger()
            .save(&RecoveryState::start_of(DEST, day(4)))
            .unwrap();

        let outcome = orch.fetch(&mut upstream, &request()).await.unwrap();

        assert_eq!(outcome.summary.start_point, StartPoint::Recovered);
        assert_eq!(outcome.summary.start_date, day(3));
        assert!(!outcome.summary.resumed);
        assert_eq!(ids(&outcome.table), (1..=30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn fatal_error_still_closes_and_keeps_state() {
        let mut fx = Fixture::new("fatal");
        // The recovery file's parent is a regular file, so saving fails.
        let blocker = fx.root.join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();
        fx.config.recovery_file = Some(blocker.join("recovery.json"));
        let mut upstream = MemoryConnector::synthetic(day(1), 1, 3);

        let err = fx
            .orchestrator(day(1))
            .fetch(&mut upstream, &request())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!((upstream.open_count(), upstream.close_count()), (1, 1));
        assert!(!upstream.is_open());
        assert!(!fx.root.join("data/TimeStamp.csv").exists());
    }

    #[tokio::test]
    async fn invalid_template_never_opens_the_connection() {
        let fx = Fixture::new("template");
        let mut upstream = MemoryConnector::synthetic(day(1), 1, 3);
        let bad = FetchRequest::new(QUERY, DEST, "visit date; DROP TABLE x");

        let err = fx
            .orchestrator(day(1))
            .fetch(&mut upstream, &bad)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Source(_)));
        assert_eq!(upstream.open_count(), 0);
    }
}
