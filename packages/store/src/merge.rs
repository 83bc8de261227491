//! Merging batches into the main store.

use std::path::{Path, PathBuf};

use encounter_sync_source_models::Table;

use crate::StoreError;
use crate::atomic::{quarantine, write_validated};
use crate::csv_table::read_table;
use crate::paths::batch_files;
use crate::retry::{RetryPolicy, retry};

/// Result of reading the main store without failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainRead {
    /// The file parsed and has rows.
    Loaded(Table),
    /// No file exists yet.
    Empty,
    /// The file was unusable and has been moved to the given path (or
    /// could not be moved, in which case the original path is kept).
    Corrupt(PathBuf),
}

impl MainRead {
    /// The usable dataset: the loaded table, or an empty one.
    #[must_use]
    pub fn into_table(self) -> Table {
        match self {
            Self::Loaded(table) => table,
            Self::Empty | Self::Corrupt(_) => Table::default(),
        }
    }
}

/// Reads the main store, quarantining it if it cannot be parsed or has no
/// rows.
#[must_use]
pub fn read_main_safely(path: &Path) -> MainRead {
    if !path.exists() {
        return MainRead::Empty;
    }

    let reason = match read_table(path) {
        Ok(table) if !table.is_empty() => return MainRead::Loaded(table),
        Ok(_) => "no data rows".to_string(),
        Err(e) => e.to_string(),
    };

    log::warn!("Main store {} is unusable: {reason}", path.display());
    match quarantine(path) {
        Ok(moved) => MainRead::Corrupt(moved),
        Err(e) => {
            log::error!("Failed to quarantine {}: {e}", path.display());
            MainRead::Corrupt(path.to_path_buf())
        }
    }
}

/// Maintains the canonical deduplicated dataset file.
#[derive(Debug, Clone)]
pub struct MainStoreMerger {
    main_path: PathBuf,
    batches_dir: PathBuf,
    policy: RetryPolicy,
}

impl MainStoreMerger {
    /// Merger for the main store at `main_path`, rebuilding from
    /// `batches_dir` when needed.
    #[must_use]
    pub fn new(
        main_path: impl Into<PathBuf>,
        batches_dir: impl Into<PathBuf>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            main_path: main_path.into(),
            batches_dir: batches_dir.into(),
            policy,
        }
    }

    /// Path of the main store file.
    #[must_use]
    pub fn main_path(&self) -> &Path {
        &self.main_path
    }

    /// Appends `batch` to `existing`, drops duplicate rows and rewrites the
    /// main store.
    ///
    /// Nothing is written when the batch adds no new rows and the file is
    /// already in place, so re-running over unchanged data leaves the file
    /// byte-identical. If the write keeps failing, the store is rebuilt
    /// from `existing` plus every surviving batch file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] only if the fallback rebuild also fails.
    pub async fn merge_incremental(
        &self,
        existing: &Table,
        batch: Table,
    ) -> Result<Table, StoreError> {
        let mut combined = existing.clone();
        combined.append(batch);
        let dropped = combined.dedup();

        if combined.is_empty() {
            return Ok(combined);
        }
        if combined == *existing && self.main_path.is_file() {
            log::debug!(
                "No new rows for {} ({dropped} duplicate(s))",
                self.main_path.display()
            );
            return Ok(combined);
        }

        let what = format!("write main store {}", self.main_path.display());
        match retry(&self.policy, &what, |_| write_validated(&self.main_path, &combined)).await {
            Ok(written) => {
                log::info!(
                    "Main store {} now has {} rows (+{}, {dropped} duplicate(s) dropped)",
                    self.main_path.display(),
                    written.len(),
                    written.len().saturating_sub(existing.len())
                );
                Ok(written)
            }
            Err(e) => {
                log::warn!("Incremental merge failed, rebuilding from batches: {e}");
                self.rebuild(existing).await
            }
        }
    }

    /// Rebuilds the main store from `seed` followed by every batch file, in
    /// date order.
    ///
    /// Batch files that cannot be parsed or are empty are quarantined and
    /// skipped. An empty result is returned without writing anything.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch directory cannot be listed or
    /// the rebuilt store cannot be written.
    pub async fn rebuild(&self, seed: &Table) -> Result<Table, StoreError> {
        let files = batch_files(&self.batches_dir)?;
        log::info!(
            "Rebuilding {} from {} batch file(s) and {} seed row(s)",
            self.main_path.display(),
            files.len(),
            seed.len()
        );

        let mut combined = seed.clone();
        for (day, path) in files {
            match read_table(&path) {
                Ok(batch) if !batch.is_empty() => combined.append(batch),
                Ok(_) => {
                    log::warn!("Skipping empty batch for {day}");
                    quarantine_quietly(&path);
                }
                Err(e) => {
                    log::warn!("Skipping unreadable batch for {day}: {e}");
                    quarantine_quietly(&path);
                }
            }
        }
        let dropped = combined.dedup();

        if combined.is_empty() {
            log::info!("Nothing to rebuild {} from", self.main_path.display());
            return Ok(combined);
        }

        let what = format!("rebuild main store {}", self.main_path.display());
        let written = retry(&self.policy, &what, |_| {
            write_validated(&self.main_path, &combined)
        })
        .await?;

        log::info!(
            "Rebuilt {} with {} rows ({dropped} duplicate(s) dropped)",
            self.main_path.display(),
            written.len()
        );
        Ok(written)
    }
}

fn quarantine_quietly(path: &Path) {
    if let Err(e) = quarantine(path) {
        log::error!("Failed to quarantine {}: {e}", path.display());
    }
}
