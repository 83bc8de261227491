//! Per-day batch files.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use encounter_sync_source_models::Table;

use crate::atomic::{quarantine, remove_if_exists, tmp_path, write_validated};
use crate::paths::{DataLayout, batch_files};
use crate::retry::{RetryPolicy, retry};
use crate::{StoreError, io_err};

/// Durably writes one day's rows to `data/batches/<YYYY-MM-DD>.csv`.
#[derive(Debug, Clone)]
pub struct BatchPersister {
    layout: DataLayout,
    policy: RetryPolicy,
}

impl BatchPersister {
    /// Creates a persister writing under `layout`.
    #[must_use]
    pub const fn new(layout: DataLayout, policy: RetryPolicy) -> Self {
        Self { layout, policy }
    }

    /// Canonical batch path for `day`.
    #[must_use]
    pub fn path_for(&self, day: NaiveDate) -> PathBuf {
        self.layout.batch_path(day)
    }

    /// Persists `rows` as the batch for `day`.
    ///
    /// Returns the validated batch as read back from disk, or `None` if the
    /// rows were empty or every attempt failed. In the latter case any file
    /// left at the canonical path is quarantined so it cannot be mistaken
    /// for a good batch later.
    pub async fn persist(&self, rows: &Table, day: NaiveDate) -> Option<Table> {
        if rows.is_empty() {
            log::warn!("Not persisting empty batch for {day}");
            return None;
        }

        let path = self.path_for(day);
        let what = format!("persist batch {}", path.display());

        let result = retry(&self.policy, &what, |_| {
            self.layout.ensure_dirs()?;
            write_validated(&path, rows)
        })
        .await;

        match result {
            Ok(batch) => {
                log::debug!("Persisted {} rows to {}", batch.len(), path.display());
                Some(batch)
            }
            Err(e) => {
                log::error!("Giving up on batch for {day}: {e}");
                remove_if_exists(&tmp_path(&path));
                if path.exists()
                    && let Err(qe) = quarantine(&path)
                {
                    log::error!("Failed to quarantine {}: {qe}", path.display());
                }
                None
            }
        }
    }

    /// Deletes every batch file (and leftover temp file) in the batches
    /// directory. Quarantined files are kept.
    ///
    /// Returns the number of batch files removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be listed or a
    /// file cannot be removed.
    pub fn remove_consumed(&self) -> Result<usize, StoreError> {
        let dir = self.layout.batches_dir();
        if !dir.is_dir() {
            return Ok(0);
        }
        let canonical_dir = dir.canonicalize().map_err(io_err(&dir))?;

        let mut removed = 0;
        for (_, path) in batch_files(&dir)? {
            if !is_inside(&path, &canonical_dir)? {
                log::warn!(
                    "Refusing to delete {}: not inside {}",
                    path.display(),
                    canonical_dir.display()
                );
                continue;
            }
            std::fs::remove_file(&path).map_err(io_err(&path))?;
            remove_if_exists(&tmp_path(&path));
            removed += 1;
        }

        log::info!("Removed {removed} consumed batch file(s)");
        Ok(removed)
    }
}

/// Returns `true` if `path`'s real parent directory is exactly `dir`.
fn is_inside(path: &Path, dir: &Path) -> Result<bool, StoreError> {
    let real = path.canonicalize().map_err(io_err(path))?;
    Ok(real.parent() == Some(dir))
}
