//! Cheap pre-flight check of the main store.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use encounter_sync_source_models::parse_day;

use crate::atomic::quarantine;
use crate::csv_table::read_column;

/// Outcome of [`validate_main_store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MainStatus {
    /// The date column is present, non-empty and fully parseable.
    Valid {
        /// Latest day found in the date column.
        latest: NaiveDate,
        /// Number of data rows.
        rows: usize,
    },
    /// No main store file exists.
    Missing,
    /// The file failed validation.
    Invalid {
        /// Why it failed.
        reason: String,
        /// Where it was moved to, if the quarantine succeeded.
        quarantined: Option<PathBuf>,
    },
}

/// Checks the main store by reading only `date_column`.
///
/// Any failure quarantines the file so that a rebuild starts from a clean
/// slate.
#[must_use]
pub fn validate_main_store(path: &Path, date_column: &str) -> MainStatus {
    if !path.exists() {
        return MainStatus::Missing;
    }

    match inspect(path, date_column) {
        Ok((latest, rows)) => MainStatus::Valid { latest, rows },
        Err(reason) => {
            log::warn!("Main store {} failed validation: {reason}", path.display());
            let quarantined = match quarantine(path) {
                Ok(moved) => Some(moved),
                Err(e) => {
                    log::error!("Failed to quarantine {}: {e}", path.display());
                    None
                }
            };
            MainStatus::Invalid {
                reason,
                quarantined,
            }
        }
    }
}

fn inspect(path: &Path, date_column: &str) -> Result<(NaiveDate, usize), String> {
    let values = read_column(path, date_column)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("missing date column '{date_column}'"))?;

    let mut latest: Option<NaiveDate> = None;
    for (i, cell) in values.iter().enumerate() {
        let day = parse_day(cell)
            .ok_or_else(|| format!("row {}: '{cell}' is not a date", i + 1))?;
        latest = Some(latest.map_or(day, |l| l.max(day)));
    }

    latest
        .map(|latest| (latest, values.len()))
        .ok_or_else(|| "no data rows".to_string())
}
