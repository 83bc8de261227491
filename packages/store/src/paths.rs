#![allow(clippy::module_name_repetitions)]
//! Canonical file paths for the dataset directory.
//!
//! All dataset paths are relative to `<root>/data/`:
//!
//! | Path | Contents |
//! |---|---|
//! | `data/<main file>` | canonical deduplicated dataset |
//! | `data/batches/<YYYY-MM-DD>.csv` | one day's rows, pending merge |
//! | `data/TimeStamp.csv` | last successful run marker |
//!
//! The recovery cursor lives outside this tree (see
//! [`default_recovery_path`]).

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::{StoreError, io_err};

/// File extension of every tabular artifact.
pub const TABLE_EXTENSION: &str = "csv";

/// Directory layout rooted at a project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the `data/` directory path.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Returns the `data/batches/` directory for per-day batch files.
    #[must_use]
    pub fn batches_dir(&self) -> PathBuf {
        self.data_dir().join("batches")
    }

    /// Returns the path of the main store named `file_name`.
    #[must_use]
    pub fn main_path(&self, file_name: &str) -> PathBuf {
        self.data_dir().join(file_name)
    }

    /// Returns the batch file path for `day`.
    #[must_use]
    pub fn batch_path(&self, day: NaiveDate) -> PathBuf {
        self.batches_dir()
            .join(format!("{}.{TABLE_EXTENSION}", day.format("%Y-%m-%d")))
    }

    /// Returns the last-success marker path.
    #[must_use]
    pub fn timestamp_path(&self) -> PathBuf {
        self.data_dir().join(format!("TimeStamp.{TABLE_EXTENSION}"))
    }

    /// Creates `data/` and `data/batches/` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        ensure_dir(&self.data_dir())?;
        ensure_dir(&self.batches_dir())
    }
}

/// Returns the default recovery cursor path in the system temp directory.
#[must_use]
pub fn default_recovery_path() -> PathBuf {
    std::env::temp_dir().join("encounter_sync_recovery.json")
}

/// Ensures a directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the directory cannot be created.
pub fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    if !path.is_dir() {
        std::fs::create_dir_all(path).map_err(io_err(path))?;
    }
    Ok(())
}

/// Parses the day out of a batch file name (`YYYY-MM-DD.csv`).
#[must_use]
pub fn batch_day(path: &Path) -> Option<NaiveDate> {
    if path.extension()? != TABLE_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

/// Lists the batch files in `dir`, oldest day first.
///
/// Quarantined and temp files are not batch files and are skipped. A
/// missing directory yields an empty list.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the directory cannot be read.
pub fn batch_files(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>, StoreError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(day) = batch_day(&path) {
            files.push((day, path));
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::scratch_dir;

    #[test]
    fn layout_paths() {
        let layout = DataLayout::new("/srv/report");
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();

        assert_eq!(
            layout.main_path("encounters.csv"),
            PathBuf::from("/srv/report/data/encounters.csv")
        );
        assert_eq!(
            layout.batch_path(day),
            PathBuf::from("/srv/report/data/batches/2024-02-29.csv")
        );
        assert_eq!(
            layout.timestamp_path(),
            PathBuf::from("/srv/report/data/TimeStamp.csv")
        );
    }

    #[test]
    fn batch_day_only_matches_plain_batch_names() {
        let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(batch_day(Path::new("b/2024-02-29.csv")), Some(day));
        assert_eq!(batch_day(Path::new("b/2024-02-29.csv.tmp")), None);
        assert_eq!(
            batch_day(Path::new("b/2024-02-29.csv.20240301T000000.quarantined")),
            None
        );
        assert_eq!(batch_day(Path::new("b/notes.csv")), None);
    }

    #[test]
    fn batch_files_sorted_by_day() {
        let dir = scratch_dir("paths");
        for name in ["2024-01-03.csv", "2024-01-01.csv", "2024-01-02.csv.tmp", "readme.txt"] {
            std::fs::write(dir.join(name), b"id\n1\n").unwrap();
        }

        let days: Vec<String> = batch_files(&dir)
            .unwrap()
            .into_iter()
            .map(|(day, _)| day.to_string())
            .collect();
        assert_eq!(days, vec!["2024-01-01", "2024-01-03"]);

        assert!(batch_files(&dir.join("missing")).unwrap().is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
