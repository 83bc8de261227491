//! Validated atomic writes and quarantine.
//!
//! A table is written to `<path>.tmp`, read back and checked, and only then
//! renamed over `<path>`. A reader therefore never observes a half-written
//! canonical file.

use std::path::{Path, PathBuf};

use chrono::Local;
use encounter_sync_source_models::Table;

use crate::csv_table::{read_table, write_table};
use crate::paths::ensure_dir;
use crate::{StoreError, io_err};

/// Suffix of quarantined files.
pub const QUARANTINE_SUFFIX: &str = "quarantined";

/// Returns the temp path used while writing `path`.
#[must_use]
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Writes `table` to `path` through a validated temp file.
///
/// Returns the table as it was read back from disk.
///
/// # Errors
///
/// Returns [`StoreError::Corrupt`] if the table is empty or the read-back
/// does not match, and [`StoreError::Io`]/[`StoreError::Csv`] if any file
/// operation fails. The temp file is removed on failure and the canonical
/// file is left untouched.
pub fn write_validated(path: &Path, table: &Table) -> Result<Table, StoreError> {
    if table.is_empty() {
        return Err(StoreError::Corrupt {
            path: path.display().to_string(),
            reason: "refusing to write an empty table".to_string(),
        });
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }

    let tmp = tmp_path(path);
    let result = write_and_check(&tmp, table).and_then(|written| {
        std::fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(written)
    });

    if result.is_err() {
        remove_if_exists(&tmp);
    }

    result
}

fn write_and_check(tmp: &Path, table: &Table) -> Result<Table, StoreError> {
    write_table(tmp, table)?;

    let written = read_table(tmp)?;
    if written.columns != table.columns {
        return Err(StoreError::Corrupt {
            path: tmp.display().to_string(),
            reason: "header changed on read-back".to_string(),
        });
    }
    if written.len() != table.len() {
        return Err(StoreError::Corrupt {
            path: tmp.display().to_string(),
            reason: format!(
                "expected {} rows on read-back, found {}",
                table.len(),
                written.len()
            ),
        });
    }

    Ok(written)
}

/// Renames `path` aside as `<path>.<YYYYmmddTHHMMSS>.quarantined`.
///
/// Returns the new location. A numeric suffix is added if a file with
/// that name already exists.
///
/// # Errors
///
/// Returns [`StoreError::Io`] if the rename fails.
pub fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
    let stamp = Local::now().format("%Y%m%dT%H%M%S");

    let mut target = suffixed(path, &format!("{stamp}.{QUARANTINE_SUFFIX}"));
    let mut n = 1;
    while target.exists() {
        target = suffixed(path, &format!("{stamp}-{n}.{QUARANTINE_SUFFIX}"));
        n += 1;
    }

    std::fs::rename(path, &target).map_err(io_err(path))?;
    log::warn!("Quarantined {} -> {}", path.display(), target.display());

    Ok(target)
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Returns `true` if `path` is a quarantined artifact.
#[must_use]
pub fn is_quarantined(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == QUARANTINE_SUFFIX)
}

/// Removes a file, ignoring "not found" and logging anything else.
pub fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove {}: {e}", path.display()),
    }
}
