//! Single-slot resume cursor.
//!
//! The ledger holds at most one day's in-flight progress. It is written
//! after each fetch and after each merge, and cleared when a run
//! completes. Anything unreadable is treated as "nothing to resume".

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use encounter_sync_source_models::Table;
use serde::{Deserialize, Serialize};

use crate::atomic::{remove_if_exists, tmp_path};
use crate::paths::ensure_dir;
use crate::{StoreError, io_err};

/// Current on-disk format version.
pub const RECOVERY_VERSION: u32 = 1;

/// Persisted in-flight progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    /// Format version, always [`RECOVERY_VERSION`] when written.
    pub version: u32,
    /// Main store file this state belongs to.
    pub destination: String,
    /// Day to resume.
    pub current_date: NaiveDate,
    /// Highest id already fetched for `current_date` (0 = none).
    pub last_id: i64,
    /// Rows fetched for `current_date` but not yet merged.
    pub pending: Table,
}

impl RecoveryState {
    /// State for `day` with rows fetched up to `last_id`.
    #[must_use]
    pub fn new(destination: &str, current_date: NaiveDate, last_id: i64, pending: Table) -> Self {
        Self {
            version: RECOVERY_VERSION,
            destination: destination.to_string(),
            current_date,
            last_id,
            pending,
        }
    }

    /// State pointing at the start of `day` with nothing pending.
    #[must_use]
    pub fn start_of(destination: &str, day: NaiveDate) -> Self {
        Self::new(destination, day, 0, Table::default())
    }
}

/// JSON file holding the [`RecoveryState`].
#[derive(Debug, Clone)]
pub struct RecoveryLedger {
    path: PathBuf,
}

impl RecoveryLedger {
    /// Ledger stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically replaces the stored state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the state cannot be encoded or written.
    pub fn save(&self, state: &RecoveryState) -> Result<(), StoreError> {
        let json = serde_json::to_vec(state)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_dir(parent)?;
        }
        let tmp = tmp_path(&self.path);

        let result = std::fs::write(&tmp, &json)
            .map_err(io_err(&tmp))
            .and_then(|()| std::fs::rename(&tmp, &self.path).map_err(io_err(&self.path)));
        if result.is_err() {
            remove_if_exists(&tmp);
        }
        result?;

        log::debug!(
            "Recovery cursor saved: {} last_id={} pending={}",
            state.current_date,
            state.last_id,
            state.pending.len()
        );
        Ok(())
    }

    /// Loads the stored state, if any.
    ///
    /// Missing, unreadable, undecodable or wrong-version files all yield
    /// `None`.
    #[must_use]
    pub fn load(&self) -> Option<RecoveryState> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("Ignoring unreadable recovery file {}: {e}", self.path.display());
                return None;
            }
        };

        match serde_json::from_slice::<RecoveryState>(&bytes) {
            Ok(state) if state.version == RECOVERY_VERSION => Some(state),
            Ok(state) => {
                log::warn!(
                    "Ignoring recovery file {} with unsupported version {}",
                    self.path.display(),
                    state.version
                );
                None
            }
            Err(e) => {
                log::warn!("Ignoring corrupt recovery file {}: {e}", self.path.display());
                None
            }
        }
    }

    /// Removes the stored state. No-op if there is none.
    pub fn clear(&self) {
        remove_if_exists(&self.path);
        remove_if_exists(&tmp_path(&self.path));
    }
}
