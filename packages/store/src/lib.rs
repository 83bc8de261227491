#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! On-disk artifacts of the encounter sync pipeline.
//!
//! - [`batch::BatchPersister`] writes one day's rows to
//!   `data/batches/<YYYY-MM-DD>.csv` with validation and bounded retry.
//! - [`ledger::RecoveryLedger`] keeps the single-slot resume cursor.
//! - [`merge::MainStoreMerger`] folds validated batches into the
//!   deduplicated main store, or rebuilds it from surviving batches.
//! - [`validate::validate_main_store`] cheaply checks the main store before
//!   it is trusted.
//!
//! Every write goes to a temp file that is validated and then renamed into
//! place. Suspect files are quarantined (renamed aside), never deleted.

pub mod atomic;
pub mod batch;
pub mod csv_table;
pub mod ledger;
pub mod merge;
pub mod paths;
pub mod retry;
pub mod validate;

use std::path::Path;

pub use retry::RetryPolicy;

/// Errors that can occur while reading or writing pipeline artifacts.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error on a specific path.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path that caused the error.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// CSV encoding or decoding failed.
    #[error("CSV error at {path}: {source}")]
    Csv {
        /// Path that caused the error.
        path: String,
        /// Underlying CSV error.
        source: csv::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A file parsed but failed structural validation.
    #[error("Corrupt artifact {path}: {reason}")]
    Corrupt {
        /// Path of the artifact.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Every attempt of a retried operation failed.
    #[error("{what} failed after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        /// Operation that was retried.
        what: String,
        /// Number of attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: Box<Self>,
    },
}

/// Builds a mapper from [`std::io::Error`] to [`StoreError::Io`] for `path`.
pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Builds a mapper from [`csv::Error`] to [`StoreError::Csv`] for `path`.
pub(crate) fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> StoreError + '_ {
    move |source| StoreError::Csv {
        path: path.display().to_string(),
        source,
    }
}
