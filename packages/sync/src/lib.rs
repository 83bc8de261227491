#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Incremental, crash-safe fetch of clinical encounter records.
//!
//! The [`orchestrator::Orchestrator`] walks every day from a resolved start
//! date through today, fetching each day page by page, persisting it as a
//! batch file and merging it into a deduplicated main store. A single-slot
//! recovery cursor lets an interrupted run pick up where it stopped.

pub mod config;
pub mod orchestrator;

use encounter_sync_source::SourceError;
use encounter_sync_store::StoreError;

/// Errors that end a sync run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Talking to the upstream store failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Reading or writing local artifacts failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The configuration is incomplete or inconsistent.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of what went wrong.
        message: String,
    },

    /// The configuration file is not valid TOML.
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
}
