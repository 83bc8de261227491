#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Upstream connector trait and day-by-day paginated fetching.
//!
//! A [`SourceConnector`] executes one page query at a time against the
//! upstream encounter store. [`day_batch::DayBatchProcessor`] drives a
//! connector through every page of a single calendar day using a
//! forward-only id cursor.

pub mod day_batch;
#[cfg(feature = "duckdb")]
pub mod duckdb_connector;
pub mod memory;
pub mod progress;
pub mod query;
pub mod tunnel;

use async_trait::async_trait;
use chrono::NaiveDate;
use encounter_sync_source_models::Table;

/// Errors that can occur while talking to the upstream store.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// I/O error (sockets, child processes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A page query failed.
    #[error("Query failed: {message}")]
    Query {
        /// Description of what went wrong.
        message: String,
    },

    /// A page did not advance the id cursor.
    #[error("Cursor error: {message}")]
    Cursor {
        /// Description of what went wrong.
        message: String,
    },

    /// Opening or closing the upstream connection failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of what went wrong.
        message: String,
    },

    /// The SSH tunnel could not be established.
    #[error("Tunnel error: {message}")]
    Tunnel {
        /// Description of what went wrong.
        message: String,
    },

    /// The query template or one of its column names is unusable.
    #[error("Invalid query template: {message}")]
    InvalidTemplate {
        /// Description of what went wrong.
        message: String,
    },

    /// `DuckDB` reported an error.
    #[cfg(feature = "duckdb")]
    #[error("DuckDB error: {0}")]
    Duckdb(#[from] ::duckdb::Error),
}

/// One page request: all rows of `day` with an id greater than `after_id`,
/// ordered by id, at most `limit` of them.
///
/// `sql` is the rendered query for connectors that speak SQL; the
/// structured fields carry the same predicate for those that do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Rendered SQL for this page.
    pub sql: String,
    /// Calendar day being fetched.
    pub day: NaiveDate,
    /// Exclusive lower bound on the id column.
    pub after_id: i64,
    /// Maximum number of rows in the page.
    pub limit: u64,
}

/// Narrow interface to the upstream encounter store.
///
/// The connection is opened once per run, queried page by page, and closed
/// on every exit path by the caller.
#[async_trait]
pub trait SourceConnector: Send {
    /// Returns a human-readable name for log messages.
    fn name(&self) -> &str;

    /// Acquires the upstream connection (and any tunnel it needs).
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the connection cannot be established.
    async fn open(&mut self) -> Result<(), SourceError>;

    /// Executes one page query and returns its rows.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the query fails.
    async fn query(&mut self, page: &PageQuery) -> Result<Table, SourceError>;

    /// Releases the connection. Must be safe to call when `open` failed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if tearing down the connection fails.
    async fn close(&mut self) -> Result<(), SourceError>;
}
