#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Schema-agnostic tabular batch type and upstream connection routes.
//!
//! Every page returned by a source connector, every daily batch and the
//! main store itself are represented as a [`Table`]: an ordered column list
//! plus rows of textual cells. Row identity for deduplication is full-row
//! equality.

use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One encounter row. Cells are the textual rendering of the upstream
/// value; SQL `NULL` is the empty string.
pub type Row = Vec<String>;

/// An ordered set of rows sharing a column list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Column names in display order.
    pub columns: Vec<String>,
    /// Rows, each exactly `columns.len()` cells wide.
    pub rows: Vec<Row>,
}

impl Table {
    /// Creates an empty table with the given columns.
    #[must_use]
    pub const fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Creates a table from columns and rows. Rows are padded or truncated
    /// to the column count.
    #[must_use]
    pub fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row);
        }
        table
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns the position of `name` in the column list.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Appends a row, padding missing cells with empty strings.
    pub fn push_row(&mut self, mut row: Row) {
        row.resize(self.columns.len(), String::new());
        self.rows.push(row);
    }

    /// Appends every row of `other`, aligning its columns by name.
    ///
    /// Columns only present in `other` are added to the right of the
    /// existing columns and back-filled with empty cells. When `self` has
    /// no columns yet it adopts `other`'s column list as-is.
    pub fn append(&mut self, other: Self) {
        if self.columns.is_empty() {
            *self = other;
            return;
        }
        if self.columns == other.columns {
            self.rows.extend(other.rows);
            return;
        }

        for column in &other.columns {
            if self.column_index(column).is_none() {
                self.columns.push(column.clone());
            }
        }
        let width = self.columns.len();
        for row in &mut self.rows {
            row.resize(width, String::new());
        }

        let mapping: Vec<usize> = other
            .columns
            .iter()
            .filter_map(|c| self.column_index(c))
            .collect();

        for row in other.rows {
            let mut aligned = vec![String::new(); width];
            for (value, &target) in row.into_iter().zip(&mapping) {
                aligned[target] = value;
            }
            self.rows.push(aligned);
        }
    }

    /// Drops every row that is identical to an earlier row, preserving the
    /// order of first occurrences.
    ///
    /// Returns the number of rows removed.
    pub fn dedup(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen: HashSet<Row> = HashSet::with_capacity(before);
        self.rows.retain(|row| seen.insert(row.clone()));
        before - self.rows.len()
    }

    /// Returns `true` if no two rows are identical.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        let mut seen: HashSet<&Row> = HashSet::with_capacity(self.rows.len());
        self.rows.iter().all(|row| seen.insert(row))
    }

    /// Returns the maximum integer value of `column`.
    ///
    /// Returns `None` if the column does not exist, the table is empty, or
    /// any cell fails to parse as an integer.
    #[must_use]
    pub fn max_id(&self, column: &str) -> Option<i64> {
        let idx = self.column_index(column)?;
        let mut max: Option<i64> = None;
        for row in &self.rows {
            let id = row.get(idx)?.trim().parse::<i64>().ok()?;
            max = Some(max.map_or(id, |m| m.max(id)));
        }
        max
    }

    /// Returns the cells of `column`, or `None` if it does not exist.
    #[must_use]
    pub fn column_values(&self, column: &str) -> Option<Vec<&str>> {
        let idx = self.column_index(column)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(idx).map_or("", String::as_str))
                .collect(),
        )
    }
}

/// Parses the calendar day of a date-like cell.
///
/// Accepts anything whose first ten characters are `YYYY-MM-DD`, so plain
/// dates, `DATETIME` values and ISO-8601 timestamps all qualify.
#[must_use]
pub fn parse_day(cell: &str) -> Option<NaiveDate> {
    let cell = cell.trim();
    let prefix = cell.get(..10)?;
    NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
}

/// SSH jump host used to reach the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshRoute {
    /// Jump host name or address.
    pub host: String,
    /// SSH port.
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user on the jump host.
    pub user: String,
    /// Path to a private key file, or a password when no such file exists.
    #[serde(default)]
    pub key_or_password: String,
}

const fn default_ssh_port() -> u16 {
    22
}

/// Upstream relational database coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRoute {
    /// Database host as seen from the SSH jump host (or directly).
    pub host: String,
    /// Database port.
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Database user.
    pub user: String,
    /// Database password.
    #[serde(default)]
    pub password: String,
    /// Database (schema) name.
    pub database: String,
}

const fn default_db_port() -> u16 {
    3306
}

/// Everything a connector needs to reach the upstream store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Connect to the database directly instead of through the SSH route.
    #[serde(default)]
    pub use_localhost: bool,
    /// SSH jump host, required unless `use_localhost` is set.
    #[serde(default)]
    pub ssh_route: Option<SshRoute>,
    /// Database coordinates.
    pub db_route: DbRoute,
    /// Local port for the tunnel. `0` picks a free port.
    #[serde(default)]
    pub local_port: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn row(cells: &[&str]) -> Row {
        cells.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let mut table = Table::with_rows(
            cols(&["id", "name"]),
            vec![row(&["1", "a"]), row(&["2", "b"]), row(&["1", "a"]), row(&["3", "c"])],
        );

        assert!(!table.is_unique());
        assert_eq!(table.dedup(), 1);
        assert!(table.is_unique());
        assert_eq!(
            table.rows,
            vec![row(&["1", "a"]), row(&["2", "b"]), row(&["3", "c"])]
        );
    }

    #[test]
    fn rows_differing_in_one_cell_are_distinct() {
        let mut table = Table::with_rows(
            cols(&["id", "name"]),
            vec![row(&["1", "a"]), row(&["1", "A"])],
        );
        assert_eq!(table.dedup(), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn append_aligns_columns_by_name() {
        let mut left = Table::with_rows(cols(&["id", "name"]), vec![row(&["1", "a"])]);
        let right = Table::with_rows(
            cols(&["name", "id", "ward"]),
            vec![row(&["b", "2", "north"])],
        );

        left.append(right);

        assert_eq!(left.columns, cols(&["id", "name", "ward"]));
        assert_eq!(
            left.rows,
            vec![row(&["1", "a", ""]), row(&["2", "b", "north"])]
        );
    }

    #[test]
    fn append_into_empty_adopts_columns() {
        let mut table = Table::default();
        table.append(Table::with_rows(cols(&["id"]), vec![row(&["7"])]));
        assert_eq!(table.columns, cols(&["id"]));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn push_row_pads_short_rows() {
        let mut table = Table::new(cols(&["id", "name", "ward"]));
        table.push_row(row(&["1"]));
        assert_eq!(table.rows[0], row(&["1", "", ""]));
    }

    #[test]
    fn max_id_parses_integer_column() {
        let table = Table::with_rows(
            cols(&["id"]),
            vec![row(&["5"]), row(&["12"]), row(&["9"])],
        );
        assert_eq!(table.max_id("id"), Some(12));
        assert_eq!(table.max_id("missing"), None);
    }

    #[test]
    fn max_id_rejects_non_numeric_cells() {
        let table = Table::with_rows(cols(&["id"]), vec![row(&["5"]), row(&["x"])]);
        assert_eq!(table.max_id("id"), None);
        assert_eq!(Table::new(cols(&["id"])).max_id("id"), None);
    }

    #[test]
    fn parse_day_accepts_dates_and_timestamps() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(parse_day("2024-03-09"), Some(day));
        assert_eq!(parse_day("2024-03-09 14:22:01"), Some(day));
        assert_eq!(parse_day("2024-03-09T14:22:01Z"), Some(day));
        assert_eq!(parse_day("09/03/2024"), None);
        assert_eq!(parse_day(""), None);
    }

    #[test]
    fn connection_config_defaults_ports() {
        let json = r#"{
            "ssh_route": {"host": "bastion", "user": "ops"},
            "db_route": {"host": "db", "user": "reader", "database": "clinic"}
        }"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert!(!config.use_localhost);
        assert_eq!(config.ssh_route.as_ref().map(|r| r.port), Some(22));
        assert_eq!(config.db_route.port, 3306);
        assert_eq!(config.local_port, 0);
    }
}
