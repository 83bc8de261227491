//! In-process connector over a fixed [`Table`].
//!
//! Answers page queries from memory using the structured predicate of each
//! [`PageQuery`], records every request, and can be told to fail a given
//! query. Useful for tests and for dry runs against fixture data.

use async_trait::async_trait;
use chrono::NaiveDate;
use encounter_sync_source_models::{Row, Table, parse_day};

use crate::{PageQuery, SourceConnector, SourceError};

/// Connector serving rows from an in-memory table.
#[derive(Debug)]
pub struct MemoryConnector {
    table: Table,
    date_column: String,
    id_column: String,
    queries: Vec<PageQuery>,
    fail_on: Option<usize>,
    open: bool,
    opens: u32,
    closes: u32,
}

impl MemoryConnector {
    /// Creates a connector over `table`, paging on `date_column` and
    /// `id_column`.
    #[must_use]
    pub fn new(table: Table, date_column: &str, id_column: &str) -> Self {
        Self {
            table,
            date_column: date_column.to_string(),
            id_column: id_column.to_string(),
            queries: Vec::new(),
            fail_on: None,
            open: false,
            opens: 0,
            closes: 0,
        }
    }

    /// Creates `days` consecutive days starting at `start`, each with
    /// `per_day` encounters. Ids run from 1 across all days.
    ///
    /// Columns: `id`, `visit_date`, `patient`, `ward`.
    #[must_use]
    pub fn synthetic(start: NaiveDate, days: u32, per_day: u32) -> Self {
        let columns = ["id", "visit_date", "patient", "ward"]
            .iter()
            .map(|c| (*c).to_string())
            .collect();
        let mut table = Table::new(columns);

        let mut id: u64 = 0;
        for (offset, day) in start.iter_days().take(days as usize).enumerate() {
            for minute in 0..per_day {
                id += 1;
                table.push_row(vec![
                    id.to_string(),
                    format!("{} 09:{:02}:00", day.format("%Y-%m-%d"), minute % 60),
                    format!("patient-{id}"),
                    format!("ward-{}", offset % 3),
                ]);
            }
        }

        Self::new(table, "visit_date", "id")
    }

    /// Makes the `n`-th query (1-based, counted over the connector's
    /// lifetime) fail.
    #[must_use]
    pub const fn fail_on_query(mut self, n: usize) -> Self {
        self.fail_on = Some(n);
        self
    }

    /// Adds rows to the upstream table, e.g. to simulate new encounters
    /// arriving between runs.
    pub fn push_rows(&mut self, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            self.table.push_row(row);
        }
    }

    /// Every query received so far, in order.
    #[must_use]
    pub fn queries(&self) -> &[PageQuery] {
        &self.queries
    }

    /// Forgets the recorded queries.
    pub fn clear_queries(&mut self) {
        self.queries.clear();
    }

    /// Whether the connector is currently open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.open
    }

    /// Number of times `open` was called.
    #[must_use]
    pub const fn open_count(&self) -> u32 {
        self.opens
    }

    /// Number of times `close` was called.
    #[must_use]
    pub const fn close_count(&self) -> u32 {
        self.closes
    }
}

fn id_of(row: &Row, idx: usize) -> Option<i64> {
    row.get(idx)?.trim().parse().ok()
}

#[async_trait]
impl SourceConnector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&mut self) -> Result<(), SourceError> {
        self.open = true;
        self.opens += 1;
        Ok(())
    }

    async fn query(&mut self, page: &PageQuery) -> Result<Table, SourceError> {
        self.queries.push(page.clone());

        if !self.open {
            return Err(SourceError::Connection {
                message: "query on a closed connection".to_string(),
            });
        }
        if self.fail_on == Some(self.queries.len()) {
            return Err(SourceError::Query {
                message: format!("injected failure on query {}", self.queries.len()),
            });
        }

        let (Some(date_idx), Some(id_idx)) = (
            self.table.column_index(&self.date_column),
            self.table.column_index(&self.id_column),
        ) else {
            return Err(SourceError::Query {
                message: format!(
                    "table has no `{}`/`{}` columns",
                    self.date_column, self.id_column
                ),
            });
        };

        let mut matching: Vec<(i64, &Row)> = self
            .table
            .rows
            .iter()
            .filter(|row| row.get(date_idx).and_then(|c| parse_day(c)) == Some(page.day))
            .filter_map(|row| id_of(row, id_idx).map(|id| (id, row)))
            .filter(|(id, _)| *id > page.after_id)
            .collect();
        matching.sort_by_key(|(id, _)| *id);

        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        let rows = matching
            .into_iter()
            .take(limit)
            .map(|(_, row)| row.clone())
            .collect();

        Ok(Table::with_rows(self.table.columns.clone(), rows))
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.open = false;
        self.closes += 1;
        Ok(())
    }
}
