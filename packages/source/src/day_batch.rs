//! Pages through one calendar day's rows with a forward-only id cursor.
//!
//! Each page asks for `id > cursor ORDER BY id LIMIT page_size`. After every
//! non-empty page the cursor advances to that page's maximum id; the day is
//! exhausted when a page comes back empty. A failed page aborts the day but
//! never discards the rows accumulated before it.

use chrono::NaiveDate;
use encounter_sync_source_models::Table;

use crate::query::QueryTemplate;
use crate::{SourceConnector, SourceError};

/// Result of fetching one day.
#[derive(Debug)]
pub struct DayFetch {
    /// The day that was fetched.
    pub day: NaiveDate,
    /// Rows in arrival order.
    pub rows: Table,
    /// Cursor after the last successful page.
    pub last_id: i64,
    /// Number of page requests issued, including the final empty one.
    pub pages: u32,
    /// Set when the day was aborted part-way.
    pub error: Option<SourceError>,
}

impl DayFetch {
    /// Returns `true` if every page up to the terminating empty page
    /// succeeded.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Fetches whole days from a [`SourceConnector`] one page at a time.
pub struct DayBatchProcessor<'a> {
    template: &'a QueryTemplate,
    page_size: u64,
}

impl<'a> DayBatchProcessor<'a> {
    /// Creates a processor issuing pages of at most `page_size` rows.
    #[must_use]
    pub fn new(template: &'a QueryTemplate, page_size: u64) -> Self {
        Self {
            template,
            page_size: page_size.max(1),
        }
    }

    /// Fetches every row of `day` with an id greater than `resume_id`.
    ///
    /// Never fails outright: a query error is recorded in
    /// [`DayFetch::error`] alongside whatever rows were already fetched.
    pub async fn fetch_day(
        &self,
        connector: &mut dyn SourceConnector,
        day: NaiveDate,
        resume_id: i64,
    ) -> DayFetch {
        let id_column = self.template.id_column();
        let mut rows = Table::default();
        let mut cursor = resume_id;
        let mut pages: u32 = 0;

        let error = loop {
            let page = self.template.page(day, cursor, self.page_size);
            pages += 1;

            let result = match connector.query(&page).await {
                Ok(result) => result,
                Err(e) => break Some(e),
            };

            if result.is_empty() {
                if rows.columns.is_empty() {
                    rows.columns = result.columns;
                }
                break None;
            }

            let Some(page_max) = result.max_id(id_column) else {
                break Some(SourceError::Cursor {
                    message: format!(
                        "page {pages} of {day} has a missing or non-integer `{id_column}` column"
                    ),
                });
            };
            if page_max <= cursor {
                break Some(SourceError::Cursor {
                    message: format!(
                        "page {pages} of {day} did not advance the cursor past {cursor} \
                         (max id {page_max})"
                    ),
                });
            }

            log::debug!(
                "[{}] {day} page {pages}: {} rows, cursor {cursor} -> {page_max}",
                connector.name(),
                result.len(),
            );

            cursor = page_max;
            rows.append(result);
        };

        match &error {
            None => log::info!(
                "[{}] {day}: {} rows in {pages} page(s)",
                connector.name(),
                rows.len()
            ),
            Some(e) => log::warn!(
                "[{}] {day}: aborted after {pages} page(s) with {} rows: {e}",
                connector.name(),
                rows.len()
            ),
        }

        DayFetch {
            day,
            rows,
            last_id: cursor,
            pages,
            error,
        }
    }
}
