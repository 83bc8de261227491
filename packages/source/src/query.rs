//! Page query rendering.
//!
//! A query template is the caller's `SELECT` with an optional
//! `{predicate}` slot. Each page gets the day + id-range predicate and an
//! explicit `ORDER BY <id> LIMIT <n>` suffix.

use chrono::NaiveDate;

use crate::{PageQuery, SourceError};

/// Placeholder replaced by the day + id-range predicate.
pub const PREDICATE_SLOT: &str = "{predicate}";

/// A validated query template plus the columns it is paged on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    template: String,
    date_column: String,
    id_column: String,
}

impl QueryTemplate {
    /// Validates and builds a template.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidTemplate`] if the template is blank or
    /// a column name is not a plain identifier.
    pub fn new(template: &str, date_column: &str, id_column: &str) -> Result<Self, SourceError> {
        let template = template.trim().trim_end_matches(';').trim_end();
        if template.is_empty() {
            return Err(SourceError::InvalidTemplate {
                message: "query template is empty".to_string(),
            });
        }
        validate_identifier(date_column)?;
        validate_identifier(id_column)?;

        Ok(Self {
            template: template.to_string(),
            date_column: date_column.to_string(),
            id_column: id_column.to_string(),
        })
    }

    /// Column holding each row's date.
    #[must_use]
    pub fn date_column(&self) -> &str {
        &self.date_column
    }

    /// Strictly increasing (per day) primary key column.
    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Renders the query for one page.
    #[must_use]
    pub fn render(&self, day: NaiveDate, after_id: i64, limit: u64) -> String {
        let predicate = format!(
            "CAST({date} AS DATE) = DATE '{day}' AND {id} > {after_id}",
            date = self.date_column,
            id = self.id_column,
            day = day.format("%Y-%m-%d"),
        );

        let filtered = if self.template.contains(PREDICATE_SLOT) {
            self.template.replace(PREDICATE_SLOT, &predicate)
        } else {
            format!("SELECT * FROM ({}) AS encounter_page WHERE {predicate}", self.template)
        };

        format!("{filtered} ORDER BY {} LIMIT {limit}", self.id_column)
    }

    /// Builds the [`PageQuery`] for one page.
    #[must_use]
    pub fn page(&self, day: NaiveDate, after_id: i64, limit: u64) -> PageQuery {
        PageQuery {
            sql: self.render(day, after_id, limit),
            day,
            after_id,
            limit,
        }
    }
}

fn validate_identifier(name: &str) -> Result<(), SourceError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');

    if valid {
        Ok(())
    } else {
        Err(SourceError::InvalidTemplate {
            message: format!("{name:?} is not a plain column identifier"),
        })
    }
}
