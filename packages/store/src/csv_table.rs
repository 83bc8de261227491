//! CSV encoding of [`Table`]s.
//!
//! A valid table file has a header row and rows of exactly the header's
//! width, all UTF-8. Anything else surfaces as an error so callers can
//! treat the file as corrupt.

use std::fs::File;
use std::path::Path;

use encounter_sync_source_models::Table;

use crate::{StoreError, csv_err, io_err};

/// Reads a whole table.
///
/// # Errors
///
/// Returns [`StoreError::Csv`] for missing, ragged or non-UTF-8 files and
/// [`StoreError::Corrupt`] when there is no header row.
pub fn read_table(path: &Path) -> Result<Table, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err(path))?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(csv_err(path))?
        .iter()
        .map(String::from)
        .collect();
    if columns.is_empty() {
        return Err(StoreError::Corrupt {
            path: path.display().to_string(),
            reason: "no header row".to_string(),
        });
    }

    let mut table = Table::new(columns);
    for record in reader.records() {
        let record = record.map_err(csv_err(path))?;
        table.rows.push(record.iter().map(String::from).collect());
    }

    Ok(table)
}

/// Reads only the cells of `column`.
///
/// Returns `Ok(None)` when the header has no such column.
///
/// # Errors
///
/// Returns [`StoreError::Csv`] if the file cannot be parsed.
pub fn read_column(path: &Path, column: &str) -> Result<Option<Vec<String>>, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(csv_err(path))?;

    let Some(idx) = reader
        .headers()
        .map_err(csv_err(path))?
        .iter()
        .position(|h| h == column)
    else {
        return Ok(None);
    };

    let mut values = Vec::new();
    let mut record = csv::StringRecord::new();
    while reader.read_record(&mut record).map_err(csv_err(path))? {
        values.push(record.get(idx).unwrap_or_default().to_string());
    }

    Ok(Some(values))
}

/// Writes `table` to `path` (truncating) and flushes it to disk.
///
/// # Errors
///
/// Returns [`StoreError::Io`] or [`StoreError::Csv`] if writing fails.
pub fn write_table(path: &Path, table: &Table) -> Result<(), StoreError> {
    let file = File::create(path).map_err(io_err(path))?;
    let mut writer = csv::Writer::from_writer(file);

    writer.write_record(&table.columns).map_err(csv_err(path))?;
    for row in &table.rows {
        writer.write_record(row).map_err(csv_err(path))?;
    }

    let file = writer
        .into_inner()
        .map_err(|e| io_err(path)(e.into_error()))?;
    file.sync_all().map_err(io_err(path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scratch_dir, table};

    #[test]
    fn preserves_quotes_commas_and_empty_cells() {
        let dir = scratch_dir("csv");
        let path = dir.join("t.csv");
        let original = Table::with_rows(
            vec!["id".into(), "note".into(), "ward".into()],
            vec![
                vec!["1".into(), "said \"hi\", left".into(), String::new()],
                vec!["2".into(), "multi\nline".into(), "north".into()],
            ],
        );

        write_table(&path, &original).unwrap();
        assert_eq!(read_table(&path).unwrap(), original);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reads_single_column() {
        let dir = scratch_dir("csv_col");
        let path = dir.join("t.csv");
        write_table(&path, &table(&[(1, "2024-01-01"), (2, "2024-01-02")])).unwrap();

        assert_eq!(
            read_column(&path, "visit_date").unwrap(),
            Some(vec!["2024-01-01".to_string(), "2024-01-02".to_string()])
        );
        assert_eq!(read_column(&path, "nope").unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_empty_ragged_and_binary_files() {
        let dir = scratch_dir("csv_bad");

        let empty = dir.join("empty.csv");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(read_table(&empty), Err(StoreError::Corrupt { .. })));

        let ragged = dir.join("ragged.csv");
        std::fs::write(&ragged, b"id,visit_date\n1,2024-01-01\n2\n").unwrap();
        assert!(matches!(read_table(&ragged), Err(StoreError::Csv { .. })));

        let binary = dir.join("binary.csv");
        std::fs::write(&binary, b"id,visit_date\n1,\xff\xfe\n").unwrap();
        assert!(matches!(read_table(&binary), Err(StoreError::Csv { .. })));

        assert!(read_table(&dir.join("missing.csv")).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
