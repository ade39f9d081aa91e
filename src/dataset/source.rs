//! Byte sources and table parsers
//!
//! The loader reads raw bytes through a [`TabularSource`] and turns them into
//! a `DataFrame` through a [`TableParser`]. Spreadsheets go through calamine,
//! CSV through the polars reader.

use crate::dataset::{days_from_date, format_float};
use crate::error::LoadError;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Readable byte stream identified by a source key.
pub trait TabularSource: Send + Sync {
    fn read(&self, key: &str) -> std::io::Result<Vec<u8>>;

    /// Modification stamp used for optional revalidation.
    fn version(&self, _key: &str) -> Option<SystemTime> {
        None
    }
}

/// Source keys are file-system paths.
#[derive(Debug, Clone, Default)]
pub struct FileSource;

impl TabularSource for FileSource {
    fn read(&self, key: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(key)
    }

    fn version(&self, key: &str) -> Option<SystemTime> {
        std::fs::metadata(key).and_then(|m| m.modified()).ok()
    }
}

/// Turns raw bytes into a table of named, typed columns.
pub trait TableParser: Send + Sync {
    fn parse(&self, key: &str, bytes: Vec<u8>) -> Result<DataFrame, LoadError>;
}

/// Picks the spreadsheet or CSV parser from the key's extension.
#[derive(Debug, Clone, Default)]
pub struct AutoParser {
    pub csv: CsvParser,
    pub spreadsheet: SpreadsheetParser,
}

impl TableParser for AutoParser {
    fn parse(&self, key: &str, bytes: Vec<u8>) -> Result<DataFrame, LoadError> {
        let extension = Path::new(key)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "csv" | "tsv" | "txt" => {
                let parser = if extension == "tsv" {
                    CsvParser { separator: b'\t' }
                } else {
                    self.csv.clone()
                };
                parser.parse(key, bytes)
            }
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => self.spreadsheet.parse(key, bytes),
            other => Err(LoadError::malformed(
                key,
                format!("Unsupported file extension '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvParser {
    pub separator: u8,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self { separator: b',' }
    }
}

impl TableParser for CsvParser {
    fn parse(&self, key: &str, bytes: Vec<u8>) -> Result<DataFrame, LoadError> {
        let separator = self.separator;
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_infer_schema_length(Some(1000))
            .map_parse_options(|opts| opts.with_separator(separator).with_try_parse_dates(true))
            .into_reader_with_file_handle(Cursor::new(bytes))
            .finish()
            .map_err(|e| LoadError::malformed(key, format!("Failed to parse CSV: {}", e)))?;

        ensure_rows(key, df)
    }
}

/// Reads one worksheet; the first row holds the column names.
#[derive(Debug, Clone, Default)]
pub struct SpreadsheetParser {
    /// Worksheet to read; the first one when unset.
    pub sheet: Option<String>,
}

impl TableParser for SpreadsheetParser {
    fn parse(&self, key: &str, bytes: Vec<u8>) -> Result<DataFrame, LoadError> {
        let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
            .map_err(|e| LoadError::malformed(key, format!("Failed to open spreadsheet: {}", e)))?;

        let range = match &self.sheet {
            Some(name) => workbook
                .worksheet_range(name)
                .map_err(|e| {
                    LoadError::malformed(key, format!("Failed to read sheet '{}': {}", name, e))
                })?,
            None => workbook
                .worksheet_range_at(0)
                .ok_or_else(|| LoadError::malformed(key, "Spreadsheet contains no sheets"))?
                .map_err(|e| {
                    LoadError::malformed(key, format!("Failed to read first sheet: {}", e))
                })?,
        };

        let mut rows = range.rows();
        let header = rows
            .next()
            .ok_or_else(|| LoadError::malformed(key, "Sheet has no header row"))?;
        let names = column_names(header);

        let body: Vec<&[Data]> = rows
            .filter(|row| row.iter().any(|cell| !matches!(cell, Data::Empty)))
            .collect();
        debug!("Sheet of {} has {} columns and {} data rows", key, names.len(), body.len());

        let mut columns = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let cells: Vec<&Data> = body
                .iter()
                .map(|row| row.get(idx).unwrap_or(&Data::Empty))
                .collect();
            let series = build_series(name, &cells)
                .map_err(|e| LoadError::malformed(key, format!("Column '{}': {}", name, e)))?;
            columns.push(series);
        }

        let df = DataFrame::new(columns)
            .map_err(|e| LoadError::malformed(key, format!("Failed to build table: {}", e)))?;
        ensure_rows(key, df)
    }
}

fn ensure_rows(key: &str, df: DataFrame) -> Result<DataFrame, LoadError> {
    if df.width() == 0 {
        return Err(LoadError::malformed(key, "Table has no columns"));
    }
    if df.height() == 0 {
        return Err(LoadError::malformed(key, "Table has no data rows"));
    }
    Ok(df)
}

/// Header cells as unique, non-empty column names.
fn column_names(header: &[Data]) -> Vec<String> {
    let mut seen = HashSet::new();
    header
        .iter()
        .enumerate()
        .map(|(idx, cell)| {
            let base = match cell_text(cell) {
                Some(text) if !text.trim().is_empty() => text.trim().to_string(),
                _ => format!("column_{}", idx + 1),
            };
            let mut name = base.clone();
            let mut suffix = 2;
            while !seen.insert(name.clone()) {
                name = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            name
        })
        .collect()
}

/// Infer one column type from all non-empty cells and build the series.
fn build_series(name: &str, cells: &[&Data]) -> PolarsResult<Series> {
    let filled: Vec<&&Data> = cells.iter().filter(|c| !matches!(c, Data::Empty)).collect();

    if !filled.is_empty() && filled.iter().all(|c| matches!(c, Data::Int(_) | Data::Float(_))) {
        let integral = filled.iter().all(|c| match c {
            Data::Int(_) => true,
            Data::Float(f) => f.fract() == 0.0 && f.abs() < 9.0e15,
            _ => false,
        });
        if integral {
            let values: Vec<Option<i64>> = cells
                .iter()
                .map(|c| match c {
                    Data::Int(i) => Some(*i),
                    Data::Float(f) => Some(*f as i64),
                    _ => None,
                })
                .collect();
            return Ok(Series::new(name, values));
        }
        let values: Vec<Option<f64>> = cells
            .iter()
            .map(|c| match c {
                Data::Int(i) => Some(*i as f64),
                Data::Float(f) => Some(*f),
                _ => None,
            })
            .collect();
        return Ok(Series::new(name, values));
    }

    if !filled.is_empty() && filled.iter().all(|c| cell_date(c).is_some()) {
        let days: Vec<Option<i32>> = cells
            .iter()
            .map(|c| cell_date(c).and_then(days_from_date))
            .collect();
        return Series::new(name, days).cast(&DataType::Date);
    }

    if !filled.is_empty() && filled.iter().all(|c| matches!(c, Data::Bool(_))) {
        let values: Vec<Option<bool>> = cells
            .iter()
            .map(|c| match c {
                Data::Bool(b) => Some(*b),
                _ => None,
            })
            .collect();
        return Ok(Series::new(name, values));
    }

    if filled.iter().any(|c| matches!(c, Data::Error(_))) {
        warn!("Column '{}' contains spreadsheet error cells; reading them as null", name);
    }
    let values: Vec<Option<String>> = cells.iter().map(|c| cell_text(c)).collect();
    Ok(Series::new(name, values))
}

/// Excel serial dates count days from 1899-12-30; the Unix epoch is serial 25569.
const EXCEL_UNIX_EPOCH_SERIAL: i64 = 25_569;

fn cell_date(cell: &Data) -> Option<NaiveDate> {
    match cell {
        Data::DateTime(dt) => {
            let days = dt.as_f64().floor() as i64 - EXCEL_UNIX_EPOCH_SERIAL;
            crate::dataset::date_from_days(i32::try_from(days).ok()?)
        }
        Data::DateTimeIso(s) => NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d").ok(),
        _ => None,
    }
}

fn cell_text(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(s.clone()),
        Data::Int(i) => Some(i.to_string()),
        Data::Float(f) => Some(format_float(*f)),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(_) => cell_date(cell).map(|d| d.format("%Y-%m-%d").to_string()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LoadErrorKind;

    #[test]
    fn test_csv_parser_types() {
        let csv = "month,headCount,weight\nJan,10,4500.5\nFeb,20,9000\nMar,30,13500.25\n";
        let df = CsvParser::default().parse("herd.csv", csv.as_bytes().to_vec()).unwrap();
        assert_eq!(df.shape(), (3, 3));
        assert_eq!(df.column("headCount").unwrap().dtype(), &DataType::Int64);
        assert_eq!(df.column("weight").unwrap().dtype(), &DataType::Float64);
    }

    #[test]
    fn test_csv_without_rows_is_malformed() {
        let err = CsvParser::default()
            .parse("empty.csv", b"month,headCount\n".to_vec())
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Malformed);
    }

    #[test]
    fn test_auto_parser_rejects_unknown_extension() {
        let err = AutoParser::default().parse("notes.pdf", b"%PDF".to_vec()).unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Malformed);
    }

    #[test]
    fn test_garbage_spreadsheet_is_malformed() {
        let err = SpreadsheetParser::default()
            .parse("Fazendas.xlsx", b"definitely not a zip archive".to_vec())
            .unwrap_err();
        assert_eq!(err.kind, LoadErrorKind::Malformed);
    }

    #[test]
    fn test_column_names_dedup_and_fill() {
        let header = vec![
            Data::String("FAZENDA".to_string()),
            Data::Empty,
            Data::String("FAZENDA".to_string()),
        ];
        assert_eq!(column_names(&header), vec!["FAZENDA", "column_2", "FAZENDA_2"]);
    }

    #[test]
    fn test_build_series_inference() {
        let ints = [Data::Float(10.0), Data::Int(20), Data::Empty];
        let refs: Vec<&Data> = ints.iter().collect();
        let s = build_series("CABECAS", &refs).unwrap();
        assert_eq!(s.dtype(), &DataType::Int64);
        assert_eq!(s.null_count(), 1);

        let mixed = [Data::Float(1.5), Data::String("n/a".to_string())];
        let refs: Vec<&Data> = mixed.iter().collect();
        assert_eq!(build_series("PESO", &refs).unwrap().dtype(), &DataType::String);

        let dates = [Data::DateTimeIso("2023-12-15T00:00:00".to_string())];
        let refs: Vec<&Data> = dates.iter().collect();
        assert_eq!(build_series("DATA", &refs).unwrap().dtype(), &DataType::Date);
    }
}
