//! Dataset - immutable in-memory snapshot of a tabular source
//!
//! A [`Dataset`] wraps a polars `DataFrame` behind an `Arc`. Queries only
//! ever receive shared references or lazy views of it, so the loaded table
//! is never altered after the cache fill.

pub mod cache;
pub mod source;

pub use cache::DatasetCache;
pub use source::{AutoParser, CsvParser, FileSource, SpreadsheetParser, TableParser, TabularSource};

use chrono::{DateTime, NaiveDate, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;

/// Coarse column type as exposed to the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Date,
    String,
    Boolean,
    Other,
}

impl ColumnKind {
    pub fn from_dtype(dtype: &DataType) -> Self {
        match dtype {
            DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Float32
            | DataType::Float64 => ColumnKind::Numeric,
            DataType::Date | DataType::Datetime(_, _) => ColumnKind::Date,
            DataType::String => ColumnKind::String,
            DataType::Boolean => ColumnKind::Boolean,
            _ => ColumnKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Date => "date",
            ColumnKind::String => "string",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug)]
struct DatasetInner {
    source_key: String,
    frame: DataFrame,
    schema: Vec<ColumnSchema>,
    version: Option<SystemTime>,
    loaded_at: DateTime<Utc>,
}

/// Shared, read-only table. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Dataset {
    inner: Arc<DatasetInner>,
}

impl Dataset {
    pub fn new(
        source_key: impl Into<String>,
        frame: DataFrame,
        version: Option<SystemTime>,
    ) -> Self {
        let schema = frame
            .schema()
            .iter_fields()
            .map(|field| ColumnSchema {
                name: field.name().to_string(),
                kind: ColumnKind::from_dtype(field.data_type()),
            })
            .collect();

        Self {
            inner: Arc::new(DatasetInner {
                source_key: source_key.into(),
                frame,
                schema,
                version,
                loaded_at: Utc::now(),
            }),
        }
    }

    pub fn source_key(&self) -> &str {
        &self.inner.source_key
    }

    pub fn frame(&self) -> &DataFrame {
        &self.inner.frame
    }

    pub fn schema(&self) -> &[ColumnSchema] {
        &self.inner.schema
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.inner.schema.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.inner.schema.iter().map(|c| c.name.clone()).collect()
    }

    pub fn height(&self) -> usize {
        self.inner.frame.height()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.frame.height() == 0 || self.inner.schema.is_empty()
    }

    /// Modification stamp of the source at load time, when the source has one.
    pub fn version(&self) -> Option<SystemTime> {
        self.inner.version
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.inner.loaded_at
    }

    /// True when both handles point at the same cached snapshot.
    pub fn same_snapshot(&self, other: &Dataset) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// One line per column: `name (kind)`.
    pub fn describe_schema(&self) -> String {
        self.inner
            .schema
            .iter()
            .map(|c| format!("- {} ({})", c.name, c.kind.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First `n` rows rendered as a pipe-separated table with a header line.
    pub fn sample_rows(&self, n: usize) -> String {
        let frame = &self.inner.frame;
        let mut lines = vec![header_line(frame)];
        for idx in 0..n.min(frame.height()) {
            lines.push(row_line(frame, idx));
        }
        lines.join("\n")
    }
}

/// Column names joined the same way [`row_line`] joins values.
pub fn header_line(frame: &DataFrame) -> String {
    frame
        .get_column_names()
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Render a single row; nulls become empty cells.
pub fn row_line(frame: &DataFrame, idx: usize) -> String {
    frame
        .get_columns()
        .iter()
        .map(|series| match series.get(idx) {
            Ok(value) => format_any_value(&value),
            Err(_) => String::new(),
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Display form of a cell without the quoting polars applies to strings.
pub fn format_any_value(value: &AnyValue) -> String {
    match value {
        AnyValue::Null => String::new(),
        AnyValue::String(s) => s.to_string(),
        AnyValue::StringOwned(s) => s.to_string(),
        AnyValue::Boolean(b) => b.to_string(),
        AnyValue::Float64(f) => format_float(*f),
        AnyValue::Float32(f) => format_float(*f as f64),
        AnyValue::Date(days) => date_from_days(*days)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| days.to_string()),
        other => other.to_string(),
    }
}

pub fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let rounded = format!("{:.4}", value);
        rounded.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

const UNIX_EPOCH_DATE: (i32, u32, u32) = (1970, 1, 1);

pub fn date_from_days(days: i32) -> Option<NaiveDate> {
    let (y, m, d) = UNIX_EPOCH_DATE;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_signed(chrono::Duration::days(days as i64))
}

pub fn days_from_date(date: NaiveDate) -> Option<i32> {
    let (y, m, d) = UNIX_EPOCH_DATE;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
    i32::try_from((date - epoch).num_days()).ok()
}
