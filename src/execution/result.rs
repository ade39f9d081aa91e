//! Query Result - answer shapes produced by the plan interpreter

use crate::dataset::{date_from_days, format_any_value};
use crate::plan::QueryPlan;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::Serialize;

/// Single value extracted from a 1x1 result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

impl Scalar {
    pub fn from_any_value(value: &AnyValue) -> Self {
        match value {
            AnyValue::Null => Scalar::Null,
            AnyValue::Boolean(b) => Scalar::Bool(*b),
            AnyValue::Int8(i) => Scalar::Int(*i as i64),
            AnyValue::Int16(i) => Scalar::Int(*i as i64),
            AnyValue::Int32(i) => Scalar::Int(*i as i64),
            AnyValue::Int64(i) => Scalar::Int(*i),
            AnyValue::UInt8(u) => Scalar::Int(*u as i64),
            AnyValue::UInt16(u) => Scalar::Int(*u as i64),
            AnyValue::UInt32(u) => Scalar::Int(*u as i64),
            AnyValue::UInt64(u) => match i64::try_from(*u) {
                Ok(i) => Scalar::Int(i),
                Err(_) => Scalar::Float(*u as f64),
            },
            AnyValue::Float32(f) => Scalar::Float(*f as f64),
            AnyValue::Float64(f) => Scalar::Float(*f),
            AnyValue::Date(days) => match date_from_days(*days) {
                Some(date) => Scalar::Date(date),
                None => Scalar::Int(*days as i64),
            },
            other => Scalar::Text(format_any_value(other)),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// What a plan evaluated to.
#[derive(Debug, Clone)]
pub enum QueryAnswer {
    /// One row, one column.
    Scalar { name: String, value: Scalar },
    /// No rows matched; the result columns are kept for display.
    Empty { columns: Vec<String> },
    /// A short table, cut at `max_result_rows` when longer.
    Table {
        frame: DataFrame,
        total_rows: usize,
        truncated: bool,
    },
}

impl QueryAnswer {
    /// Shape a collected frame into an answer, keeping at most `max_rows` rows.
    pub fn from_frame(frame: DataFrame, max_rows: usize) -> Self {
        let columns: Vec<String> = frame.get_column_names().iter().map(|s| s.to_string()).collect();

        if frame.height() == 0 {
            return QueryAnswer::Empty { columns };
        }

        if frame.height() == 1 && frame.width() == 1 {
            let value = frame.get_columns()[0]
                .get(0)
                .map(|v| Scalar::from_any_value(&v))
                .unwrap_or(Scalar::Null);
            return QueryAnswer::Scalar {
                name: columns[0].clone(),
                value,
            };
        }

        let total_rows = frame.height();
        let truncated = total_rows > max_rows;
        let frame = if truncated { frame.head(Some(max_rows)) } else { frame };
        QueryAnswer::Table {
            frame,
            total_rows,
            truncated,
        }
    }

    pub fn scalar(&self) -> Option<&Scalar> {
        match self {
            QueryAnswer::Scalar { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            QueryAnswer::Scalar { name, value } => serde_json::json!({
                "kind": "scalar",
                "name": name,
                "value": value,
            }),
            QueryAnswer::Empty { columns } => serde_json::json!({
                "kind": "empty",
                "columns": columns,
            }),
            QueryAnswer::Table {
                frame,
                total_rows,
                truncated,
            } => serde_json::json!({
                "kind": "table",
                "total_rows": total_rows,
                "truncated": truncated,
                "data": dataframe_to_json(frame),
            }),
        }
    }
}

/// Successful answer to one question.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub request_id: String,
    pub question: String,
    pub plan: QueryPlan,
    pub answer: QueryAnswer,
    /// Time spent interpreting the plan.
    pub execution_time_ms: u64,
    /// Time from question to answer, planning included.
    pub total_time_ms: u64,
}

impl QueryResult {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "request_id": self.request_id,
            "question": self.question,
            "plan": self.plan,
            "answer": self.answer.to_json(),
            "execution_time_ms": self.execution_time_ms,
            "total_time_ms": self.total_time_ms,
        })
    }
}

/// Convert DataFrame to JSON value
pub fn dataframe_to_json(df: &DataFrame) -> serde_json::Value {
    let columns: Vec<String> = df.get_column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = Vec::with_capacity(df.height());

    for row_idx in 0..df.height() {
        let mut row = serde_json::Map::new();
        for series in df.get_columns() {
            let value = series
                .get(row_idx)
                .map(|v| any_value_to_json(&v))
                .unwrap_or(serde_json::Value::Null);
            row.insert(series.name().to_string(), value);
        }
        rows.push(serde_json::Value::Object(row));
    }

    serde_json::json!({
        "rows": rows,
        "columns": columns
    })
}

fn any_value_to_json(value: &AnyValue) -> serde_json::Value {
    match Scalar::from_any_value(value) {
        Scalar::Null => serde_json::Value::Null,
        Scalar::Bool(b) => serde_json::Value::Bool(b),
        Scalar::Int(i) => serde_json::Value::Number(i.into()),
        Scalar::Float(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Scalar::Text(s) => serde_json::Value::String(s),
        Scalar::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
    }
}
