//! Query Plan - closed algebra of table operations
//!
//! The planner asks the language model for a JSON document in this shape and
//! the interpreter only ever walks these variants. Nothing the model returns
//! is evaluated as code.
//!
//! ```json
//! {"steps": [
//!   {"op": "filter", "column": "month", "cmp": "in", "value": ["Jan", "Feb"]},
//!   {"op": "aggregate", "aggregations": [{"func": "sum", "column": "headCount"}]}
//! ]}
//! ```

use crate::config::ExecutionLimits;
use crate::dataset::{ColumnKind, ColumnSchema};
use crate::error::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub steps: Vec<PlanStep>,
    /// Short note from the model on how the steps answer the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanStep {
    /// Keep rows where `column` (or a part of a date column) compares true.
    Filter {
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        part: Option<DatePart>,
        cmp: CompareOp,
        value: PlanValue,
    },
    GroupBy {
        keys: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
    /// Collapse the whole table into one row.
    Aggregate { aggregations: Vec<Aggregation> },
    Select { columns: Vec<String> },
    Sort {
        column: String,
        #[serde(default)]
        descending: bool,
    },
    Limit { n: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(alias = "=", alias = "==")]
    Eq,
    #[serde(alias = "!=", alias = "<>")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    In,
    #[serde(alias = "not in")]
    NotIn,
    Contains,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Contains => "contains",
        }
    }

    fn takes_list(&self) -> bool {
        matches!(self, CompareOp::In | CompareOp::NotIn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePart {
    Year,
    Month,
    Day,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<PlanValue>),
}

impl fmt::Display for PlanValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanValue::Bool(b) => write!(f, "{}", b),
            PlanValue::Int(i) => write!(f, "{}", i),
            PlanValue::Float(x) => write!(f, "{}", x),
            PlanValue::Text(s) => write!(f, "'{}'", s),
            PlanValue::List(items) => {
                let parts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    #[serde(alias = "avg", alias = "average")]
    Mean,
    Median,
    Min,
    Max,
    Count,
    #[serde(alias = "n_unique", alias = "distinct_count")]
    CountDistinct,
}

impl AggFunc {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Mean => "mean",
            AggFunc::Median => "median",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Count => "count",
            AggFunc::CountDistinct => "count_distinct",
        }
    }

    fn needs_numeric(&self) -> bool {
        matches!(self, AggFunc::Sum | AggFunc::Mean | AggFunc::Median)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub func: AggFunc,
    /// Absent only for `count`, which then counts rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn output_name(&self) -> String {
        if let Some(alias) = self.alias.as_ref().filter(|a| !a.trim().is_empty()) {
            return alias.clone();
        }
        match &self.column {
            Some(column) => format!("{}_{}", self.func.as_str(), column),
            None => self.func.as_str().to_string(),
        }
    }

    fn output_kind(&self, input: ColumnKind) -> ColumnKind {
        match self.func {
            AggFunc::Count | AggFunc::CountDistinct => ColumnKind::Numeric,
            AggFunc::Min | AggFunc::Max => input,
            _ => ColumnKind::Numeric,
        }
    }
}

impl QueryPlan {
    /// Structural bounds, checked before anything touches the data.
    pub fn check_bounds(&self, limits: &ExecutionLimits) -> Result<()> {
        if self.steps.is_empty() {
            return Err(AgentError::PlanningFailed("plan has no steps".to_string()));
        }
        if self.steps.len() > limits.max_steps {
            return Err(AgentError::PlanningFailed(format!(
                "plan has {} steps (max: {})",
                self.steps.len(),
                limits.max_steps
            )));
        }

        for step in &self.steps {
            match step {
                PlanStep::Filter { cmp, value, column, .. } => match (cmp.takes_list(), value) {
                    (true, PlanValue::List(items)) => {
                        if items.is_empty() {
                            return Err(AgentError::PlanningFailed(format!(
                                "'{}' filter on {} has an empty list",
                                cmp.symbol(),
                                column
                            )));
                        }
                        if items.len() > limits.max_in_values {
                            return Err(AgentError::PlanningFailed(format!(
                                "'{}' filter on {} has {} values (max: {})",
                                cmp.symbol(),
                                column,
                                items.len(),
                                limits.max_in_values
                            )));
                        }
                        if items.iter().any(|v| matches!(v, PlanValue::List(_))) {
                            return Err(AgentError::PlanningFailed(format!(
                                "nested list in filter on {}",
                                column
                            )));
                        }
                    }
                    (true, _) => {
                        return Err(AgentError::PlanningFailed(format!(
                            "'{}' filter on {} needs a list value",
                            cmp.symbol(),
                            column
                        )))
                    }
                    (false, PlanValue::List(_)) => {
                        return Err(AgentError::PlanningFailed(format!(
                            "'{}' filter on {} needs a single value",
                            cmp.symbol(),
                            column
                        )))
                    }
                    (false, _) => {}
                },
                PlanStep::GroupBy { keys, aggregations } => {
                    if keys.is_empty() || aggregations.is_empty() {
                        return Err(AgentError::PlanningFailed(
                            "group_by needs keys and aggregations".to_string(),
                        ));
                    }
                    check_aggregations(aggregations)?;
                }
                PlanStep::Aggregate { aggregations } => {
                    if aggregations.is_empty() {
                        return Err(AgentError::PlanningFailed(
                            "aggregate without aggregations".to_string(),
                        ));
                    }
                    check_aggregations(aggregations)?;
                }
                PlanStep::Select { columns } if columns.is_empty() => {
                    return Err(AgentError::PlanningFailed("select without columns".to_string()));
                }
                PlanStep::Limit { n } if *n == 0 => {
                    return Err(AgentError::PlanningFailed("limit of zero rows".to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Walk the steps against `schema`.
    ///
    /// Any reference to a column that does not exist at that point of the
    /// pipeline is an `UnknownColumn`; type misuse is a `RuntimeFault`.
    pub fn resolve_columns(&self, schema: &[ColumnSchema]) -> Result<ResolvedPlan> {
        let mut current: Vec<ColumnSchema> = schema.to_vec();
        let mut step_kinds = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let mut step_kind = None;
            match step {
                PlanStep::Filter { column, part, cmp, .. } => {
                    let kind = lookup(&current, column)?;
                    step_kind = Some(kind);
                    if part.is_some() && kind != ColumnKind::Date {
                        return Err(AgentError::RuntimeFault(format!(
                            "date part filter on non-date column '{}'",
                            column
                        )));
                    }
                    if *cmp == CompareOp::Contains && kind != ColumnKind::String {
                        return Err(AgentError::RuntimeFault(format!(
                            "'contains' needs a text column, '{}' is {}",
                            column,
                            kind.as_str()
                        )));
                    }
                }
                PlanStep::GroupBy { keys, aggregations } => {
                    let mut next = Vec::new();
                    for key in keys {
                        next.push(ColumnSchema {
                            name: key.clone(),
                            kind: lookup(&current, key)?,
                        });
                    }
                    next.extend(resolve_aggregations(&current, aggregations)?);
                    current = next;
                }
                PlanStep::Aggregate { aggregations } => {
                    current = resolve_aggregations(&current, aggregations)?;
                }
                PlanStep::Select { columns } => {
                    let mut next = Vec::new();
                    for column in columns {
                        next.push(ColumnSchema {
                            name: column.clone(),
                            kind: lookup(&current, column)?,
                        });
                    }
                    current = next;
                }
                PlanStep::Sort { column, .. } => {
                    lookup(&current, column)?;
                }
                PlanStep::Limit { .. } => {}
            }
            step_kinds.push(step_kind);
        }
        Ok(ResolvedPlan {
            output: current,
            step_kinds,
        })
    }
}

/// Outcome of checking a plan against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    /// Columns of the final result.
    pub output: Vec<ColumnSchema>,
    /// Kind of the filtered column for each filter step, `None` elsewhere.
    pub step_kinds: Vec<Option<ColumnKind>>,
}

fn check_aggregations(aggregations: &[Aggregation]) -> Result<()> {
    for agg in aggregations {
        if agg.column.is_none() && agg.func != AggFunc::Count {
            return Err(AgentError::PlanningFailed(format!(
                "{} aggregation needs a column",
                agg.func.as_str()
            )));
        }
    }
    let mut names: Vec<String> = aggregations.iter().map(|a| a.output_name()).collect();
    names.sort();
    names.dedup();
    if names.len() != aggregations.len() {
        return Err(AgentError::PlanningFailed("duplicate aggregation output names".to_string()));
    }
    Ok(())
}

fn lookup(current: &[ColumnSchema], name: &str) -> Result<ColumnKind> {
    current
        .iter()
        .find(|c| c.name == name)
        .map(|c| c.kind)
        .ok_or_else(|| AgentError::UnknownColumn {
            column: name.to_string(),
            available: current.iter().map(|c| c.name.clone()).collect(),
        })
}

fn resolve_aggregations(
    current: &[ColumnSchema],
    aggregations: &[Aggregation],
) -> Result<Vec<ColumnSchema>> {
    aggregations
        .iter()
        .map(|agg| {
            let input = match &agg.column {
                Some(column) => lookup(current, column)?,
                None => ColumnKind::Numeric,
            };
            if agg.func.needs_numeric() && input != ColumnKind::Numeric {
                return Err(AgentError::RuntimeFault(format!(
                    "{} needs a numeric column, '{}' is {}",
                    agg.func.as_str(),
                    agg.column.as_deref().unwrap_or("*"),
                    input.as_str()
                )));
            }
            Ok(ColumnSchema {
                name: agg.output_name(),
                kind: agg.output_kind(input),
            })
        })
        .collect()
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({})",
            self.func.as_str(),
            self.column.as_deref().unwrap_or("*")
        )
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |aggs: &[Aggregation]| {
            aggs.iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            PlanStep::Filter { column, part, cmp, value } => match part {
                Some(p) => write!(f, "filter {:?}({}) {} {}", p, column, cmp.symbol(), value),
                None => write!(f, "filter {} {} {}", column, cmp.symbol(), value),
            },
            PlanStep::GroupBy { keys, aggregations } => {
                write!(f, "group by {} -> {}", keys.join(", "), join(aggregations.as_slice()))
            }
            PlanStep::Aggregate { aggregations } => {
                write!(f, "aggregate {}", join(aggregations.as_slice()))
            }
            PlanStep::Select { columns } => write!(f, "select {}", columns.join(", ")),
            PlanStep::Sort { column, descending } => {
                write!(f, "sort by {}{}", column, if *descending { " desc" } else { "" })
            }
            PlanStep::Limit { n } => write!(f, "limit {}", n),
        }
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", steps.join(" | "))
    }
}
