//! Plan Interpreter - runs a QueryPlan against a Dataset
//!
//! The plan is checked against the dataset schema, lowered to a polars lazy
//! query over a clone of the shared frame, and collected on a blocking worker
//! under a wall-clock timeout. The cached frame itself is only ever read.

use crate::config::ExecutionLimits;
use crate::dataset::{days_from_date, ColumnKind, Dataset};
use crate::error::{AgentError, Result};
use crate::execution::result::QueryAnswer;
use crate::plan::{AggFunc, Aggregation, CompareOp, DatePart, PlanStep, PlanValue, QueryPlan};
use chrono::NaiveDate;
use polars::prelude::*;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Answer plus timing, before it is wrapped into a `QueryResult`.
#[derive(Debug, Clone)]
pub struct Execution {
    pub answer: QueryAnswer,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PlanExecutor {
    limits: ExecutionLimits,
}

impl PlanExecutor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    /// Evaluate `plan` against `dataset`.
    ///
    /// On timeout the worker is abandoned and whatever it produces later is
    /// dropped; no partial answer is returned.
    pub async fn execute(&self, dataset: &Dataset, plan: &QueryPlan) -> Result<Execution> {
        let resolved = plan.resolve_columns(dataset.schema())?;
        let lazy = lower_plan(dataset.frame().clone().lazy(), plan, &resolved.step_kinds)?;

        let start_time = Instant::now();
        let worker = tokio::task::spawn_blocking(move || lazy.collect());

        let frame = match tokio::time::timeout(self.limits.timeout, worker).await {
            Err(_) => {
                warn!("Plan execution exceeded {:?}; discarding result", self.limits.timeout);
                return Err(AgentError::ExecutionTimeout {
                    timeout_ms: self.limits.timeout.as_millis() as u64,
                });
            }
            Ok(Err(join_error)) => {
                return Err(AgentError::RuntimeFault(format!(
                    "Evaluation worker failed: {}",
                    join_error
                )));
            }
            Ok(Ok(collected)) => collected?,
        };

        let execution_time_ms = start_time.elapsed().as_millis() as u64;
        info!(
            "Plan evaluated to {} rows x {} columns in {} ms",
            frame.height(),
            frame.width(),
            execution_time_ms
        );

        Ok(Execution {
            answer: QueryAnswer::from_frame(frame, self.limits.max_result_rows),
            execution_time_ms,
        })
    }
}

/// Translate the plan steps into a lazy query.
pub fn lower_plan(
    mut lazy: LazyFrame,
    plan: &QueryPlan,
    step_kinds: &[Option<ColumnKind>],
) -> Result<LazyFrame> {
    for (idx, step) in plan.steps.iter().enumerate() {
        debug!("Lowering step {}: {}", idx, step);
        lazy = match step {
            PlanStep::Filter {
                column,
                part,
                cmp,
                value,
            } => {
                let kind = step_kinds
                    .get(idx)
                    .copied()
                    .flatten()
                    .unwrap_or(ColumnKind::Other);
                lazy.filter(filter_expr(column, *part, *cmp, value, kind)?)
            }
            PlanStep::GroupBy { keys, aggregations } => {
                let by: Vec<Expr> = keys.iter().map(|k| col(k)).collect();
                lazy.group_by_stable(by).agg(aggregation_exprs(aggregations))
            }
            PlanStep::Aggregate { aggregations } => lazy.select(aggregation_exprs(aggregations)),
            PlanStep::Select { columns } => {
                let exprs: Vec<Expr> = columns.iter().map(|c| col(c)).collect();
                lazy.select(exprs)
            }
            PlanStep::Sort { column, descending } => lazy.sort(
                [column.as_str()],
                SortMultipleOptions::default()
                    .with_order_descending(*descending)
                    .with_nulls_last(true),
            ),
            PlanStep::Limit { n } => lazy.limit(IdxSize::try_from(*n).unwrap_or(IdxSize::MAX)),
        };
    }
    Ok(lazy)
}

fn aggregation_exprs(aggregations: &[Aggregation]) -> Vec<Expr> {
    aggregations
        .iter()
        .map(|agg| {
            let name = agg.output_name();
            let expr = match (&agg.column, agg.func) {
                (None, _) => len(),
                (Some(c), AggFunc::Sum) => col(c).sum(),
                (Some(c), AggFunc::Mean) => col(c).mean(),
                (Some(c), AggFunc::Median) => col(c).median(),
                (Some(c), AggFunc::Min) => col(c).min(),
                (Some(c), AggFunc::Max) => col(c).max(),
                (Some(c), AggFunc::Count) => col(c).count(),
                (Some(c), AggFunc::CountDistinct) => col(c).n_unique(),
            };
            expr.alias(&name)
        })
        .collect()
}

fn filter_expr(
    column: &str,
    part: Option<DatePart>,
    cmp: CompareOp,
    value: &PlanValue,
    kind: ColumnKind,
) -> Result<Expr> {
    let (target, kind) = match part {
        Some(DatePart::Year) => (col(column).dt().year(), ColumnKind::Numeric),
        Some(DatePart::Month) => (col(column).dt().month(), ColumnKind::Numeric),
        Some(DatePart::Day) => (col(column).dt().day(), ColumnKind::Numeric),
        None => (col(column), kind),
    };

    // Text comparisons ignore case.
    let target = if kind == ColumnKind::String {
        target.str().to_lowercase()
    } else {
        target
    };

    let expr = match cmp {
        CompareOp::In | CompareOp::NotIn => {
            let items = match value {
                PlanValue::List(items) => items.as_slice(),
                single => std::slice::from_ref(single),
            };
            let mut any_of: Option<Expr> = None;
            for item in items {
                let eq = target.clone().eq(literal(item, kind, column)?);
                any_of = Some(match any_of {
                    Some(acc) => acc.or(eq),
                    None => eq,
                });
            }
            let any_of = any_of.unwrap_or_else(|| lit(false));
            if cmp == CompareOp::NotIn {
                any_of.not()
            } else {
                any_of
            }
        }
        CompareOp::Contains => {
            let needle = match value {
                PlanValue::Text(s) => s.trim().to_lowercase(),
                other => other.to_string(),
            };
            target.str().contains_literal(lit(needle))
        }
        CompareOp::Eq => target.eq(literal(value, kind, column)?),
        CompareOp::Ne => target.neq(literal(value, kind, column)?),
        CompareOp::Gt => target.gt(literal(value, kind, column)?),
        CompareOp::Ge => target.gt_eq(literal(value, kind, column)?),
        CompareOp::Lt => target.lt(literal(value, kind, column)?),
        CompareOp::Le => target.lt_eq(literal(value, kind, column)?),
    };
    Ok(expr)
}

/// Convert a plan literal to an expression of the filtered column's kind.
fn literal(value: &PlanValue, kind: ColumnKind, column: &str) -> Result<Expr> {
    let mismatch = || {
        AgentError::RuntimeFault(format!(
            "value {} cannot be compared with {} column '{}'",
            value,
            kind.as_str(),
            column
        ))
    };

    match (kind, value) {
        (ColumnKind::String, PlanValue::Text(s)) => Ok(lit(s.trim().to_lowercase())),
        (ColumnKind::String, PlanValue::Int(i)) => Ok(lit(i.to_string())),
        (ColumnKind::String, PlanValue::Float(f)) => Ok(lit(f.to_string())),
        (ColumnKind::String, PlanValue::Bool(b)) => Ok(lit(b.to_string())),
        (ColumnKind::Numeric, PlanValue::Int(i)) => Ok(lit(*i)),
        (ColumnKind::Numeric, PlanValue::Float(f)) => Ok(lit(*f)),
        (ColumnKind::Numeric, PlanValue::Text(s)) => {
            let cleaned = s.trim().replace(',', ".");
            if let Ok(i) = cleaned.parse::<i64>() {
                Ok(lit(i))
            } else {
                cleaned.parse::<f64>().map(lit).map_err(|_| mismatch())
            }
        }
        (ColumnKind::Date, PlanValue::Text(s)) => {
            let date = parse_date(s).ok_or_else(mismatch)?;
            let days = days_from_date(date).ok_or_else(mismatch)?;
            Ok(lit(days).cast(DataType::Date))
        }
        (ColumnKind::Boolean, PlanValue::Bool(b)) => Ok(lit(*b)),
        (ColumnKind::Boolean, PlanValue::Text(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "sim" | "yes" => Ok(lit(true)),
            "false" | "nao" | "não" | "no" => Ok(lit(false)),
            _ => Err(mismatch()),
        },
        _ => Err(mismatch()),
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(s, fmt).ok())
}
