//! Query Planner - turns a free-text question into a QueryPlan
//!
//! The backend sees the schema, a few sample rows and the question, and must
//! answer with a JSON plan. Whatever it returns is parsed into the closed
//! plan algebra; anything that does not parse is a planning failure.

use crate::config::{AgentConfig, ExecutionLimits};
use crate::dataset::Dataset;
use crate::error::{AgentError, Result};
use crate::llm::{strip_code_fences, LlmBackend};
use crate::plan::QueryPlan;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

const PLAN_SYSTEM_PROMPT: &str =
    r#"You translate questions about a farm operations table into a JSON query plan.
Respond with ONLY a JSON object, no prose and no markdown:
{"steps": [...], "explanation": "one short sentence"}

Each step is one of:
{"op": "filter", "column": C, "cmp": "=|!=|>|>=|<|<=|in|not_in|contains", "value": V}
{"op": "filter", "column": C, "part": "year|month|day", "cmp": ..., "value": V}  (dates only)
{"op": "group_by", "keys": [C, ...], "aggregations": [A, ...]}
{"op": "aggregate", "aggregations": [A, ...]}
{"op": "select", "columns": [C, ...]}
{"op": "sort", "column": C, "descending": true|false}
{"op": "limit", "n": N}

An aggregation A is {"func": F, "column": C, "alias": "name"} with F one of
sum, mean, median, min, max, count, count_distinct.
"count" without a column counts rows.

Rules:
- Use column names exactly as listed in the schema.
- "in" and "not_in" take a JSON list; every other comparison takes a single value.
- Dates are written as "YYYY-MM-DD".
- Text comparisons ignore case.
- Steps run in order; after group_by or aggregate only the key and alias columns exist.
- End with an aggregate when the question asks for a single number."#;

#[derive(Clone)]
pub struct QueryPlanner {
    backend: Arc<dyn LlmBackend>,
    limits: ExecutionLimits,
    max_tokens: u32,
    sample_rows: usize,
    timeout: Duration,
}

impl QueryPlanner {
    pub fn new(backend: Arc<dyn LlmBackend>, config: &AgentConfig) -> Self {
        Self {
            backend,
            limits: config.execution.clone(),
            max_tokens: config.plan_max_tokens,
            sample_rows: config.sample_rows,
            timeout: config.backend_timeout,
        }
    }

    /// Ask the backend for a plan answering `question` over `dataset`.
    ///
    /// The backend call runs on its own task. If this future is dropped or
    /// times out, the call finishes in the background and its reply is
    /// discarded.
    pub async fn plan(&self, dataset: &Dataset, question: &str) -> Result<QueryPlan> {
        let user_prompt = self.build_prompt(dataset, question);
        debug!("Planner prompt has {} chars", user_prompt.len());

        let backend = Arc::clone(&self.backend);
        let max_tokens = self.max_tokens;
        let call = tokio::spawn(async move {
            backend
                .complete(PLAN_SYSTEM_PROMPT, &user_prompt, max_tokens)
                .await
        });

        let response = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                warn!("Planner backend call exceeded {:?}", self.timeout);
                return Err(AgentError::PlanningFailed(format!(
                    "language model did not answer within {} ms",
                    self.timeout.as_millis()
                )));
            }
            Ok(Err(join_error)) => {
                return Err(AgentError::PlanningFailed(format!(
                    "backend task failed: {}",
                    join_error
                )));
            }
            Ok(Ok(Err(backend_error))) => {
                warn!("Planner backend error: {}", backend_error);
                return Err(AgentError::PlanningFailed(backend_error.to_string()));
            }
            Ok(Ok(Ok(text))) => text,
        };

        let plan = parse_plan(&response)?;
        plan.check_bounds(&self.limits)?;
        info!("Plan: {}", plan);
        Ok(plan)
    }

    pub fn build_prompt(&self, dataset: &Dataset, question: &str) -> String {
        format!(
            "Table '{}' with {} rows.\n\nSchema:\n{}\n\nSample rows:\n{}\n\n\
             Question: {}\n\nJSON plan:",
            dataset.source_key(),
            dataset.height(),
            dataset.describe_schema(),
            dataset.sample_rows(self.sample_rows),
            question.trim()
        )
    }
}

/// Parse a backend reply into a plan.
///
/// Accepts a bare object, a fenced code block, or an object surrounded by
/// prose.
pub fn parse_plan(response: &str) -> Result<QueryPlan> {
    let cleaned = strip_code_fences(response).trim();
    if cleaned.is_empty() {
        return Err(AgentError::PlanningFailed(
            "language model returned an empty plan".to_string(),
        ));
    }

    match serde_json::from_str::<QueryPlan>(cleaned) {
        Ok(plan) => Ok(plan),
        Err(first_error) => {
            let candidate = json_object(cleaned).ok_or_else(|| {
                AgentError::PlanningFailed(format!(
                    "language model reply is not a plan: {}",
                    first_error
                ))
            })?;
            serde_json::from_str::<QueryPlan>(candidate)
                .map_err(|e| AgentError::PlanningFailed(format!("invalid plan: {}", e)))
        }
    }
}

fn json_object(text: &str) -> Option<&str> {
    static OBJECT: OnceLock<Option<Regex>> = OnceLock::new();
    OBJECT
        .get_or_init(|| Regex::new(r"(?s)\{.*\}").ok())
        .as_ref()?
        .find(text)
        .map(|m| m.as_str())
}
