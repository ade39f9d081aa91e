//! Narrative Generator
//!
//! Embeds a serialized view of a table into a single prompt and asks the
//! backend for a management summary. Tables larger than the prompt budget
//! are cut at a row boundary and the result is flagged as truncated.

use crate::config::NarrativeLimits;
use crate::dataset::{header_line, row_line, Dataset};
use crate::error::{AgentError, Result};
use crate::llm::LlmBackend;
use polars::prelude::DataFrame;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const NARRATIVE_SYSTEM_PROMPT: &str = concat!(
    "Você é um assistente que ajuda a administrar uma fazenda ",
    "e realizar trabalhos de escritório."
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NarrativeResult {
    pub text: String,
    pub context: String,
    /// The data had to be reduced to fit the prompt budget.
    pub truncated: bool,
    pub rows_included: usize,
    pub rows_total: usize,
}

/// Table rendered for a prompt, cut at a row boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedTable {
    pub text: String,
    pub rows_included: usize,
    pub rows_total: usize,
}

impl SerializedTable {
    pub fn truncated(&self) -> bool {
        self.rows_included < self.rows_total
    }
}

#[derive(Clone)]
pub struct NarrativeGenerator {
    backend: Arc<dyn LlmBackend>,
    limits: NarrativeLimits,
    timeout: Duration,
}

impl NarrativeGenerator {
    pub fn new(backend: Arc<dyn LlmBackend>, limits: NarrativeLimits, timeout: Duration) -> Self {
        Self {
            backend,
            limits,
            timeout,
        }
    }

    pub async fn summarize(&self, dataset: &Dataset, context: &str) -> Result<NarrativeResult> {
        self.summarize_frame(dataset.frame(), context).await
    }

    /// Summarize any table, e.g. the rows returned by a previous answer.
    ///
    /// Fails without calling the backend when not a single whole row fits
    /// the prompt budget.
    pub async fn summarize_frame(
        &self,
        frame: &DataFrame,
        context: &str,
    ) -> Result<NarrativeResult> {
        let budget = self.limits.max_prompt_chars;
        let table = serialize_rows(frame, budget);
        if table.rows_total == 0 {
            return Err(AgentError::NarrativeBackend("no rows to summarize".to_string()));
        }
        if table.rows_included == 0 {
            return Err(AgentError::NarrativeBackend(format!(
                "data does not fit the prompt budget of {} chars",
                budget
            )));
        }
        if table.truncated() {
            warn!(
                "Narrative data cut to {} of {} rows to fit {} chars",
                table.rows_included, table.rows_total, budget
            );
        }

        let prompt = build_prompt(&table.text, context);
        let backend = Arc::clone(&self.backend);
        let max_tokens = self.limits.max_tokens;
        let call = tokio::spawn(async move {
            backend
                .complete(NARRATIVE_SYSTEM_PROMPT, &prompt, max_tokens)
                .await
        });

        let reply = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => {
                return Err(AgentError::NarrativeBackend(format!(
                    "no reply within {} ms",
                    self.timeout.as_millis()
                )))
            }
            Ok(Err(join_error)) => {
                return Err(AgentError::NarrativeBackend(join_error.to_string()))
            }
            Ok(Ok(Err(backend_error))) => {
                return Err(AgentError::NarrativeBackend(backend_error.to_string()))
            }
            Ok(Ok(Ok(text))) => text,
        };

        let text = cap_chars(reply.trim(), self.limits.max_reply_chars);
        if text.is_empty() {
            return Err(AgentError::NarrativeBackend("empty narrative".to_string()));
        }
        info!("Narrative for '{}' has {} chars", context, text.chars().count());

        Ok(NarrativeResult {
            text,
            context: context.to_string(),
            truncated: table.truncated(),
            rows_included: table.rows_included,
            rows_total: table.rows_total,
        })
    }
}

fn build_prompt(data: &str, context: &str) -> String {
    format!(
        "A seguir estão os dados da fazenda:\n{}\n\n\
         Como um assistente de gestão da fazenda e escritório, \
         crie um resumo narrativo para o contexto de {}, destacando as principais tendências, \
         pontos de atenção e sugestões para melhoria.",
        data,
        context.trim()
    )
}

/// Header plus as many whole rows as fit in `budget` characters. The header
/// counts against the budget; when it alone exceeds it no rows are kept.
pub fn serialize_rows(frame: &DataFrame, budget: usize) -> SerializedTable {
    let mut text = header_line(frame);
    let mut used = text.chars().count();
    let mut rows_included = 0;

    for idx in 0..frame.height() {
        let line = row_line(frame, idx);
        let cost = line.chars().count() + 1;
        if used + cost > budget {
            break;
        }
        text.push('\n');
        text.push_str(&line);
        used += cost;
        rows_included += 1;
    }

    SerializedTable {
        text,
        rows_included,
        rows_total: frame.height(),
    }
}

fn cap_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}
