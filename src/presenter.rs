//! Result Presenter
//!
//! Renders answers, narratives and errors as Portuguese text for the user.
//! Suggested questions go through `QueryAgent::answer` exactly like typed
//! ones.

use crate::agent::QueryAgent;
use crate::dataset::{format_float, header_line, row_line, Dataset};
use crate::error::{AgentError, LoadErrorKind, Result};
use crate::execution::{QueryAnswer, QueryResult, Scalar};
use crate::narrative::NarrativeResult;
use std::sync::Arc;

pub const SUGGESTED_QUESTIONS: [&str; 5] = [
    "QUAL FOI A QUANTIDADE DE BOIS ABATIDOS EM 2023?",
    "QUAL FOI A QUANTIDADE DE BOIS ABATIDOS EM DEZEMBRO DE 2023?",
    "QUAL FOI O PESO TOTAL DOS BOIS ABATIDOS EM DEZEMBRO DE 2023?",
    "QUAL FOI A QUANTIDADE DE BOIS ABATIDOS EM 2024?",
    "QUAL FOI O VALOR FUNRURAL EM 2023?",
];

const CLOSEST_COLUMNS: usize = 3;
const CLOSEST_MIN_SIMILARITY: f64 = 0.4;

pub struct Presenter {
    agent: Arc<QueryAgent>,
}

impl Presenter {
    pub fn new(agent: Arc<QueryAgent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &QueryAgent {
        &self.agent
    }

    pub fn suggested_questions(&self) -> &'static [&'static str] {
        &SUGGESTED_QUESTIONS
    }

    pub async fn ask(&self, question: &str) -> Result<QueryResult> {
        self.agent.answer(question).await
    }

    /// Run suggested question `index`; `None` when there is no such question.
    pub async fn ask_suggested(&self, index: usize) -> Option<Result<QueryResult>> {
        let question = SUGGESTED_QUESTIONS.get(index)?;
        Some(self.agent.answer(question).await)
    }

    /// Rendered text for either outcome of a question.
    pub fn render_outcome(&self, outcome: &Result<QueryResult>) -> String {
        match outcome {
            Ok(result) => render_result(result),
            Err(error) => render_error(error),
        }
    }
}

pub fn render_result(result: &QueryResult) -> String {
    match &result.answer {
        QueryAnswer::Scalar { value, .. } => format!("Resposta: {}", render_scalar(value)),
        QueryAnswer::Empty { .. } => "Resposta: nenhum registro encontrado.".to_string(),
        QueryAnswer::Table {
            frame,
            total_rows,
            truncated,
        } => {
            let mut lines = vec!["Resposta:".to_string(), header_line(frame)];
            lines.extend((0..frame.height()).map(|idx| row_line(frame, idx)));
            if *truncated {
                lines.push(format!("(mostrando {} de {} linhas)", frame.height(), total_rows));
            }
            lines.join("\n")
        }
    }
}

pub fn render_scalar(value: &Scalar) -> String {
    match value {
        Scalar::Null => "sem valor".to_string(),
        Scalar::Bool(true) => "sim".to_string(),
        Scalar::Bool(false) => "não".to_string(),
        Scalar::Int(i) => i.to_string(),
        Scalar::Float(f) => format_float(*f),
        Scalar::Text(s) => s.clone(),
        Scalar::Date(d) => d.format("%d/%m/%Y").to_string(),
    }
}

pub fn render_narrative(narrative: &NarrativeResult) -> String {
    if narrative.truncated {
        format!(
            "{}\n\n(resumo baseado em {} de {} linhas)",
            narrative.text, narrative.rows_included, narrative.rows_total
        )
    } else {
        narrative.text.clone()
    }
}

/// First `rows` rows of the loaded table.
pub fn render_preview(dataset: &Dataset, rows: usize) -> String {
    format!(
        "{} ({} linhas, carregado em {})\n{}",
        dataset.source_key(),
        dataset.height(),
        dataset.loaded_at().format("%d/%m/%Y %H:%M:%S"),
        dataset.sample_rows(rows)
    )
}

/// User-facing message for each error kind.
pub fn render_error(error: &AgentError) -> String {
    match error {
        AgentError::EmptyQuestion => "Por favor, insira uma pergunta.".to_string(),
        AgentError::EmptyDataset { source_key } => format!(
            "Não há registros em '{}' para responder à pergunta.",
            source_key
        ),
        AgentError::Load(load) => {
            let reason = match load.kind {
                LoadErrorKind::Unreadable => "arquivo não encontrado ou ilegível",
                LoadErrorKind::Malformed => "formato de planilha inválido",
                LoadErrorKind::SchemaMismatch => "colunas obrigatórias ausentes",
            };
            format!(
                "Não foi possível carregar os dados de '{}': {} ({}).",
                load.source_key, reason, load.message
            )
        }
        AgentError::PlanningFailed(message) => format!(
            "Erro ao processar a pergunta: não foi possível interpretá-la ({}). \
             Tente reformular.",
            message
        ),
        AgentError::UnknownColumn { column, available } => {
            let closest = closest_columns(column, available);
            if closest.is_empty() {
                format!(
                    "Erro ao processar a pergunta: a coluna '{}' não existe nos dados. \
                     Colunas disponíveis: {}.",
                    column,
                    available.join(", ")
                )
            } else {
                format!(
                    "Erro ao processar a pergunta: a coluna '{}' não existe nos dados. \
                     Você quis dizer: {}?",
                    column,
                    closest.join(", ")
                )
            }
        }
        AgentError::ExecutionTimeout { timeout_ms } => format!(
            "Erro ao processar a pergunta: a consulta excedeu o limite de {} ms.",
            timeout_ms
        ),
        AgentError::RuntimeFault(message) => {
            format!("Erro ao processar a pergunta: {}", message)
        }
        AgentError::NarrativeBackend(message) => {
            format!("Erro ao gerar narrativa: {}", message)
        }
        AgentError::Configuration(message) => format!(
            "Erro: A chave da API OpenAI não foi configurada. \
             Verifique as configurações. ({})",
            message
        ),
    }
}

/// Available columns most similar to `wanted`, best first.
pub fn closest_columns(wanted: &str, available: &[String]) -> Vec<String> {
    let wanted = wanted.to_lowercase();
    let mut scored: Vec<(f64, &String)> = available
        .iter()
        .map(|name| (strsim::normalized_levenshtein(&wanted, &name.to_lowercase()), name))
        .filter(|(score, _)| *score >= CLOSEST_MIN_SIMILARITY)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored
        .into_iter()
        .take(CLOSEST_COLUMNS)
        .map(|(_, name)| name.clone())
        .collect()
}
