use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a dataset could not be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    /// The source could not be read at all (missing file, permissions, I/O).
    Unreadable,
    /// The bytes were read but do not parse into a table.
    Malformed,
    /// The table parsed but lacks columns the caller requires.
    SchemaMismatch,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} source '{source_key}': {message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub source_key: String,
    pub message: String,
}

impl LoadError {
    pub fn new(
        kind: LoadErrorKind,
        source_key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source_key: source_key.into(),
            message: message.into(),
        }
    }

    pub fn unreadable(source_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Unreadable, source_key, message)
    }

    pub fn malformed(source_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::Malformed, source_key, message)
    }

    pub fn schema_mismatch(source_key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LoadErrorKind::SchemaMismatch, source_key, message)
    }
}

/// Failure reported by a language-model backend. Transport errors, non-2xx
/// statuses, timeouts and malformed bodies all collapse into this one type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("LLM API call failed: {0}")]
    Transport(String),

    #[error("LLM API error ({status}): {body}")]
    Status { status: u16, body: String },

    #[error("LLM call timed out after {0} ms")]
    Timeout(u64),

    #[error("Malformed LLM response: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Dataset load error: {0}")]
    Load(#[from] LoadError),

    #[error("Question is empty")]
    EmptyQuestion,

    #[error("Dataset '{source_key}' has no rows")]
    EmptyDataset { source_key: String },

    #[error("Planning failed: {0}")]
    PlanningFailed(String),

    #[error("Unknown column: {column}")]
    UnknownColumn { column: String, available: Vec<String> },

    #[error("Execution exceeded {timeout_ms} ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Runtime fault: {0}")]
    RuntimeFault(String),

    #[error("Narrative backend error: {0}")]
    NarrativeBackend(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AgentError {
    /// Stable short name of the error kind, used in logs and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Load(_) => "load",
            AgentError::EmptyQuestion => "empty_question",
            AgentError::EmptyDataset { .. } => "empty_dataset",
            AgentError::PlanningFailed(_) => "planning_failed",
            AgentError::UnknownColumn { .. } => "unknown_column",
            AgentError::ExecutionTimeout { .. } => "execution_timeout",
            AgentError::RuntimeFault(_) => "runtime_fault",
            AgentError::NarrativeBackend(_) => "narrative_backend",
            AgentError::Configuration(_) => "configuration",
        }
    }
}

impl From<polars::error::PolarsError> for AgentError {
    fn from(err: polars::error::PolarsError) -> Self {
        AgentError::RuntimeFault(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
