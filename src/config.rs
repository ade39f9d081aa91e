//! Agent configuration
//!
//! The only mandatory option is the language-model credential. Everything
//! else has a default and can be overridden through `FARM_QUERY_*` variables.

use crate::error::{AgentError, Result};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Limits applied while interpreting a query plan.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Wall-clock budget for evaluating one plan.
    pub timeout: Duration,
    /// Rows kept in a table answer; longer results are cut at a row boundary.
    pub max_result_rows: usize,
    /// Maximum number of steps a plan may contain.
    pub max_steps: usize,
    /// Maximum number of literals inside an `in`/`not_in` filter.
    pub max_in_values: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_result_rows: 50,
            max_steps: 12,
            max_in_values: 64,
        }
    }
}

/// Limits applied while building narrative prompts.
#[derive(Debug, Clone)]
pub struct NarrativeLimits {
    /// Characters of serialized table allowed inside one prompt.
    pub max_prompt_chars: usize,
    /// Token cap handed to the backend.
    pub max_tokens: u32,
    /// Characters kept from the backend reply.
    pub max_reply_chars: usize,
}

impl Default for NarrativeLimits {
    fn default() -> Self {
        Self {
            max_prompt_chars: 12_000,
            max_tokens: 500,
            max_reply_chars: 4_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Bound on a single backend round trip.
    pub backend_timeout: Duration,
    /// Token cap for plan synthesis.
    pub plan_max_tokens: u32,
    /// Sample rows shown to the planner alongside the schema.
    pub sample_rows: usize,
    pub execution: ExecutionLimits,
    pub narrative: NarrativeLimits,
    /// Re-read the source when its modification time changes.
    pub revalidate_source: bool,
}

impl AgentConfig {
    /// Build a configuration around an explicit credential.
    ///
    /// An empty credential is rejected so that no agent can be constructed
    /// in a degraded state.
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(AgentError::Configuration(
                "OPENAI_API_KEY is not set; the language model cannot be configured".to_string(),
            ));
        }
        Ok(Self {
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            backend_timeout: Duration::from_secs(60),
            plan_max_tokens: 500,
            sample_rows: 3,
            execution: ExecutionLimits::default(),
            narrative: NarrativeLimits::default(),
            revalidate_source: false,
        })
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(lookup("OPENAI_API_KEY").unwrap_or_default())?;

        if let Some(model) = lookup("OPENAI_MODEL").filter(|m| !m.trim().is_empty()) {
            config.model = model;
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL").filter(|u| !u.trim().is_empty()) {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "FARM_QUERY_BACKEND_TIMEOUT_SECS") {
            config.backend_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FARM_QUERY_EXEC_TIMEOUT_MS") {
            config.execution.timeout = Duration::from_millis(ms);
        }
        if let Some(rows) = parse_var::<usize>(&lookup, "FARM_QUERY_MAX_RESULT_ROWS") {
            config.execution.max_result_rows = rows;
        }
        if let Some(chars) = parse_var::<usize>(&lookup, "FARM_QUERY_MAX_PROMPT_CHARS") {
            config.narrative.max_prompt_chars = chars;
        }
        if let Some(flag) = parse_var::<bool>(&lookup, "FARM_QUERY_REVALIDATE_SOURCE") {
            config.revalidate_source = flag;
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", name, raw);
            None
        }
    }
}
